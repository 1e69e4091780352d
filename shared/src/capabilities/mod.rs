mod location;
mod remote;

pub use self::location::{
    acquire_position, LocationError, LocationProvider, Position, PositionRequest,
};
pub use self::remote::{RemoteConnector, RemoteError, RemoteProxy, RemoteStore};
