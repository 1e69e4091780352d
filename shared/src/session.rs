use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

use crate::cache::RecordCache;
use crate::capabilities::{RemoteConnector, RemoteProxy};
use crate::model::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a login is already in progress")]
    AlreadyAuthenticating,

    #[error("already signed in; log out first")]
    AlreadyAuthenticated,

    #[error("no login in progress")]
    NotAuthenticating,
}

/// Who the remote store will see as the caller.
#[derive(Clone, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    Authenticated {
        principal: OwnerId,
        token: Arc<SecretString>,
    },
}

impl Identity {
    #[must_use]
    pub fn principal(&self) -> Option<&OwnerId> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated { principal, .. } => Some(principal),
        }
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Authenticated { principal, .. } => f
                .debug_struct("Authenticated")
                .field("principal", &principal.fingerprint())
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginPhase {
    #[default]
    Idle,
    Authenticating,
}

/// Published view of the session. `epoch` is the cache epoch this identity's
/// writes belong to.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub identity: Identity,
    pub phase: LoginPhase,
    pub proxy: Option<RemoteProxy>,
    pub epoch: u64,
}

impl SessionSnapshot {
    #[must_use]
    pub const fn proxy_ready(&self) -> bool {
        self.proxy.is_some()
    }
}

/// Explicitly passed session object. Every identity change flushes the record
/// cache before the new snapshot is published.
pub struct Session {
    state: watch::Sender<SessionSnapshot>,
    connector: Arc<dyn RemoteConnector>,
    cache: Arc<RecordCache>,
    transitions: Mutex<()>,
}

impl Session {
    pub fn new(connector: Arc<dyn RemoteConnector>, cache: Arc<RecordCache>) -> Self {
        let identity = Identity::Anonymous;
        let proxy = RemoteProxy::new(connector.connect(&identity), None);
        let (state, _) = watch::channel(SessionSnapshot {
            identity,
            phase: LoginPhase::Idle,
            proxy: Some(proxy),
            epoch: 0,
        });
        Self {
            state,
            connector,
            cache,
            transitions: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// `None` while a login is being resolved.
    #[must_use]
    pub fn proxy(&self) -> Option<RemoteProxy> {
        self.state.borrow().proxy.clone()
    }

    #[must_use]
    pub fn principal(&self) -> Option<OwnerId> {
        self.state.borrow().identity.principal().cloned()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    #[instrument(skip(self))]
    pub async fn begin_login(&self) -> Result<(), SessionError> {
        let _guard = self.transitions.lock().await;
        let current = self.snapshot();
        if current.phase == LoginPhase::Authenticating {
            return Err(SessionError::AlreadyAuthenticating);
        }
        if current.identity.is_authenticated() {
            return Err(SessionError::AlreadyAuthenticated);
        }

        self.state.send_modify(|s| {
            s.phase = LoginPhase::Authenticating;
            s.proxy = None;
        });
        info!("login started");
        Ok(())
    }

    #[instrument(skip(self, token), fields(principal = %principal.fingerprint()))]
    pub async fn complete_login(
        &self,
        principal: OwnerId,
        token: SecretString,
    ) -> Result<(), SessionError> {
        let _guard = self.transitions.lock().await;
        if self.snapshot().phase != LoginPhase::Authenticating {
            warn!("login completion without a pending login");
            return Err(SessionError::NotAuthenticating);
        }

        let identity = Identity::Authenticated {
            principal: principal.clone(),
            token: Arc::new(token),
        };
        self.publish(identity, Some(principal)).await;
        info!("login completed");
        Ok(())
    }

    /// Abandons a pending login and returns to the anonymous identity.
    #[instrument(skip(self))]
    pub async fn fail_login(&self) -> Result<(), SessionError> {
        let _guard = self.transitions.lock().await;
        if self.snapshot().phase != LoginPhase::Authenticating {
            return Err(SessionError::NotAuthenticating);
        }

        self.publish(Identity::Anonymous, None).await;
        warn!("login failed; session is anonymous");
        Ok(())
    }

    /// Always ends anonymous and idle with an empty cache, whatever the prior state.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        let _guard = self.transitions.lock().await;
        self.publish(Identity::Anonymous, None).await;
        info!("logged out");
    }

    async fn publish(&self, identity: Identity, caller: Option<OwnerId>) {
        let epoch = self.cache.flush().await;
        let proxy = RemoteProxy::new(self.connector.connect(&identity), caller);
        self.state.send_replace(SessionSnapshot {
            identity,
            phase: LoginPhase::Idle,
            proxy: Some(proxy),
            epoch,
        });
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Discriminator, QueryKey, RecordKind};
    use crate::config::SyncConfig;
    use crate::testing::InMemoryBackend;
    use secrecy::ExposeSecret;

    fn session() -> Session {
        let cache = Arc::new(RecordCache::new(&SyncConfig::default()));
        Session::new(Arc::new(InMemoryBackend::new()), cache)
    }

    fn token(raw: &str) -> SecretString {
        SecretString::new(raw.to_string())
    }

    #[tokio::test]
    async fn test_starts_anonymous_with_proxy() {
        let session = session();
        let snapshot = session.snapshot();
        assert!(!snapshot.identity.is_authenticated());
        assert_eq!(snapshot.phase, LoginPhase::Idle);
        assert!(snapshot.proxy_ready());
    }

    #[tokio::test]
    async fn test_login_lifecycle() {
        let session = session();

        session.begin_login().await.unwrap();
        assert_eq!(session.snapshot().phase, LoginPhase::Authenticating);
        assert!(session.proxy().is_none());

        session
            .complete_login(OwnerId::new("u1"), token("t1"))
            .await
            .unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, LoginPhase::Idle);
        assert_eq!(session.principal(), Some(OwnerId::new("u1")));
        assert_eq!(
            snapshot.proxy.as_ref().and_then(RemoteProxy::caller),
            Some(&OwnerId::new("u1"))
        );
        match snapshot.identity {
            Identity::Authenticated { token, .. } => assert_eq!(token.expose_secret(), "t1"),
            Identity::Anonymous => panic!("expected an authenticated identity"),
        }
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_rejected() {
        let session = session();
        assert_eq!(
            session.complete_login(OwnerId::new("u1"), token("t")).await,
            Err(SessionError::NotAuthenticating)
        );
        assert_eq!(session.fail_login().await, Err(SessionError::NotAuthenticating));

        session.begin_login().await.unwrap();
        assert_eq!(
            session.begin_login().await,
            Err(SessionError::AlreadyAuthenticating)
        );
        session
            .complete_login(OwnerId::new("u1"), token("t"))
            .await
            .unwrap();
        assert_eq!(
            session.begin_login().await,
            Err(SessionError::AlreadyAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_fail_login_restores_anonymous_proxy() {
        let session = session();
        session.begin_login().await.unwrap();
        session.fail_login().await.unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, LoginPhase::Idle);
        assert!(snapshot.proxy_ready());
        assert!(session.principal().is_none());
    }

    #[tokio::test]
    async fn test_logout_flushes_before_publishing() {
        let session = session();
        session.begin_login().await.unwrap();
        session
            .complete_login(OwnerId::new("u1"), token("t"))
            .await
            .unwrap();
        let key = QueryKey::new(RecordKind::Profile, Discriminator::Caller);
        session.cache().write(key.clone(), Arc::new(1_u8)).await;
        let epoch_before = session.snapshot().epoch;

        let mut rx = session.subscribe();
        let _ = rx.borrow_and_update();
        session.logout().await;

        assert!(rx.has_changed().unwrap());
        assert!(session.cache().read(&key).await.is_none());
        assert_ne!(session.snapshot().epoch, epoch_before);
        assert_eq!(session.snapshot().epoch, session.cache().epoch().await);
        assert!(!session.snapshot().identity.is_authenticated());
    }

    #[test]
    fn test_debug_does_not_leak_token_or_owner() {
        let identity = Identity::Authenticated {
            principal: OwnerId::new("alice@example.com"),
            token: Arc::new(token("super-secret")),
        };
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("alice@example.com"));
    }
}
