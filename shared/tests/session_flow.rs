use medisync::query::{
    DrugInteractionsQuery, EmergencyCaseQuery, MyEmergenciesQuery, PrescriptionsQuery,
    PriceHistoryQuery, ProfileQuery,
};
use medisync::mutation::{RequestAmbulance, SavePrescription};
use medisync::testing::InMemoryBackend;
use medisync::tools::{self, ProfileDraft};
use medisync::{
    Coordinate, DisabledReason, OwnerId, QueryKey, QueryState, RecordKind, SyncClient, SyncConfig,
    SyncError,
};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

fn client_for(backend: &InMemoryBackend) -> Arc<SyncClient> {
    Arc::new(SyncClient::new(Arc::new(backend.clone()), SyncConfig::default()).unwrap())
}

async fn login(client: &SyncClient, owner: &str) {
    client.session().begin_login().await.unwrap();
    client
        .session()
        .complete_login(OwnerId::new(owner), SecretString::new(format!("token-{owner}")))
        .await
        .unwrap();
}

#[tokio::test]
async fn identity_change_never_exposes_previous_records() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    let alice = OwnerId::new("alice");

    // 1. Alice stores and reads a prescription
    login(&client, "alice").await;
    client
        .mutate(&SavePrescription {
            owner: alice.clone(),
            raw_text: "Atorvastatin 10mg".into(),
            analysis: "statin".into(),
        })
        .await
        .unwrap();
    let listed = client
        .fetch_query(&PrescriptionsQuery::for_owner(&alice))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!client.cache().is_empty().await);

    // 2. Logout empties the cache before anything else can read it
    client.session().logout().await;
    assert!(client.cache().is_empty().await);

    // 3. Bob cannot reach Alice's records through the cache or the gate
    login(&client, "bob").await;
    assert!(client.cache().is_empty().await);
    assert_eq!(
        client
            .fetch_query(&PrescriptionsQuery::for_owner(&alice))
            .await
            .unwrap(),
        None
    );
    let bobs = client
        .fetch_query(&PrescriptionsQuery::for_owner(&OwnerId::new("bob")))
        .await
        .unwrap()
        .unwrap();
    assert!(bobs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn fetch_started_before_logout_does_not_repopulate_cache() {
    let backend = InMemoryBackend::new();
    backend.set_latency(Duration::from_millis(100));
    let client = client_for(&backend);
    login(&client, "alice").await;

    let reader = Arc::clone(&client);
    let pending = tokio::spawn(async move {
        reader
            .fetch_query(&PrescriptionsQuery::for_owner(&OwnerId::new("alice")))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.session().logout().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SyncError::FetchAbandoned { .. })));
    assert!(client.cache().is_empty().await);
    assert_eq!(client.metrics().stale_writes_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn polling_runs_only_while_enabled() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "alice").await;

    // 1. The case list polls every 5s
    let mut cases = client.watch(MyEmergenciesQuery);
    cases
        .wait_for(|s| matches!(s, QueryState::Ready { .. }))
        .await
        .unwrap();
    let after_first = backend.calls("list_my_cases");
    tokio::time::sleep(Duration::from_millis(15_500)).await;
    assert_eq!(backend.calls("list_my_cases"), after_first + 3);

    // 2. Logging out disables it and the timer stops
    client.session().logout().await;
    let state = cases.wait_for(QueryState::is_disabled).await.unwrap();
    assert!(matches!(state, QueryState::Disabled(DisabledReason::IdentityAbsent)));
    let frozen = backend.calls("list_my_cases");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.calls("list_my_cases"), frozen);

    // 3. Signing back in re-enables it
    login(&client, "alice").await;
    cases
        .wait_for(|s| matches!(s, QueryState::Ready { .. }))
        .await
        .unwrap();
    assert!(backend.calls("list_my_cases") > frozen);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_subscription_stops_its_timer() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "alice").await;
    let case_id = client
        .mutate(&RequestAmbulance {
            location: Coordinate::new(12.97, 77.59).unwrap(),
        })
        .await
        .unwrap()
        .unwrap();

    let mut case = client.watch(EmergencyCaseQuery::new(&case_id));
    case.wait_for(|s| s.data().is_some_and(Option::is_some))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(6_500)).await;
    let polled = backend.calls("get_case");
    assert!(polled >= 3);

    case.unsubscribe();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.calls("get_case"), polled);
}

#[tokio::test(start_paused = true)]
async fn clearing_the_watched_case_pauses_polling_until_restored() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "alice").await;
    let case_id = client
        .mutate(&RequestAmbulance {
            location: Coordinate::new(12.97, 77.59).unwrap(),
        })
        .await
        .unwrap()
        .unwrap();

    let (query_tx, query_rx) = tokio::sync::watch::channel(EmergencyCaseQuery::new(&case_id));
    let mut case = client.watch_with(query_rx);
    case.wait_for(|s| s.data().is_some_and(Option::is_some))
        .await
        .unwrap();

    // 1. No case id: the binding disables and stops calling get_case
    query_tx.send_replace(EmergencyCaseQuery { case_id: None });
    let state = case.wait_for(QueryState::is_disabled).await.unwrap();
    assert!(matches!(
        state,
        QueryState::Disabled(DisabledReason::DiscriminatorUnknown)
    ));
    let paused = backend.calls("get_case");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.calls("get_case"), paused);

    // 2. Restoring the id resumes polling
    query_tx.send_replace(EmergencyCaseQuery::new(&case_id));
    let state = case
        .wait_for(|s| s.data().is_some_and(Option::is_some))
        .await
        .unwrap();
    assert_eq!(state.data().unwrap().as_ref().unwrap().id, case_id);
    tokio::time::sleep(Duration::from_millis(9_500)).await;
    assert!(backend.calls("get_case") >= paused + 3);
}

#[tokio::test]
async fn watched_case_list_picks_up_new_dispatch() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "alice").await;

    let mut cases = client.watch(MyEmergenciesQuery);
    cases
        .wait_for(|s| s.data().is_some_and(Vec::is_empty))
        .await
        .unwrap();

    client
        .mutate(&RequestAmbulance {
            location: Coordinate::new(19.07, 72.87).unwrap(),
        })
        .await
        .unwrap();

    let state = cases
        .wait_for(|s| s.data().is_some_and(|c| c.len() == 1))
        .await
        .unwrap();
    let case = &state.data().unwrap()[0];
    assert_eq!(case.owner_id, OwnerId::new("alice"));
    assert!((case.latitude - 19.07).abs() < 1e-9);
}

#[tokio::test]
async fn interaction_check_is_saved_to_history() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "u1").await;
    let owner = OwnerId::new("u1");

    let report = tools::check_and_record(&client, &["Aspirin", "Warfarin"])
        .await
        .unwrap();
    assert_eq!(report.warnings.len(), 1);

    let history = client
        .fetch_query(&DrugInteractionsQuery::for_owner(&owner))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].medications, vec!["Aspirin", "Warfarin"]);
    assert_eq!(history[0].summary, report.summary());
}

#[tokio::test]
async fn history_save_failure_does_not_block_the_tool() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "u1").await;
    let owner = OwnerId::new("u1");
    let history = PriceHistoryQuery::for_owner(&owner);
    client.fetch_query(&history).await.unwrap();
    backend.fail_operation("save_price_comparison");

    let links = tools::compare_and_record(&client, "Paracetamol").await.unwrap();
    assert_eq!(links.len(), 3);
    assert_eq!(backend.calls("save_price_comparison"), 1);

    let entry = client
        .cache()
        .read(&QueryKey::owner(RecordKind::PriceHistory, &owner))
        .await
        .unwrap();
    assert!(entry.is_fresh());
    assert_eq!(client.fetch_query(&history).await.unwrap(), Some(vec![]));
}

#[tokio::test]
async fn anonymous_tools_skip_history() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);

    tools::check_and_record(&client, &["Aspirin", "Warfarin", "Metformin"])
        .await
        .unwrap();
    tools::compare_and_record(&client, "Metformin").await.unwrap();

    assert_eq!(backend.calls("save_drug_interaction"), 0);
    assert_eq!(backend.calls("save_price_comparison"), 0);
}

#[tokio::test]
async fn first_login_prompts_for_profile_until_saved() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "asha").await;

    // 1. No profile yet
    let mut profile = client.watch(ProfileQuery);
    let state = profile
        .wait_for(|s| matches!(s, QueryState::Ready { .. }))
        .await
        .unwrap();
    assert!(tools::needs_profile_setup(true, &state));

    // 2. Saving it refreshes the binding
    let draft = ProfileDraft {
        name: " Asha Rao ".into(),
        email: "asha@example.org".into(),
    };
    assert!(draft.submit(&client).await.unwrap());

    let state = profile
        .wait_for(|s| s.data().is_some_and(Option::is_some))
        .await
        .unwrap();
    assert!(!tools::needs_profile_setup(true, &state));
    let saved = state.data().unwrap().as_ref().unwrap();
    assert_eq!(saved.name, "Asha Rao");
}

#[tokio::test]
async fn failed_profile_save_is_returned() {
    let backend = InMemoryBackend::new();
    let client = client_for(&backend);
    login(&client, "asha").await;
    backend.fail_operation("save_profile");

    let draft = ProfileDraft {
        name: "Asha".into(),
        email: String::new(),
    };
    let err = draft.submit(&client).await.unwrap_err();
    assert!(matches!(
        err,
        tools::ToolError::Sync(SyncError::RemoteCallFailed { operation: "save_profile", .. })
    ));
}
