use std::sync::Arc;
use std::time::Duration;

use resource_manager::{Connector, Credentials, InMemoryCluster, InMemoryConnector};
use session_manager::clients::ClientCache;
use session_manager::config::SessionSettings;
use session_manager::controller::{
    ControllerDeps, PollStatus, SessionController, StartRequest, PENDING_RECHECK_ATTEMPTS,
    PENDING_RECHECK_INTERVAL, TOKEN_ENV,
};
use session_manager::error::ControllerError;
use session_manager::pool::BlockingPool;
use session_manager::session::{SessionKey, SubmissionState};
use session_manager::sleeper::TokioSleeper;
use session_manager::store::{FileStore, InMemoryStore, SessionStore};

fn deps(connector: Arc<InMemoryConnector>, store: Arc<dyn SessionStore>) -> ControllerDeps {
    let pool = BlockingPool::new(4);
    ControllerDeps {
        settings: Arc::new(SessionSettings::default()),
        credentials: Credentials::new(Some("hub".into()), None),
        clients: Arc::new(ClientCache::new(connector as Arc<dyn Connector>, pool.clone())),
        pool,
        store,
        sleeper: Arc::new(TokioSleeper),
    }
}

fn start_request(token: &str) -> StartRequest {
    StartRequest {
        token: token.into(),
        ..StartRequest::default()
    }
}

async fn wait_for(ctl: &SessionController, done: impl Fn(&SubmissionState) -> bool) {
    while !done(&ctl.session().submission()) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_the_same_application() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new();
    let key = SessionKey::default_server("alice");

    let first = Arc::new(SessionController::new(
        key.clone(),
        deps(
            Arc::new(InMemoryConnector::new(cluster.clone())),
            Arc::new(FileStore::new(dir.path())),
        ),
    ));
    first.restore().await.unwrap();
    let start = {
        let ctl = first.clone();
        tokio::spawn(async move { ctl.start(start_request("tok")).await })
    };
    wait_for(&first, |s| matches!(s, SubmissionState::Submitted(_))).await;
    first.session().register_port(8888);
    let endpoint = start.await.unwrap().unwrap();
    assert_eq!((endpoint.host.as_str(), endpoint.port), ("localhost", 8888));
    let app_id = first.session().submission().app_id().cloned().unwrap();
    drop(first);

    // new process: fresh connections, fresh store handle, same directory
    let connector = Arc::new(InMemoryConnector::new(cluster.clone()));
    let second = SessionController::new(
        key.clone(),
        deps(connector.clone(), Arc::new(FileStore::new(dir.path()))),
    );
    second.restore().await.unwrap();
    assert_eq!(
        second.session().submission(),
        SubmissionState::Submitted(app_id.clone())
    );
    assert_eq!(second.poll().await.unwrap(), PollStatus::Running);
    assert_eq!(cluster.submit_calls(), 1);
    assert_eq!(connector.connections(), 1);

    second.stop().await.unwrap();
    assert_eq!(cluster.killed(), vec![app_id]);
    let record = FileStore::new(dir.path())
        .load(&key.storage_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.app_id, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_submission_kills_the_new_application() {
    let cluster = InMemoryCluster::new();
    cluster.set_submit_latency(Duration::from_millis(300));
    let ctl = Arc::new(SessionController::new(
        SessionKey::new("dave", "lab"),
        deps(Arc::new(InMemoryConnector::new(cluster.clone())), InMemoryStore::new()),
    ));

    let start = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.start(start_request("tok")).await })
    };
    wait_for(&ctl, |s| matches!(s, SubmissionState::Pending(_))).await;
    ctl.stop().await.unwrap();

    let killed = cluster.killed();
    assert_eq!(killed.len(), 1);
    assert_eq!(cluster.submit_calls(), 1);
    assert_eq!(ctl.session().submission(), SubmissionState::Unsubmitted);
    assert!(matches!(
        start.await.unwrap(),
        Err(ControllerError::Stopped { app_id }) if app_id == killed[0]
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submission_outliving_stop_is_killed_when_it_lands() {
    let cluster = InMemoryCluster::new();
    cluster.set_submit_latency(Duration::from_millis(2500));
    let ctl = Arc::new(SessionController::new(
        SessionKey::default_server("erin"),
        deps(Arc::new(InMemoryConnector::new(cluster.clone())), InMemoryStore::new()),
    ));

    let start = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.start(start_request("tok")).await })
    };
    wait_for(&ctl, |s| matches!(s, SubmissionState::Pending(_))).await;
    ctl.stop().await.unwrap();
    assert_eq!(ctl.session().submission(), SubmissionState::Unsubmitted);
    assert_eq!(cluster.kill_calls(), 0);

    let result = start.await.unwrap();
    assert!(matches!(result, Err(ControllerError::Stopped { .. })));
    assert_eq!(cluster.killed().len(), 1);
    assert_eq!(ctl.session().submission(), SubmissionState::Unsubmitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_submission_cannot_take_over_a_newer_start() {
    let cluster = InMemoryCluster::new();
    cluster.set_submit_latency(Duration::from_millis(2500));
    let store = InMemoryStore::new();
    let ctl = Arc::new(SessionController::new(
        SessionKey::default_server("gina"),
        deps(Arc::new(InMemoryConnector::new(cluster.clone())), store.clone()),
    ));

    let first = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.start(start_request("tok-a")).await })
    };
    wait_for(&ctl, |s| matches!(s, SubmissionState::Pending(_))).await;
    ctl.stop().await.unwrap();
    assert_eq!(ctl.session().submission(), SubmissionState::Unsubmitted);

    let second = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.start(start_request("tok-b")).await })
    };
    wait_for(&ctl, |s| matches!(s, SubmissionState::Pending(_))).await;

    // the first submission lands while the second is still in flight
    let orphan = match first.await.unwrap() {
        Err(ControllerError::Stopped { app_id }) => app_id,
        other => panic!("expected the first start to be stopped, got {other:?}"),
    };
    assert_eq!(cluster.killed(), vec![orphan.clone()]);
    assert!(matches!(
        ctl.session().submission(),
        SubmissionState::Pending(_)
    ));

    wait_for(&ctl, |s| matches!(s, SubmissionState::Submitted(_))).await;
    let app_id = ctl.session().submission().app_id().cloned().unwrap();
    assert_ne!(app_id, orphan);
    ctl.session().register_port(9999);
    let endpoint = second.await.unwrap().unwrap();
    assert_eq!(endpoint.port, 9999);

    assert_eq!(cluster.killed(), vec![orphan]);
    let specs = cluster.submitted_specs();
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[1].master.env[TOKEN_ENV], "tok-b");
    assert!(ctl.session().token_matches("tok-b"));
    assert!(!ctl.session().token_matches("tok-a"));
    assert_eq!(store.get("gina").unwrap().app_id, app_id.to_string());
}

#[tokio::test(start_paused = true)]
async fn stuck_pending_stop_waits_the_full_bound() {
    let cluster = InMemoryCluster::new();
    let ctl = SessionController::new(
        SessionKey::default_server("frank"),
        deps(Arc::new(InMemoryConnector::new(cluster.clone())), InMemoryStore::new()),
    );
    ctl.session()
        .set_submission(SubmissionState::Pending(ctl.session().next_attempt()));

    let begun = tokio::time::Instant::now();
    ctl.stop().await.unwrap();
    let bound = PENDING_RECHECK_INTERVAL * PENDING_RECHECK_ATTEMPTS as u32;
    let waited = begun.elapsed();
    assert!(waited >= bound && waited < bound + Duration::from_millis(50), "{waited:?}");
    assert_eq!(cluster.kill_calls(), 0);
    assert_eq!(ctl.session().submission(), SubmissionState::Unsubmitted);
}
