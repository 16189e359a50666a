mod common;

use std::time::Duration;

use common::{Recorder, setup};
use docstore::config::SessionConfig;
use docstore::event::SessionEvent;
use docstore::query::Traits;
use docstore::record::RecordKind;
use docstore::DocstoreError;
use docstore::session::{Session, TransactionState};
use serde_json::{Value, json};

async fn start(config: SessionConfig) -> (Session, Recorder) {
    let (storage, recorder) = setup();
    let session = Session::start(storage, config).await.unwrap();
    (session, recorder)
}

async fn wait_for(recorder: &Recorder, call: &str) {
    for _ in 0..100 {
        if recorder.calls().iter().any(|c| c == call) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{call} never happened: {:?}", recorder.calls());
}

fn document(id: &str, content: Value) -> Value {
    json!({
        "id": id,
        "created": "2024-01-01T00:00:00Z",
        "modified": "2024-01-01T00:00:00Z",
        "type": "User",
        "content": content
    })
}

#[tokio::test]
async fn inactivity_rolls_back_once() {
    let config = SessionConfig::default().with_timeout(Duration::from_millis(50));
    let (session, recorder) = start(config).await;
    let mut events = session.events();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no timeout event")
        .unwrap();
    assert_eq!(event, SessionEvent::Timeout);
    assert_eq!(session.state(), TransactionState::Rollback);
    wait_for(&recorder, "rollback").await;

    assert!(session.commit().await.unwrap_err().is_state());
    assert!(session.execute("select 1", vec![]).await.unwrap_err().is_state());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(events.try_recv().is_err());
    // the connection goes back right after the rollback
    assert_eq!(recorder.calls(), vec!["begin", "rollback", "disconnect"]);
    assert!(session.disconnect().await.unwrap_err().is_state());
}

#[tokio::test]
async fn activity_pushes_the_deadline() {
    let config = SessionConfig::default().with_timeout(Duration::from_millis(300));
    let (session, recorder) = start(config).await;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.execute("select 1", vec![]).await.unwrap();
    }
    assert_eq!(session.state(), TransactionState::Open);
    session.commit().await.unwrap();
    assert!(!recorder.calls().contains(&"rollback".to_string()));
}

#[tokio::test]
async fn expiry_during_a_call_fails_the_call() {
    let config = SessionConfig::default().with_timeout(Duration::from_millis(50));
    let (session, recorder) = start(config).await;
    recorder.slow_queries(Duration::from_millis(200));
    let error = session.execute("select pg_sleep(1)", vec![]).await.unwrap_err();
    assert!(error.is_state(), "{error}");
    wait_for(&recorder, "rollback").await;
}

#[tokio::test]
async fn terminal_states_refuse_everything() {
    let (session, recorder) = start(SessionConfig::default()).await;
    session.commit().await.unwrap();
    assert_eq!(session.state(), TransactionState::Commit);

    assert!(session.commit().await.unwrap_err().is_state());
    assert!(session.rollback().await.unwrap_err().is_state());
    assert!(session.disconnect().await.unwrap_err().is_state());
    assert!(session.read(RecordKind::Document, "d1").await.unwrap_err().is_state());
    assert!(session.subscribe("User").await.unwrap_err().is_state());
    assert_eq!(recorder.calls(), vec!["begin", "commit", "disconnect"]);
}

#[tokio::test]
async fn rollback_releases_the_connection() {
    let (session, recorder) = start(SessionConfig::default()).await;
    session.rollback().await.unwrap();
    assert_eq!(recorder.calls(), vec!["begin", "rollback", "disconnect"]);
}

#[tokio::test]
async fn failed_commit_keeps_the_session_open() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.refuse_commits(true);
    let error = session.commit().await.unwrap_err();
    assert!(matches!(error, DocstoreError::Execution(_)), "{error}");
    assert_eq!(session.state(), TransactionState::Open);

    session.execute("select 1", vec![]).await.unwrap();
    recorder.refuse_commits(false);
    session.commit().await.unwrap();
    assert_eq!(session.state(), TransactionState::Commit);
    assert_eq!(
        recorder.calls(),
        vec!["begin", "commit", "select 1", "commit", "disconnect"]
    );
}

#[tokio::test]
async fn failed_commit_can_be_rolled_back() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.refuse_commits(true);
    assert!(session.commit().await.is_err());
    session.rollback().await.unwrap();
    assert_eq!(session.state(), TransactionState::Rollback);
    assert_eq!(recorder.calls(), vec!["begin", "commit", "rollback", "disconnect"]);
}

#[tokio::test]
async fn failed_commit_leaves_the_watchdog_armed() {
    let config = SessionConfig::default().with_timeout(Duration::from_millis(100));
    let (session, recorder) = start(config).await;
    let mut events = session.events();
    recorder.refuse_commits(true);
    assert!(session.commit().await.is_err());

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no timeout event")
        .unwrap();
    assert_eq!(event, SessionEvent::Timeout);
    wait_for(&recorder, "disconnect").await;
    assert_eq!(session.state(), TransactionState::Rollback);
    assert_eq!(recorder.calls(), vec!["begin", "commit", "rollback", "disconnect"]);
}

#[tokio::test]
async fn disconnect_releases_the_connection() {
    let (session, recorder) = start(SessionConfig::default()).await;
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), TransactionState::Disconnect);
    assert_eq!(recorder.calls().last().map(String::as_str), Some("disconnect"));
}

#[tokio::test]
async fn results_queue_in_order() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![json!({"a": 1}), json!({"a": 2})]);
    session.execute("select a from t", vec![]).await.unwrap();
    recorder.answer(vec![json!({"a": 1}), json!({"a": 2})]);
    session.execute("select a from t", vec![]).await.unwrap();
    session.execute("select a from t where false", vec![]).await.unwrap();
    assert_eq!(session.pending().unwrap(), 3);

    assert!(session.fetch_single().is_err());
    // the refused result stays at the front
    assert_eq!(session.pending().unwrap(), 3);
    assert_eq!(session.fetch_first().unwrap(), Some(json!({"a": 1})));
    assert_eq!(session.fetch_first().unwrap(), Some(json!({"a": 1})));
    assert_eq!(session.fetch_single().unwrap(), None);
    assert_eq!(session.fetch().unwrap(), None);
}

#[tokio::test]
async fn search_decodes_and_caches_entities() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![document("d1", json!({"name": "Ada"}))]);
    let found = session
        .search(RecordKind::Document, &json!({"$id": "d1"}), &Traits::default())
        .await
        .unwrap();
    assert_eq!(found[0]["name"], json!("Ada"));
    assert_eq!(found[0]["type"], json!("User"));
    assert!(found[0].get("content").is_none());
    assert_eq!(recorder.last_params(), vec![json!("d1")]);
    assert!(recorder.queries()[0].starts_with("SELECT \"id\" AS \"id\""));

    assert_eq!(session.cached("d1").unwrap().unwrap()["name"], json!("Ada"));
    assert_eq!(session.fetch().unwrap(), Some(found));
}

#[tokio::test]
async fn type_schemas_are_looked_up_once() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![json!({
        "id": "t1",
        "created": "2024-01-01T00:00:00Z",
        "modified": "2024-01-01T00:00:00Z",
        "name": "User",
        "schema": {"properties": {"age": {"type": "number"}}},
        "meta": {}
    })]);
    recorder.answer(vec![document("d1", json!({"age": 3}))]);
    let found = session
        .search_documents("User", &json!({"age": 3}), &Traits::default())
        .await
        .unwrap();
    assert_eq!(found.as_array().map(Vec::len), Some(1));
    let queries = recorder.queries();
    assert!(queries[0].contains("FROM \"type\""));
    assert!(queries[1].contains("::numeric"), "{}", queries[1]);
    assert_eq!(recorder.last_params(), vec![json!("User"), json!("age"), json!(3)]);

    session
        .search_documents("User", &Value::Null, &Traits::default())
        .await
        .unwrap();
    let type_queries = recorder
        .queries()
        .iter()
        .filter(|q| q.contains("FROM \"type\""))
        .count();
    assert_eq!(type_queries, 1);
}

#[tokio::test]
async fn create_type_primes_the_cache() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![json!({
        "id": "t1", "name": "User", "schema": {"properties": {}}, "meta": {}
    })]);
    let created = session
        .create_type("User", json!({"properties": {}}), Value::Null)
        .await
        .unwrap();
    assert_eq!(created["name"], json!("User"));
    assert_eq!(session.get_type("User").await.unwrap(), Some(created));
    assert_eq!(recorder.queries().len(), 1);
    assert!(recorder.queries()[0].starts_with("INSERT INTO \"type\""));
}

#[tokio::test]
async fn create_document_assigns_an_identity() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![document("d1", json!({"name": "Ada"}))]);
    session
        .create_document("User", json!({"name": "Ada"}))
        .await
        .unwrap();
    assert_eq!(
        recorder.queries()[0],
        "INSERT INTO \"document\" (\"content\", \"id\", \"type\") VALUES ($1::jsonb, $2, $3) RETURNING *"
    );
    let params = recorder.last_params();
    assert_eq!(params[0], json!("{\"name\":\"Ada\"}"));
    assert_eq!(params[1].as_str().map(str::len), Some(36));
    assert_eq!(params[2], json!("User"));
}

#[tokio::test]
async fn update_writes_only_changed_columns() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![document("d1", json!({"name": "Ada"}))]);
    let unchanged = session
        .update(RecordKind::Document, json!({"id": "d1", "name": "Ada"}))
        .await
        .unwrap();
    assert_eq!(unchanged["name"], json!("Ada"));
    assert_eq!(recorder.queries().len(), 1);

    recorder.answer(vec![document("d1", json!({"name": "Ada"}))]);
    recorder.answer(vec![document("d1", json!({"name": "Bea"}))]);
    let updated = session
        .update(RecordKind::Document, json!({"id": "d1", "name": "Bea"}))
        .await
        .unwrap();
    assert_eq!(updated["name"], json!("Bea"));
    assert_eq!(
        recorder.queries().last().unwrap(),
        "UPDATE \"document\" SET \"content\" = $1::jsonb WHERE \"id\" = $2 RETURNING *"
    );
    assert_eq!(recorder.last_params(), vec![json!("{\"name\":\"Bea\"}"), json!("d1")]);

    let missing = session
        .update(RecordKind::Document, json!({"id": "nope", "name": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(missing, docstore::DocstoreError::NotFound(_)));
    assert_eq!(session.state(), TransactionState::Open);
}

#[tokio::test]
async fn delete_reports_removal() {
    let (session, recorder) = start(SessionConfig::default()).await;
    recorder.answer(vec![json!({"id": "d1"})]);
    assert!(session.delete(RecordKind::Document, "d1").await.unwrap());
    assert!(!session.delete(RecordKind::Document, "d1").await.unwrap());
    assert_eq!(session.fetch().unwrap(), Some(json!(true)));
    assert_eq!(session.fetch().unwrap(), Some(json!(false)));
}

#[tokio::test]
async fn subscriptions_toggle_listening() {
    let (session, recorder) = start(SessionConfig::default()).await;
    session.subscribe("User").await.unwrap();
    session.subscribe("User#").await.unwrap();
    assert!(recorder.is_listening("tcnuser"));
    assert_eq!(session.subscriptions("User").unwrap(), 2);
    let listens = recorder.calls().iter().filter(|c| *c == "listen tcnuser").count();
    assert_eq!(listens, 1);

    session.unsubscribe("User").await.unwrap();
    assert!(recorder.is_listening("tcnuser"));
    session.unsubscribe("User").await.unwrap();
    assert!(!recorder.is_listening("tcnuser"));
    // subscriptions do not queue results
    assert_eq!(session.pending().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscriptions_alternate_listen_and_unlisten() {
    let (session, recorder) = start(SessionConfig::default()).await;
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    session.subscribe("User").await.unwrap();
                    session.unsubscribe("User#").await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    let signals: Vec<String> = recorder
        .calls()
        .into_iter()
        .filter(|c| c.ends_with(" tcnuser"))
        .collect();
    assert!(!signals.is_empty());
    for (n, signal) in signals.iter().enumerate() {
        let expected = if n % 2 == 0 { "listen tcnuser" } else { "unlisten tcnuser" };
        assert_eq!(signal, expected, "{signals:?}");
    }
    assert!(!recorder.is_listening("tcnuser"));
    assert_eq!(session.subscriptions("User").unwrap(), 0);
}

#[tokio::test]
async fn notifications_become_change_events() {
    let (session, recorder) = start(SessionConfig::default()).await;
    let mut events = session.events();
    session.subscribe("User#documentCreated").await.unwrap();

    recorder.notify("tcnuser", "\"document\",U,\"id\"='d9'");
    recorder.notify("tcnuser", "\"document\",I,\"id\"='d9'");
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no change event")
        .unwrap();
    match event {
        SessionEvent::Change(change) => {
            assert_eq!(change.event.to_string(), "User#d9@documentCreated");
            assert_eq!(change.subscription.to_string(), "User#documentCreated");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn timings_cover_the_transaction() {
    let config = SessionConfig::default().with_timing(true);
    let (session, _recorder) = start(config).await;
    session.execute("select 1", vec![json!(1)]).await.unwrap();
    session.subscribe("User").await.unwrap();
    session.commit().await.unwrap();

    let timings = session.timings().unwrap();
    let names: Vec<&str> = timings.iter().map(|t| t.event.as_str()).collect();
    assert_eq!(names, vec!["execute", "subscribe", "commit", "transaction", "transaction:server"]);
    assert_eq!(timings[0].query.as_deref(), Some("select 1"));
    assert_eq!(timings[4].duration_ms, timings[0].duration_ms);

    let serialized = serde_json::to_value(&timings[0]).unwrap();
    assert_eq!(serialized["params"], json!([1]));
    assert!(serde_json::to_value(&timings[1]).unwrap().get("query").is_none());
}

#[tokio::test]
async fn timings_are_off_by_default() {
    let (session, _recorder) = start(SessionConfig::default()).await;
    session.execute("select 1", vec![]).await.unwrap();
    session.rollback().await.unwrap();
    assert!(session.timings().unwrap().is_empty());
}
