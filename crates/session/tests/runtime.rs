mod common;

use std::sync::Arc;

use common::{Script, ScriptedProvider, memory_store, png, user};
use parley_llm::LlmProvider;
use parley_session::{
    ControllerConfig, ControllerStatus, MessageBody, SessionClient, SessionController,
    SessionError, SubmitOutcome,
};
use parley_storage::SqliteStorage;

#[tokio::test]
async fn streamed_turn_is_published_to_subscribers() {
    let (_, store) = memory_store();
    let provider = ScriptedProvider::new([Script::Manual]);
    let mut client = SessionClient::start(common::controller(&store, &provider), user("alice"))
        .await
        .expect("start");

    let outcome = client.submit_turn("hi").await.expect("submit");
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));

    let model = client.render_model();
    assert!(model.is_awaiting_response);
    assert_eq!(model.status, ControllerStatus::Submitting);
    assert_eq!(model.messages[1].body, MessageBody::Pending);

    let stream = provider.take_manual();
    stream.delta("Hel");
    let model = client
        .wait_for(|model| matches!(model.messages[1].body, MessageBody::Partial(_)))
        .await
        .expect("partial");
    assert_eq!(model.messages[1].body.text(), "Hel");

    stream.delta("lo");
    stream.done();
    let model = client
        .wait_for(|model| !model.is_awaiting_response)
        .await
        .expect("completed");
    assert_eq!(
        model.messages[1].body,
        MessageBody::Complete("Hello".to_string())
    );

    client.shutdown().await;
    assert_eq!(store.load(&user("alice")).len(), 2);
}

#[tokio::test]
async fn commands_are_applied_while_streaming() {
    let (_, store) = memory_store();
    let provider = ScriptedProvider::new([Script::Manual]);
    let client = SessionClient::start(common::controller(&store, &provider), user("alice"))
        .await
        .expect("start");

    client.submit_turn("hi").await.expect("submit");
    assert_eq!(client.add_attachments(vec![png("a.png")]).await.expect("add"), 1);
    assert_eq!(client.render_model().pending_attachments.len(), 1);
    assert!(client.remove_attachment(0).await.expect("remove"));

    assert!(client.cancel_response().await.expect("cancel"));
    assert!(!client.cancel_response().await.expect("second cancel"));

    let model = client.render_model();
    assert!(!model.is_awaiting_response);
    assert!(model.pending_attachments.is_empty());
    assert_eq!(model.messages.len(), 2);

    assert_eq!(client.delete_message_pair(1).await.expect("delete"), 2);
    assert!(client.render_model().messages.is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn switching_users_loads_their_history() {
    let (_, store) = memory_store();
    let provider = ScriptedProvider::new([Script::Reply(vec!["ok"])]);
    let mut client = SessionClient::start(common::controller(&store, &provider), user("alice"))
        .await
        .expect("start");

    client.submit_turn("hi").await.expect("submit");
    client
        .wait_for(|model| !model.is_awaiting_response)
        .await
        .expect("completed");

    client.switch_user(user("bob")).await.expect("switch");
    let model = client.render_model();
    assert_eq!(model.user_id.as_deref(), Some("bob"));
    assert!(model.messages.is_empty());

    client.switch_user(user("alice")).await.expect("switch back");
    assert_eq!(client.render_model().messages.len(), 2);

    client.clear_history().await.expect("clear");
    assert!(client.render_model().messages.is_empty());

    client.shutdown().await;
    assert!(store.load(&user("alice")).is_empty());
}

#[tokio::test]
async fn start_without_provider_reports_unavailable() {
    let (_, store) = memory_store();
    let controller = SessionController::new(ControllerConfig::default(), store, None);

    let result = SessionClient::start(controller, user("alice")).await;
    assert!(matches!(
        result,
        Err(SessionError::ProviderUnavailable { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn sqlite_history_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database = dir.path().join("conversations.db");
    let database = database.to_str().expect("utf-8 path");

    let provider = ScriptedProvider::new([Script::Reply(vec!["Hello"])]);
    let backend = Arc::new(SqliteStorage::open(database).await.expect("open"));
    let store = Arc::new(parley_session::SessionStore::new(backend));
    let mut client = SessionClient::start(common::controller(&store, &provider), user("alice"))
        .await
        .expect("start");

    client.submit_turn("hi").await.expect("submit");
    client
        .wait_for(|model| !model.is_awaiting_response)
        .await
        .expect("completed");
    client.shutdown().await;
    drop(store);

    let backend = Arc::new(SqliteStorage::open(database).await.expect("reopen"));
    let store = Arc::new(parley_session::SessionStore::new(backend));
    let provider: Arc<dyn LlmProvider> = provider;
    let mut controller =
        SessionController::new(ControllerConfig::default(), store, Some(provider));
    controller.initialize(user("alice")).await.expect("initialize");

    let texts = controller
        .history()
        .iter()
        .map(|message| message.text.as_str())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["hi", "Hello"]);
}
