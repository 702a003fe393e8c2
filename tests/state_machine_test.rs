mod test_utils;

use accord_node::connection::ConnectionState;
use accord_node::error::ProcessingError;
use accord_node::message::MessageType;
use accord_node::pipeline::process_message;
use test_utils::*;

#[tokio::test]
async fn owner_open_creates_a_request_sent_connection() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let outcome = process_message(
        &node.ctx,
        &owner_open("msg:o1", "participant:1", "participant:remote", PEER_NODE),
    )
    .await
    .unwrap();

    assert!(outcome.committed);
    let connection_id = outcome.connection_id.unwrap();
    let connection = node
        .ctx
        .connections
        .snapshot(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::RequestSent);
    assert_eq!(connection.participant_id, "participant:1");
    assert_eq!(
        connection.remote_participant_id.as_deref(),
        Some("participant:remote")
    );
    assert_eq!(connection.remote_node_id.as_deref(), Some(PEER_NODE));
}

#[tokio::test]
async fn peer_open_creates_a_request_received_connection() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let outcome = process_message(
        &node.ctx,
        &peer_open(
            "msg:p1",
            "participant:remote",
            "conn:remote",
            PEER_NODE,
            "participant:1",
        ),
    )
    .await
    .unwrap();

    assert!(outcome.committed);
    let connection = node
        .ctx
        .connections
        .snapshot(&outcome.connection_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::RequestReceived);
    assert_eq!(
        connection.remote_connection_id.as_deref(),
        Some("conn:remote")
    );
}

#[tokio::test]
async fn open_handshake_reaches_connected() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let opened = process_message(
        &node.ctx,
        &peer_open(
            "msg:p1",
            "participant:remote",
            "conn:remote",
            PEER_NODE,
            "participant:1",
        ),
    )
    .await
    .unwrap();
    let connection_id = opened.connection_id.unwrap();

    let accepted = process_message(
        &node.ctx,
        &owner_open_on("msg:o1", "participant:1", "participant:remote", &connection_id),
    )
    .await
    .unwrap();

    assert!(accepted.committed);
    let connection = node
        .ctx
        .connections
        .snapshot(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::Connected);
}

#[tokio::test]
async fn conversation_on_pending_connection_is_rejected_without_state_change() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let opened = process_message(
        &node.ctx,
        &owner_open("msg:o1", "participant:1", "participant:remote", PEER_NODE),
    )
    .await
    .unwrap();
    let connection_id = opened.connection_id.unwrap();

    let err = process_message(
        &node.ctx,
        &owner_chat("msg:c1", "participant:1", "participant:remote", &connection_id),
    )
    .await
    .unwrap_err();

    match err {
        ProcessingError::IllegalMessageForState {
            state,
            message_type,
            ..
        } => {
            assert_eq!(state, ConnectionState::RequestSent);
            assert_eq!(message_type, MessageType::ConnectionMessage);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // stored state is untouched
    let connection = node
        .ctx
        .connections
        .snapshot(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::RequestSent);
    // and the rejected message never reached the ledger
    assert!(node.ctx.ledger.lookup("msg:c1").await.unwrap().is_none());
}

#[tokio::test]
async fn closed_connection_rejects_everything() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let opened = process_message(
        &node.ctx,
        &owner_open("msg:o1", "participant:1", "participant:remote", PEER_NODE),
    )
    .await
    .unwrap();
    let connection_id = opened.connection_id.unwrap();

    process_message(
        &node.ctx,
        &owner_close("msg:x1", "participant:1", "participant:remote", &connection_id),
    )
    .await
    .unwrap();

    for message in [
        owner_close("msg:x2", "participant:1", "participant:remote", &connection_id),
        owner_open_on("msg:o2", "participant:1", "participant:remote", &connection_id),
        owner_chat("msg:c1", "participant:1", "participant:remote", &connection_id),
    ] {
        let err = process_message(&node.ctx, &message).await.unwrap_err();
        assert!(
            matches!(err, ProcessingError::IllegalMessageForState { .. }),
            "expected IllegalMessageForState, got {err:?}"
        );
    }
    let connection = node
        .ctx
        .connections
        .snapshot(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::Closed);
}

#[tokio::test]
async fn hinted_connection_promotes_on_owner_open() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let hinted = process_message(
        &node.ctx,
        &hint("msg:h1", "participant:1", "participant:suggested", PEER_NODE),
    )
    .await
    .unwrap();
    let connection_id = hinted.connection_id.unwrap();
    let connection = node
        .ctx
        .connections
        .snapshot(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::Suggested);

    let promoted = process_message(
        &node.ctx,
        &owner_open_on(
            "msg:o1",
            "participant:1",
            "participant:suggested",
            &connection_id,
        ),
    )
    .await
    .unwrap();
    assert!(promoted.committed);

    let connection = node
        .ctx
        .connections
        .snapshot(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state, ConnectionState::RequestSent);
}

#[tokio::test]
async fn unknown_connection_is_rejected() {
    let node = test_node();
    seed_participant(&node, "participant:1", "app:a", &["listener:a1"]).await;

    let err = process_message(
        &node.ctx,
        &owner_chat("msg:c1", "participant:1", "participant:remote", "conn:nope"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ProcessingError::UnknownConnection(_)));
}
