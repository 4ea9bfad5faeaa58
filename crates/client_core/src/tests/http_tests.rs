use super::*;
use crate::StaticTokenProvider;
use axum::{
    extract::Path,
    http::HeaderMap,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use shared::domain::ClientMessageId;
use std::sync::Mutex as StdMutex;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn media_token_is_exchanged_for_room_and_bearer() {
    let seen = Arc::new(StdMutex::new(None::<(String, Value)>));
    let seen_in_handler = seen.clone();
    let app = Router::new().route(
        "/api/livekit-token",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let seen = seen_in_handler.clone();
            async move {
                *seen.lock().expect("lock") = Some((bearer(&headers), body));
                Json(json!({ "token": "lk-abc" }))
            }
        }),
    );
    let base = serve(app).await;

    let provider = HttpMediaTokenProvider::new(format!("{base}/api/livekit-token"));
    let token = provider
        .fetch_media_token("app-token", &RoomId::from("R1"))
        .await
        .expect("token");

    assert_eq!(token, "lk-abc");
    let (auth, body) = seen.lock().expect("lock").clone().expect("request seen");
    assert_eq!(auth, "Bearer app-token");
    assert_eq!(body, json!({ "room": "R1" }));
}

#[tokio::test]
async fn media_token_error_body_becomes_error_text() {
    let app = Router::new().route(
        "/api/livekit-token",
        post(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized: invalid session" })),
            )
        }),
    );
    let base = serve(app).await;

    let err = HttpMediaTokenProvider::new(format!("{base}/api/livekit-token"))
        .fetch_media_token("stale", &RoomId::from("R1"))
        .await
        .expect_err("rejected");
    let text = err.to_string();
    assert!(text.contains("401"), "{text}");
    assert!(text.contains("Unauthorized: invalid session"), "{text}");
}

fn graphql_store(base: &str) -> GraphqlHistoryStore {
    GraphqlHistoryStore::new(
        format!("{base}/graphql"),
        Arc::new(StaticTokenProvider::new(Some("app-token".into()))),
    )
}

#[tokio::test]
async fn history_maps_stored_messages_and_synthesizes_missing_ids() {
    let app = Router::new().route(
        "/graphql",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            assert_eq!(bearer(&headers), "Bearer app-token");
            assert_eq!(body["variables"]["chatRoomId"], "R1");
            Json(json!({
                "data": { "getMessages": [{
                    "chatRoomId": "R1",
                    "ChatRoomsMessages": [
                        { "_id": "m1", "userId": "A", "type": "TEXT", "content": "hi",
                          "createdAt": "2024-05-01T10:00:00Z" },
                        { "userId": "B", "type": "IMAGE", "content": "https://cdn/x.png",
                          "createdAt": "1714557660000" }
                    ]
                }]}
            }))
        }),
    );
    let base = serve(app).await;

    let history = graphql_store(&base)
        .fetch_history(&RoomId::from("R1"))
        .await
        .expect("history");

    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, MessageId::from("m1"));
    assert_eq!(history[0].created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    assert_eq!(history[1].id, MessageId::from("B-1714557660000"));
    assert_eq!(history[1].kind, MessageKind::Image);
    assert_eq!(history[1].created_at.timestamp_millis(), 1_714_557_660_000);
}

#[tokio::test]
async fn empty_history_is_not_an_error() {
    let app = Router::new().route(
        "/graphql",
        post(|| async { Json(json!({ "data": { "getMessages": [] } })) }),
    );
    let base = serve(app).await;

    let history = graphql_store(&base)
        .fetch_history(&RoomId::from("R1"))
        .await
        .expect("history");
    assert!(history.is_empty());
}

#[tokio::test]
async fn graphql_errors_are_reported() {
    let app = Router::new().route(
        "/graphql",
        post(|| async { Json(json!({ "data": null, "errors": [{ "message": "room not found" }] })) }),
    );
    let base = serve(app).await;

    let err = graphql_store(&base)
        .fetch_history(&RoomId::from("R404"))
        .await
        .expect_err("error");
    assert!(err.to_string().contains("room not found"));
}

#[tokio::test]
async fn created_message_is_the_newest_with_our_body() {
    let app = Router::new().route(
        "/graphql",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["variables"]["type"], "TEXT");
            assert_eq!(body["variables"]["content"], "hello");
            Json(json!({
                "data": { "createMessage": {
                    "chatRoomId": "R1",
                    "ChatRoomsMessages": [
                        { "_id": "m1", "userId": "A", "type": "TEXT", "content": "hello",
                          "createdAt": "2024-05-01T10:00:00Z" },
                        { "_id": "m2", "userId": "B", "type": "TEXT", "content": "yo",
                          "createdAt": "2024-05-01T10:00:30Z" },
                        { "_id": "m3", "userId": "A", "type": "TEXT", "content": "hello",
                          "createdAt": "2024-05-01T10:01:00Z" }
                    ]
                }}
            }))
        }),
    );
    let base = serve(app).await;

    let client_id = ClientMessageId::from("c-1");
    let created = graphql_store(&base)
        .create_message(&OutboundMessage {
            room_id: RoomId::from("R1"),
            sender_id: UserId::from("A"),
            kind: MessageKind::Text,
            content: "hello".into(),
            client_message_id: Some(client_id.clone()),
        })
        .await
        .expect("created")
        .expect("message in response");

    assert_eq!(created.id, MessageId::from("m3"));
    assert_eq!(created.client_message_id, Some(client_id));
}

#[tokio::test]
async fn room_metadata_lists_participants() {
    let app = Router::new().route(
        "/graphql",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["variables"]["id"], "R1");
            Json(json!({
                "data": { "getChatRoomById": {
                    "_id": "R1",
                    "participants": ["A", "L"],
                    "appointmentId": "apt-9",
                    "allowedMedia": "VIDEO"
                }}
            }))
        }),
    );
    let base = serve(app).await;

    let room = graphql_store(&base)
        .fetch_room(&RoomId::from("R1"))
        .await
        .expect("room")
        .expect("found");
    assert_eq!(room.counterpart(&UserId::from("A")), Some(&UserId::from("L")));
    assert_eq!(room.allowed_media.as_deref(), Some("VIDEO"));
}

fn relay_store(base: &str) -> RelayHistoryStore {
    RelayHistoryStore::new(
        format!("{base}/"),
        Arc::new(StaticTokenProvider::new(Some("app-token".into()))),
    )
}

#[tokio::test]
async fn relay_history_is_fetched_with_bearer() {
    let app = Router::new().route(
        "/api/rooms/:room_id/messages",
        get(|Path(room_id): Path<String>, headers: HeaderMap| async move {
            if bearer(&headers) != "Bearer app-token" {
                return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing token" })));
            }
            (
                StatusCode::OK,
                Json(json!([
                    { "id": "m1", "chatRoomId": room_id, "userId": "u1", "type": "TEXT",
                      "content": "hi", "createdAt": "2023-11-14T22:13:20Z" },
                    { "id": "m2", "chatRoomId": room_id, "userId": "u2", "type": "TEXT",
                      "content": "yo", "createdAt": 1_700_000_001_000_i64, "clientMessageId": "c-9" }
                ])),
            )
        }),
    );
    let base = serve(app).await;

    let messages = relay_store(&base)
        .fetch_history(&RoomId::from("R1"))
        .await
        .expect("history");

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].room_id, RoomId::from("R1"));
    assert_eq!(messages[1].created_at.timestamp_millis(), 1_700_000_001_000);
    assert_eq!(messages[1].client_message_id, Some(ClientMessageId::from("c-9")));
}

#[tokio::test]
async fn relay_history_rejection_is_an_error_and_mutations_are_unavailable() {
    let app = Router::new().route(
        "/api/rooms/:room_id/messages",
        get(|| async { (StatusCode::UNAUTHORIZED, Json(json!({ "error": "expired" }))) }),
    );
    let base = serve(app).await;
    let store = relay_store(&base);

    let err = store
        .fetch_history(&RoomId::from("R1"))
        .await
        .expect_err("rejected");
    assert!(err.to_string().contains("expired"), "{err}");

    let outbound = OutboundMessage {
        room_id: RoomId::from("R1"),
        sender_id: UserId::from("u1"),
        kind: MessageKind::Text,
        content: "hi".into(),
        client_message_id: None,
    };
    let err = store.create_message(&outbound).await.expect_err("unavailable");
    assert!(matches!(err.downcast_ref::<HistoryError>(), Some(HistoryError::Unavailable)));
}
