use super::*;

#[test]
fn join_room_frame_carries_bare_room_id() {
    let frame = ClientRequest::JoinRoom(RoomId::from("R1"))
        .to_frame()
        .expect("encode");
    let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
    assert_eq!(value["event"], "join-room");
    assert_eq!(value["data"], "R1");
}

#[test]
fn chat_message_frame_uses_server_field_names() {
    let request = ClientRequest::ChatMessage(OutboundMessage {
        room_id: RoomId::from("R1"),
        sender_id: UserId::from("user_a"),
        kind: MessageKind::Text,
        content: "hello".to_string(),
        client_message_id: Some(ClientMessageId::from("c-1")),
    });
    let value: serde_json::Value =
        serde_json::from_str(&request.to_frame().expect("encode")).expect("json");
    assert_eq!(value["event"], "chat-message");
    assert_eq!(value["data"]["chatRoomId"], "R1");
    assert_eq!(value["data"]["userId"], "user_a");
    assert_eq!(value["data"]["type"], "TEXT");
    assert_eq!(value["data"]["clientMessageId"], "c-1");
}

#[test]
fn message_created_and_chat_message_names_decode_to_same_event() {
    let body = r#"{"_id":"m1","chatRoomId":"R1","userId":"u","type":"IMAGE","content":"https://cdn/x.png","createdAt":"2024-05-01T10:00:00Z"}"#;
    let created = ServerEvent::from_frame(&format!(r#"{{"event":"message-created","data":{body}}}"#))
        .expect("message-created");
    let legacy = ServerEvent::from_frame(&format!(r#"{{"event":"chat-message","data":{body}}}"#))
        .expect("chat-message");
    assert_eq!(created, legacy);
    match created {
        ServerEvent::MessageCreated(message) => {
            assert_eq!(message.id, MessageId::from("m1"));
            assert_eq!(message.kind, MessageKind::Image);
            assert!(message.client_message_id.is_none());
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn message_created_accepts_epoch_millis_timestamp() {
    let frame = r#"{"event":"message-created","data":{"id":"m2","chatRoomId":"R1","userId":"u","type":"TEXT","content":"hi","createdAt":1700000000000}}"#;
    match ServerEvent::from_frame(frame).expect("decode") {
        ServerEvent::MessageCreated(message) => {
            assert_eq!(message.created_at.timestamp_millis(), 1_700_000_000_000);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let quoted = frame.replace("1700000000000", r#""1700000000000""#);
    assert!(ServerEvent::from_frame(&quoted).is_ok());
    let garbage = frame.replace("1700000000000", r#""soon""#);
    assert!(ServerEvent::from_frame(&garbage).is_err());
}

#[test]
fn typing_payload_room_is_optional() {
    let event = ServerEvent::from_frame(
        r#"{"event":"user-typing","data":{"userId":"u2","username":"Bat","isTyping":true}}"#,
    )
    .expect("decode");
    assert_eq!(
        event,
        ServerEvent::UserTyping(TypingPayload {
            user_id: UserId::from("u2"),
            username: "Bat".to_string(),
            is_typing: true,
            room_id: None,
        })
    );
}

#[test]
fn online_users_decode_with_image_url() {
    let event = ServerEvent::from_frame(
        r#"{"event":"onlineUsers","data":[{"id":"a","username":"A","imageUrl":"https://img/a"},{"id":"b","username":"B"}]}"#,
    )
    .expect("decode");
    let ServerEvent::OnlineUsers(users) = event else {
        panic!("expected online users");
    };
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].image_url.as_deref(), Some("https://img/a"));
    assert_eq!(users[1].image_url, None);
}

#[test]
fn message_error_accepts_error_spelling() {
    let event = ServerEvent::from_frame(
        r#"{"event":"message-error","data":{"error":"room closed","clientMessageId":"c-9"}}"#,
    )
    .expect("decode");
    assert_eq!(
        event,
        ServerEvent::MessageError(MessageErrorPayload {
            message: "room closed".to_string(),
            client_message_id: Some(ClientMessageId::from("c-9")),
            room_id: None,
        })
    );
}

#[test]
fn unknown_event_is_rejected() {
    assert!(ServerEvent::from_frame(r#"{"event":"mystery","data":{}}"#).is_err());
}

#[test]
fn temporary_message_ids_are_recognisable() {
    let temp = MessageId::temporary();
    assert!(temp.is_temporary());
    assert!(!MessageId::from("665f1c").is_temporary());
    assert_ne!(temp, MessageId::temporary());
}
