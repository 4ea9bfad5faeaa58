use super::*;

#[test]
fn plain_text_is_a_message() {
    assert_eq!(
        parse_line("  hello there "),
        Ok(Some(CliCommand::Say("hello there".into())))
    );
    assert_eq!(parse_line("   "), Ok(None));
}

#[test]
fn slash_commands_are_parsed() {
    assert_eq!(parse_line("/typing"), Ok(Some(CliCommand::Typing(true))));
    assert_eq!(parse_line("/typing off"), Ok(Some(CliCommand::Typing(false))));
    assert_eq!(
        parse_line("/join R2"),
        Ok(Some(CliCommand::Join(RoomId::from("R2"))))
    );
    assert_eq!(
        parse_line("/call video"),
        Ok(Some(CliCommand::Call(CallType::Video)))
    );
    assert_eq!(parse_line("/call"), Ok(Some(CliCommand::Call(CallType::Audio))));
    assert_eq!(
        parse_line("/retry temp-1"),
        Ok(Some(CliCommand::Retry(MessageId::from("temp-1"))))
    );
    assert_eq!(parse_line("/exit"), Ok(Some(CliCommand::Quit)));
}

#[test]
fn double_slash_escapes_text() {
    assert_eq!(
        parse_line("//shrug"),
        Ok(Some(CliCommand::Say("/shrug".into())))
    );
}

#[test]
fn unknown_or_malformed_commands_are_errors() {
    assert!(parse_line("/dance").is_err());
    assert!(parse_line("/join").is_err());
    assert!(parse_line("/call hologram").is_err());
}
