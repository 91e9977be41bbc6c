use super::*;
use shared::domain::{ChannelId, GuildId, MessageId, User, UserId};

fn message(content: &str) -> Message {
    Message {
        id: MessageId::new("1"),
        channel_id: ChannelId::new("2"),
        guild_id: Some(GuildId::new("3")),
        author: User {
            id: UserId::new("4"),
            username: "listener".into(),
            discriminator: None,
            bot: false,
        },
        content: content.into(),
    }
}

#[test]
fn parses_name_and_arguments() {
    let command = Command::parse(message(".play never gonna   give"), ".").expect("command");

    assert_eq!(command.name(), "play");
    assert_eq!(command.args(), ["never", "gonna", "give"]);
    assert_eq!(command.arg(1), Some("gonna"));
    assert_eq!(command.arg(3), None);
    assert_eq!(command.rest(1), "gonna give");
    assert_eq!(command.rest(9), "");
    assert_eq!(command.message.channel_id.as_str(), "2");
}

#[test]
fn integer_arguments() {
    let command = Command::parse(message("!volume 80 loud"), "!").expect("command");

    assert_eq!(command.arg_int(0), Some(80));
    assert_eq!(command.arg_int(1), None);
    assert_eq!(command.arg_int(2), None);
}

#[test]
fn messages_without_prefix_are_not_commands() {
    assert!(Command::parse(message("play something"), ".").is_none());
    assert!(Command::parse(message(""), ".").is_none());
    assert!(Command::parse(message(". "), ".").is_none());
    assert!(Command::parse(message(".stop"), "").is_none());
}

#[test]
fn multi_character_prefixes() {
    let command = Command::parse(message("bot! leave"), "bot!").expect("command");
    assert_eq!(command.name(), "leave");
    assert!(command.args().is_empty());
}
