// Console commands. Anything not starting with `/` is a chat message.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Post text to the current room.
    Say(String),
    /// List rooms.
    Rooms,
    /// Switch rooms, by name or id.
    Join(String),
    /// Post as another author id.
    As(u64),
    /// Show the most recent flags, or one flag by id.
    Flags(Option<u64>),
    /// Reprint the current room.
    History,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: /{0} (try /help)")]
    Unknown(String),

    #[error("/{0} needs an argument")]
    MissingArgument(&'static str),

    #[error("Invalid author id: {0}")]
    InvalidAuthor(String),

    #[error("Invalid flag id: {0}")]
    InvalidFlag(String),
}

pub const HELP: &str = "\
/rooms            list rooms
/join <room>      switch to a room (name or id)
/as <author id>   post as another author
/flags [id]        show the 50 most recent flags, or one flag
/history          reprint the current room
/status           show author, room, classifier and feed state
/help             show this help
/quit             exit
anything else is posted to the current room";

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let Some(rest) = trimmed.strip_prefix('/') else {
        // Keep the text as typed; trimming is only for detection.
        return Ok(Some(Command::Say(line.trim_end_matches(['\r', '\n']).to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name.to_lowercase().as_str() {
        "rooms" => Command::Rooms,
        "flags" if arg.is_empty() => Command::Flags(None),
        "flags" => {
            let flag_id = arg
                .trim_start_matches('#')
                .parse::<u64>()
                .map_err(|_| CommandError::InvalidFlag(arg.to_string()))?;
            Command::Flags(Some(flag_id))
        }
        "history" => Command::History,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "join" => {
            if arg.is_empty() {
                return Err(CommandError::MissingArgument("join"));
            }
            Command::Join(arg.to_string())
        }
        "as" => {
            if arg.is_empty() {
                return Err(CommandError::MissingArgument("as"));
            }
            let author_id = arg
                .parse::<u64>()
                .map_err(|_| CommandError::InvalidAuthor(arg.to_string()))?;
            Command::As(author_id)
        }
        other => return Err(CommandError::Unknown(other.to_string())),
    };

    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse("  hello there  \n").unwrap(),
            Some(Command::Say("  hello there  ".to_string()))
        );
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   \t").unwrap(), None);
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(parse("/rooms").unwrap(), Some(Command::Rooms));
        assert_eq!(
            parse("/join   random ").unwrap(),
            Some(Command::Join("random".to_string()))
        );
        assert_eq!(parse("/AS 42").unwrap(), Some(Command::As(42)));
        assert_eq!(parse("/exit").unwrap(), Some(Command::Quit));
        assert_eq!(parse("/flags").unwrap(), Some(Command::Flags(None)));
        assert_eq!(parse("/flags #12").unwrap(), Some(Command::Flags(Some(12))));
        assert_eq!(parse("/history").unwrap(), Some(Command::History));
    }

    #[test]
    fn reports_bad_commands() {
        assert_eq!(parse("/join"), Err(CommandError::MissingArgument("join")));
        assert_eq!(
            parse("/as bob"),
            Err(CommandError::InvalidAuthor("bob".to_string()))
        );
        assert_eq!(
            parse("/flags latest"),
            Err(CommandError::InvalidFlag("latest".to_string()))
        );
        assert_eq!(
            parse("/kick 3"),
            Err(CommandError::Unknown("kick".to_string()))
        );
    }
}
