/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Rooms,
    New { name: String },
    Open { room: String },
    Delete { room: String },
    Clear,
    Models { free_only: bool },
    Model { id: String },
    Temperature { value: f64 },
    Pairs { value: usize },
    Export,
    Save,
    Status,
    Help,
    Quit,
    Say(String),
    Invalid(String),
}

pub const HELP: &str = "\
/rooms              list rooms
/new <name>         create a room and open it
/open <id>          open a room by id or id prefix
/delete <id>        delete a room and its messages
/clear              clear the open room's chat history (system prompt kept)
/models [free]      list available models
/model <id>         use a model in the open room
/temp <value>       set the open room's temperature
/pairs <n>          set how many exchanges are sent as context
/export             print the open room as a transcript
/save               make the open room's model settings the defaults
/status             show model and connection status
/quit               exit
anything else is sent to the model";

/// Returns `None` for blank lines.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    let command = match (name, argument) {
        ("rooms", "") => Command::Rooms,
        ("new", name) if !name.is_empty() => Command::New {
            name: name.to_string(),
        },
        ("open", room) if !room.is_empty() => Command::Open {
            room: room.to_string(),
        },
        ("delete", room) if !room.is_empty() => Command::Delete {
            room: room.to_string(),
        },
        ("clear", "") => Command::Clear,
        ("models", "") => Command::Models { free_only: false },
        ("models", "free") => Command::Models { free_only: true },
        ("model", id) if !id.is_empty() => Command::Model { id: id.to_string() },
        ("temp", value) => match value.parse::<f64>() {
            Ok(value) if (0.0..=2.0).contains(&value) => Command::Temperature { value },
            _ => Command::Invalid("temperature must be a number between 0 and 2".to_string()),
        },
        ("pairs", value) => match value.parse::<usize>() {
            Ok(value) if value > 0 => Command::Pairs { value },
            _ => Command::Invalid("pairs must be a positive integer".to_string()),
        },
        ("export", "") => Command::Export,
        ("save", "") => Command::Save,
        ("status", "") => Command::Status,
        ("help", "") => Command::Help,
        ("quit" | "exit", "") => Command::Quit,
        (name, _) => Command::Invalid(format!(
            "unknown or incomplete command '/{name}', try /help"
        )),
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_turn() {
        assert_eq!(
            parse_command("  hello there  "),
            Some(Command::Say("hello there".to_string()))
        );
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn commands_take_trimmed_arguments() {
        assert_eq!(
            parse_command("/new   Trip planning "),
            Some(Command::New {
                name: "Trip planning".to_string()
            })
        );
        assert_eq!(
            parse_command("/model openai/gpt-4o-mini"),
            Some(Command::Model {
                id: "openai/gpt-4o-mini".to_string()
            })
        );
        assert_eq!(
            parse_command("/models free"),
            Some(Command::Models { free_only: true })
        );
        assert_eq!(parse_command("/pairs 5"), Some(Command::Pairs { value: 5 }));
        assert_eq!(
            parse_command("/temp 0"),
            Some(Command::Temperature { value: 0.0 })
        );
        assert_eq!(parse_command("/exit"), Some(Command::Quit));
    }

    #[test]
    fn malformed_commands_are_reported() {
        for line in ["/new", "/open   ", "/pairs 0", "/temp hot", "/temp 3", "/frobnicate"] {
            assert!(
                matches!(parse_command(line), Some(Command::Invalid(_))),
                "{line}"
            );
        }
    }
}
