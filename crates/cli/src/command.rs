use std::path::PathBuf;

use snafu::Snafu;

pub const HELP: &str = "\
commands:
  <text>            send a message
  /attach <path>    stage an image for the next message
  /detach <n>       drop staged image n
  /delete <n>       delete message n (with its reply or prompt)
  /clear            delete the whole conversation
  /cancel           stop the response being streamed
  /user <id>        switch to another user's conversation
  /show             print the conversation
  /help             print this help
  /quit             exit";

/// One line of terminal input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Submit(String),
    Attach(PathBuf),
    Detach(usize),
    Delete(usize),
    Clear,
    Cancel,
    SwitchUser(String),
    Show,
    Help,
    Quit,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CommandError {
    #[snafu(display("/{command} needs an argument"))]
    MissingArgument { command: String },
    #[snafu(display("'{raw}' is not a message or attachment number"))]
    InvalidIndex { raw: String },
    #[snafu(display("unknown command /{command}; try /help"))]
    UnknownCommand { command: String },
}

pub fn parse(line: &str) -> Result<Intent, CommandError> {
    let line = line.trim();
    let Some(command_line) = line.strip_prefix('/') else {
        return Ok(Intent::Submit(line.to_string()));
    };

    let (command, argument) = match command_line.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument.trim()),
        None => (command_line, ""),
    };

    match command {
        "attach" => Ok(Intent::Attach(PathBuf::from(required(command, argument)?))),
        "detach" => Ok(Intent::Detach(index(command, argument)?)),
        "delete" => Ok(Intent::Delete(index(command, argument)?)),
        "clear" => Ok(Intent::Clear),
        "cancel" => Ok(Intent::Cancel),
        "user" => Ok(Intent::SwitchUser(required(command, argument)?.to_string())),
        "show" => Ok(Intent::Show),
        "help" => Ok(Intent::Help),
        "quit" | "exit" => Ok(Intent::Quit),
        other => UnknownCommandSnafu { command: other }.fail(),
    }
}

fn required<'a>(command: &str, argument: &'a str) -> Result<&'a str, CommandError> {
    if argument.is_empty() {
        return MissingArgumentSnafu { command }.fail();
    }
    Ok(argument)
}

fn index(command: &str, argument: &str) -> Result<usize, CommandError> {
    let raw = required(command, argument)?;
    raw.parse()
        .map_err(|_| CommandError::InvalidIndex { raw: raw.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_submissions() {
        assert_eq!(parse("  hello there "), Ok(Intent::Submit("hello there".to_string())));
        assert_eq!(parse(""), Ok(Intent::Submit(String::new())));
    }

    #[test]
    fn commands_take_arguments() {
        assert_eq!(parse("/delete 2"), Ok(Intent::Delete(2)));
        assert_eq!(parse("/detach  0"), Ok(Intent::Detach(0)));
        assert_eq!(
            parse("/attach ./photos/cat 1.png"),
            Ok(Intent::Attach(PathBuf::from("./photos/cat 1.png")))
        );
        assert_eq!(parse("/user bob"), Ok(Intent::SwitchUser("bob".to_string())));
        assert_eq!(parse("/exit"), Ok(Intent::Quit));
    }

    #[test]
    fn malformed_commands_are_reported() {
        assert_eq!(
            parse("/delete"),
            Err(CommandError::MissingArgument {
                command: "delete".to_string()
            })
        );
        assert_eq!(
            parse("/delete two"),
            Err(CommandError::InvalidIndex {
                raw: "two".to_string()
            })
        );
        assert!(matches!(
            parse("/frobnicate"),
            Err(CommandError::UnknownCommand { .. })
        ));
    }
}
