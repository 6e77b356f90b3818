//! Line commands of the interactive console

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register and start a session (`host:port`)
    Connect(String),
    /// Send UTF-8 text to a peer
    Send { target: String, text: String },
    /// List peer sessions
    Peers,
    /// Dump the full status as JSON
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

pub const HELP: &str = "\
commands:
  connect <host:port>        start a session with a peer
  send <host:port> <text>    send a message
  peers                      list sessions
  status                     dump status as json
  quit                       stop and exit";

impl Command {
    /// Parse one input line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "connect" | "c" => {
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    return Err(ParseError("usage: connect <host:port>".to_string()));
                }
                Command::Connect(rest.to_string())
            }
            "send" | "s" => {
                let Some((target, text)) = rest.split_once(char::is_whitespace) else {
                    return Err(ParseError("usage: send <host:port> <text>".to_string()));
                };
                Command::Send {
                    target: target.to_string(),
                    text: text.trim_start().to_string(),
                }
            }
            "peers" | "ls" => Command::Peers,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => return Err(ParseError(format!("unknown command '{}', try 'help'", other))),
        };
        Ok(Some(command))
    }
}
