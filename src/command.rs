//! Chat command grammar.
//!
//! | token      | argument          |
//! |------------|-------------------|
//! | `$startvm` | exactly one name  |
//! | `$stopvm`  | exactly one name  |
//! | `$vmstate` | exactly one name  |
//! | `$ping`    | none              |
//! | `$help`    | none              |

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    State,
    Ping,
    Help,
    Unrecognized,
}

impl Verb {
    pub const ALL: [Verb; 5] = [Verb::Ping, Verb::Help, Verb::Start, Verb::Stop, Verb::State];

    pub fn from_token(token: &str) -> Self {
        match token {
            "$startvm" => Verb::Start,
            "$stopvm" => Verb::Stop,
            "$vmstate" => Verb::State,
            "$ping" => Verb::Ping,
            "$help" => Verb::Help,
            _ => Verb::Unrecognized,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Verb::Start => "$startvm",
            Verb::Stop => "$stopvm",
            Verb::State => "$vmstate",
            Verb::Ping => "$ping",
            Verb::Help => "$help",
            Verb::Unrecognized => "",
        }
    }

    /// Verbs that address a single VM by logical name.
    pub fn takes_vm_name(self) -> bool {
        matches!(self, Verb::Start | Verb::Stop | Verb::State)
    }

    /// Phrase used in "Failed to {phrase} the VM" messages.
    pub fn failure_phrase(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::State => "get state for",
            Verb::Ping | Verb::Help | Verb::Unrecognized => "handle",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::State => "state",
            Verb::Ping => "ping",
            Verb::Help => "help",
            Verb::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub argument: Option<String>,
}

impl Command {
    fn bare(verb: Verb) -> Self {
        Self {
            verb,
            argument: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentProblem {
    Missing,
    TooMany,
}

impl fmt::Display for ArgumentProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentProblem::Missing => f.write_str("no VM name provided"),
            ArgumentProblem::TooMany => f.write_str("too many arguments"),
        }
    }
}

/// A VM verb was given the wrong number of arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{problem}")]
pub struct ArgumentError {
    pub verb: Verb,
    pub problem: ArgumentProblem,
}

/// Parse one chat line.
///
/// Unknown first tokens, and `$ping`/`$help` followed by anything, come back
/// as `Verb::Unrecognized` so unrelated chatter is ignored.
pub fn parse(raw: &str) -> Result<Command, ArgumentError> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return Ok(Command::bare(Verb::Unrecognized));
    };

    let verb = Verb::from_token(first);
    match verb {
        Verb::Start | Verb::Stop | Verb::State => match tokens.len() {
            2 => Ok(Command {
                verb,
                argument: Some(tokens[1].to_string()),
            }),
            n => Err(ArgumentError {
                verb,
                problem: if n < 2 {
                    ArgumentProblem::Missing
                } else {
                    ArgumentProblem::TooMany
                },
            }),
        },
        Verb::Ping | Verb::Help if tokens.len() == 1 => Ok(Command::bare(verb)),
        _ => Ok(Command::bare(Verb::Unrecognized)),
    }
}
