use std::{ops::Deref, str::FromStr};

use strum::{Display, EnumString};
use thiserror::Error;

/// Process id of a job. Only meaningful while the job is registered.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobPid(pub u32);

impl From<u32> for JobPid {
    fn from(value: u32) -> Self {
        JobPid(value)
    }
}

impl Deref for JobPid {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for JobPid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobPid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobPid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
    Jobs,
    Run,
    Kill,
    Watch,
}

/// A client request, tokenized once from a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Jobs,
    Run { path: String, args: Vec<String> },
    Kill { pid: JobPid },
    Watch { pid: JobPid },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownVerb(String),
    #[error("{verb} needs an argument")]
    MissingArgument { verb: Verb },
    #[error("{arg:?} is not a valid pid")]
    InvalidPid { arg: String },
}

impl Command {
    /// Splits `line` on ASCII whitespace; the first token is the verb.
    /// Extra arguments to `jobs`, `kill` and `watch` are ignored.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut tokens = line.split_ascii_whitespace();
        let verb = tokens.next().ok_or(ParseError::Empty)?;
        let verb = Verb::from_str(verb)
            .map_err(|_| ParseError::UnknownVerb(verb.to_string()))?;

        match verb {
            Verb::Jobs => Ok(Command::Jobs),
            Verb::Run => {
                let path = tokens
                    .next()
                    .ok_or(ParseError::MissingArgument { verb })?
                    .to_string();
                let args = tokens.map(str::to_string).collect();
                Ok(Command::Run { path, args })
            }
            Verb::Kill => Ok(Command::Kill {
                pid: parse_pid(verb, tokens.next())?,
            }),
            Verb::Watch => Ok(Command::Watch {
                pid: parse_pid(verb, tokens.next())?,
            }),
        }
    }

    #[must_use]
    pub fn verb(&self) -> Verb {
        match self {
            Command::Jobs => Verb::Jobs,
            Command::Run { .. } => Verb::Run,
            Command::Kill { .. } => Verb::Kill,
            Command::Watch { .. } => Verb::Watch,
        }
    }
}

fn parse_pid(verb: Verb, arg: Option<&str>) -> Result<JobPid, ParseError> {
    let arg = arg.ok_or(ParseError::MissingArgument { verb })?;
    match arg.parse::<JobPid>() {
        Ok(pid) if *pid > 0 => Ok(pid),
        _ => Err(ParseError::InvalidPid {
            arg: arg.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_args() {
        let cmd = Command::parse("run  echo hello   world").unwrap();
        assert_eq!(
            cmd,
            Command::Run {
                path: "echo".to_string(),
                args: vec!["hello".to_string(), "world".to_string()],
            }
        );
        assert_eq!(cmd.verb(), Verb::Run);
    }

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(Command::parse("jobs").unwrap(), Command::Jobs);
        assert_eq!(
            Command::parse("kill 42").unwrap(),
            Command::Kill { pid: JobPid(42) }
        );
        assert_eq!(
            Command::parse("watch 7 extra").unwrap(),
            Command::Watch { pid: JobPid(7) }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(
            Command::parse("JOBS"),
            Err(ParseError::UnknownVerb("JOBS".to_string()))
        );
        assert_eq!(
            Command::parse("run"),
            Err(ParseError::MissingArgument { verb: Verb::Run })
        );
        assert_eq!(
            Command::parse("kill abc"),
            Err(ParseError::InvalidPid {
                arg: "abc".to_string()
            })
        );
        assert_eq!(
            Command::parse("watch 0"),
            Err(ParseError::InvalidPid {
                arg: "0".to_string()
            })
        );
    }
}
