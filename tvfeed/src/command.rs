//! Console commands driving the feed registry.

use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tvfeed_core::{FeedError, FeedRegistry};

/// How long `info` waits for metadata.
const INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// One console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Primary(String),
    Secondary(String),
    StopSecondary(String),
    Record { name: String, key: String },
    StopRecord { name: String, key: String },
    Info(String),
    /// Refresh one source's metadata, or all of it.
    Refresh(Option<String>),
    Status,
    Quit,
}

/// Command line parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// Errors while executing a command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("Failed to encode status: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether the console should keep reading commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<String> = words.map(str::to_string).collect();

        let one = |usage| match args.as_slice() {
            [name] => Ok(name.clone()),
            _ => Err(ParseError::Usage(usage)),
        };
        let two = |usage| match args.as_slice() {
            [name, key] => Ok((name.clone(), key.clone())),
            _ => Err(ParseError::Usage(usage)),
        };

        match verb.as_str() {
            "primary" => one("primary <name>").map(Command::Primary),
            "secondary" => one("secondary <name>").map(Command::Secondary),
            "stop-secondary" => one("stop-secondary <name>").map(Command::StopSecondary),
            "record" => two("record <name> <key>").map(|(name, key)| Command::Record { name, key }),
            "stop-record" => {
                two("stop-record <name> <key>").map(|(name, key)| Command::StopRecord { name, key })
            }
            "info" => one("info <name>").map(Command::Info),
            "refresh" => match args.as_slice() {
                [] => Ok(Command::Refresh(None)),
                [name] => Ok(Command::Refresh(Some(name.clone()))),
                _ => Err(ParseError::Usage("refresh [<name>]")),
            },
            "status" if args.is_empty() => Ok(Command::Status),
            "status" => Err(ParseError::Usage("status")),
            "quit" | "exit" => Ok(Command::Quit),
            _ => Err(ParseError::Unknown(verb)),
        }
    }
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<Result<Command, ParseError>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.parse())
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "failed"
    }
}

/// Run one command against the registry and print its result.
pub async fn execute(registry: &mut FeedRegistry, command: Command) -> Result<Flow, CommandError> {
    match command {
        Command::Primary(name) => {
            let ok = registry.try_start_primary_feed(&name).await?;
            println!("primary {}: {}", name, outcome(ok));
        }
        Command::Secondary(name) => {
            let ok = registry.try_start_secondary_feed(&name).await?;
            println!("secondary {}: {}", name, outcome(ok));
        }
        Command::StopSecondary(name) => {
            registry.stop_secondary_feed(&name)?;
            println!("stop-secondary {}: ok", name);
        }
        Command::Record { name, key } => {
            let ok = registry.try_start_recording_feed(&name, key.as_str()).await?;
            println!("record {} {}: {}", name, key, outcome(ok));
        }
        Command::StopRecord { name, key } => {
            registry.stop_recording_feed(&name, key.as_str())?;
            println!("stop-record {} {}: ok", name, key);
        }
        Command::Info(name) => match registry.source_information(&name)? {
            Some(reader) => match tokio::time::timeout(INFO_TIMEOUT, reader.wait()).await {
                Ok(Some(info)) => println!("{}", serde_json::to_string_pretty(&info)?),
                Ok(None) => println!("info {}: no information", name),
                Err(_) => {
                    warn!("Metadata read for {} timed out", name);
                    reader.cancel();
                    println!("info {}: timed out", name);
                }
            },
            None => println!("info {}: not received", name),
        },
        Command::Refresh(Some(name)) => {
            let found = registry.refresh_source_information(&name)?;
            println!("refresh {}: {}", name, if found { "ok" } else { "not received" });
        }
        Command::Refresh(None) => {
            registry.refresh_source_informations();
            println!("refresh: ok");
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&registry.snapshot())?);
        }
        Command::Quit => {
            info!("Quit requested");
            return Ok(Flow::Quit);
        }
    }

    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tvfeed_core::{StaticProviderConfig, StaticSourceProvider};

    #[test]
    fn test_parse_commands() {
        assert_eq!("primary NHK".parse::<Command>(), Ok(Command::Primary("NHK".into())));
        assert_eq!("  SECONDARY   ETV ".parse::<Command>(), Ok(Command::Secondary("ETV".into())));
        assert_eq!(
            "record NHK job1".parse::<Command>(),
            Ok(Command::Record { name: "NHK".into(), key: "job1".into() })
        );
        assert_eq!(
            "stop-record NHK job1".parse::<Command>(),
            Ok(Command::StopRecord { name: "NHK".into(), key: "job1".into() })
        );
        assert_eq!("refresh".parse::<Command>(), Ok(Command::Refresh(None)));
        assert_eq!("refresh NHK".parse::<Command>(), Ok(Command::Refresh(Some("NHK".into()))));
        assert_eq!("status".parse::<Command>(), Ok(Command::Status));
        assert_eq!("exit".parse::<Command>(), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("primary".parse::<Command>(), Err(ParseError::Usage("primary <name>")));
        assert_eq!(
            "record NHK".parse::<Command>(),
            Err(ParseError::Usage("record <name> <key>"))
        );
        assert_eq!("status now".parse::<Command>(), Err(ParseError::Usage("status")));
        assert_eq!("tune NHK".parse::<Command>(), Err(ParseError::Unknown("tune".into())));
    }

    #[test]
    fn test_parse_line_skips_comments() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("# primary NHK"), None);
        assert_eq!(parse_line("quit"), Some(Ok(Command::Quit)));
    }

    #[tokio::test]
    async fn test_execute_drives_registry() {
        let provider = Arc::new(StaticSourceProvider::new(StaticProviderConfig::sample(2)));
        let mut registry = FeedRegistry::new(provider);

        let flow = execute(&mut registry, Command::Primary("NHK".into())).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        execute(&mut registry, Command::Secondary("ETV".into())).await.unwrap();
        execute(&mut registry, Command::Info("NHK".into())).await.unwrap();
        execute(&mut registry, Command::Status).await.unwrap();

        assert_eq!(registry.primary_view().unwrap().device, 0);
        assert_eq!(registry.secondary_views().len(), 1);

        assert!(matches!(
            execute(&mut registry, Command::Primary("ZZZ".into())).await,
            Err(CommandError::Feed(FeedError::UnknownSource(_)))
        ));
        assert_eq!(execute(&mut registry, Command::Quit).await.unwrap(), Flow::Quit);
    }
}
