//! `mpsh config`: inspect and edit the board configuration file.

use anyhow::{Result, bail};
use clap::Subcommand;
use mpsh::{BoardConfig, DEFAULT_SECTION, validate_option};
use serde_json::Value;

use crate::Session;

/// Configuration actions. `-b` picks the board section; without it the
/// default section is used.
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the configuration.
    Show,

    /// Print one option.
    Get {
        /// Option name.
        option: String,
    },

    /// Set an option. Values are parsed as JSON, else kept as a string.
    Set {
        /// Option name.
        option: String,
        /// New value.
        value: String,
    },

    /// Remove an option.
    Rm {
        /// Option name.
        option: String,
    },
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

pub fn run(session: &Session, action: ConfigAction) -> Result<()> {
    let cfg: &dyn BoardConfig = session.config.as_ref();
    match action {
        ConfigAction::Show => {
            if let Some(path) = session.config.path() {
                println!("# {}", path.display());
            }
            let ids = if session.board_name().is_empty() {
                session.config.boards()
            } else {
                vec![session.board_id()]
            };
            for id in ids {
                println!("[{id}] {}", session.config.section_string(&id));
            }
        }
        ConfigAction::Get { option } => {
            let Some(value) = cfg.get(&session.board_id(), &option) else {
                bail!("option {option:?} is not set");
            };
            match value {
                Value::String(s) => println!("{s}"),
                other => println!("{other}"),
            }
        }
        ConfigAction::Set { option, value } => {
            validate_option(&option)?;
            let id = match session.board_name() {
                "" => DEFAULT_SECTION.to_owned(),
                name => cfg.find_or_create(name)?,
            };
            cfg.set(&id, &option, parse_value(&value))?;
        }
        ConfigAction::Rm { option } => {
            cfg.remove(&session.board_id(), &option)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_parse_as_json_first() {
        assert_eq!(parse_value("115200"), Value::from(115_200));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("/flash"), Value::from("/flash"));
        assert_eq!(parse_value("\"quoted\""), Value::from("quoted"));
    }
}
