use std::env::args;
use std::process::ExitCode;
use std::str::FromStr;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("no demo supplied, use one of {available} or see unit tests")]
    MissingDemo { available: String },

    #[error("unknown demo '{name}', use one of {available}")]
    UnknownDemo {
        name: String,
        available: String,
        #[source]
        source: strum::ParseError,
    },
}

fn available() -> String {
    Demo::iter()
        .map(|d| d.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

fn select(selector: Option<String>) -> Result<Demo, CliError> {
    let selector = selector.ok_or_else(|| CliError::MissingDemo {
        available: available(),
    })?;
    Demo::from_str(&selector).map_err(|source| CliError::UnknownDemo {
        name: selector.clone(),
        available: available(),
        source,
    })
}

fn main() -> ExitCode {
    env_logger::init();

    let demo = match select(args().nth(1)) {
        Ok(demo) => demo,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    log::debug!("running the {demo} demo");
    match demo {
        Demo::Local => cmx::local::run(),
        Demo::Refs => cmx::refs::run(),
        Demo::Shareable => cmx::shareable::run(),
        Demo::Synchronize => cmx::synchronize::run(),
    }
    ExitCode::SUCCESS
}

#[derive(Debug, PartialEq, EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Demo {
    Local,
    Refs,
    Shareable,
    Synchronize,
}
