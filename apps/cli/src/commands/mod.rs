//! Command implementations for the Umbra CLI.

pub mod job;
pub mod label;
pub mod supervise;

use serde::Serialize;
use std::process::ExitCode;
use umbra_training::EXIT_BUSY;

/// How a command finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Done,
    /// Another job or batch holds the lock.
    Busy,
}

impl CommandStatus {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Done => ExitCode::SUCCESS,
            Self::Busy => ExitCode::from(EXIT_BUSY as u8),
        }
    }
}

/// Command results go to stdout; logs go to stderr.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
