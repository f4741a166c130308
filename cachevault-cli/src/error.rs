//! CLI error handling with user-friendly messages.

use std::fmt;
use std::path::PathBuf;
use std::process;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// The key file could not be read or has the wrong length.
    KeyFile { path: PathBuf, problem: String },
    /// The database reported an error.
    Database(cachevault::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);
        if let CliError::Database(cachevault::Error::LockFailed { .. }) = self {
            eprintln!();
            eprintln!("Another process is using this database. Stop it and retry.");
        }
        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::KeyFile { path, problem } => {
                write!(f, "cannot use key file {}: {}", path.display(), problem)
            }
            CliError::Database(error) => write!(f, "{}", error),
        }
    }
}

impl From<cachevault::Error> for CliError {
    fn from(error: cachevault::Error) -> Self {
        CliError::Database(error)
    }
}
