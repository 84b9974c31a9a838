use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot resolve real allocator symbol {0}: {1}")]
    BootstrapFailed(&'static str, String),

    #[error("cannot read process map: {0}")]
    ProcessMapUnavailable(String),

    #[error("history file I/O error: {0}")]
    HistoryIo(#[from] std::io::Error),

    #[error("history file is malformed at line {0}: {1}")]
    HistoryMalformed(usize, String),

    #[error("symbol resolution error: {0}")]
    SymbolResolution(String),

    #[error("thread table exhausted (max {0} alive threads)")]
    ThreadTableExhausted(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exit codes for collaborators (e.g. `causer-history`) that surface `Error`
/// to a process exit status, following the teacher's `exit_code` module.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const HISTORY_IO: i32 = 3;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::HistoryIo(_) | Error::HistoryMalformed(..) => exit_code::HISTORY_IO,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
