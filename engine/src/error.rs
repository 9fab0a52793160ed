use thiserror::Error;

/// Error taxonomy for the playout core.
///
/// Every variant carries a stable `reason()` string. The HTTP layer returns
/// that string to operators, so treat the values as part of the API.
#[derive(Debug, Error)]
pub enum PlayoutError {
    /// The file was never scanned/registered into the catalog.
    #[error("file is not in the catalog (file_id: {0})")]
    NotCataloged(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Catalog row exists but the file is gone from disk.
    #[error("file missing on disk: {0}")]
    FileMissing(String),

    #[error("transcoder failure: {0}")]
    SubprocessFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("player is already running")]
    AlreadyRunning,

    #[error("player is not running")]
    NotRunning,

    #[error("nothing is currently playing")]
    NothingPlaying,

    #[error("no playable content: {0}")]
    NoPlayableContent(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PlayoutError {
    pub fn reason(&self) -> &'static str {
        match self {
            PlayoutError::NotCataloged(_) => "not_cataloged",
            PlayoutError::NotFound(_) => "not_found",
            PlayoutError::FileMissing(_) => "file_missing",
            PlayoutError::SubprocessFailure(_) => "subprocess_failure",
            PlayoutError::Timeout(_) => "timeout",
            PlayoutError::AlreadyRunning => "already_running",
            PlayoutError::NotRunning => "not_running",
            PlayoutError::NothingPlaying => "nothing_playing",
            PlayoutError::NoPlayableContent(_) => "no_playable_content",
            PlayoutError::InvalidInput(_) => "invalid_input",
            PlayoutError::Io(_) => "io_error",
            PlayoutError::Database(_) => "database_error",
            PlayoutError::Internal(_) => "internal_error",
        }
    }

    /// Errors the consumer loop recovers from by marking the item played and
    /// moving on.
    pub fn is_playback_failure(&self) -> bool {
        matches!(
            self,
            PlayoutError::FileMissing(_)
                | PlayoutError::SubprocessFailure(_)
                | PlayoutError::Timeout(_)
                | PlayoutError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlayoutError>;
