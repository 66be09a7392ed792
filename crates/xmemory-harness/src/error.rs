use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("scenario {scenario}: {message}")]
    Scenario {
        scenario: &'static str,
        message: String,
    },
    #[error("{failed} of {total} scenario checks failed")]
    ChecksFailed { failed: usize, total: usize },
}

impl HarnessError {
    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::ChecksFailed { .. } => 1,
            Self::Scenario { .. } => 2,
            Self::Io(_) | Self::Json(_) => 3,
        }
    }
}
