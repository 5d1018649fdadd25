use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("optimization cancelled")]
    Cancelled,

    #[error("time budget exhausted")]
    BudgetExhausted,

    #[error("target score reached")]
    TargetReached,

    #[error("oracle still rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("invalid metrics from oracle: {0}")]
    InvalidMetrics(String),

    #[error("baseline rejected: {0}")]
    BaselineRejected(String),

    #[error("baseline evaluation failed: {0}")]
    BaselineFailed(String),

    #[error("baseline configuration is invalid: {0}")]
    InvalidBaseline(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("history export failed: {0}")]
    Csv(#[from] csv::Error),
}

impl OptimizerError {
    /// The run ends early but keeps its best.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Cancelled | Self::BudgetExhausted | Self::TargetReached)
    }

    /// Errors that stop a chain instead of being recorded as a failed run.
    pub fn is_fatal_to_chain(&self) -> bool {
        matches!(self, Self::Cancelled | Self::RateLimitExhausted { .. })
    }
}

impl From<rusqlite::Error> for OptimizerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
