//! Black-box configuration optimizer: searches a typed parameter space by
//! scoring candidates through an expensive, rate-limited oracle.

pub mod cache;
pub mod error;
pub mod oracle;
pub mod params;
pub mod report;
pub mod run;
pub mod scoring;
pub mod search;
pub mod settings;
pub mod stop;

pub use cache::{KvStore, MemoryStore, ResultCache, SqliteStore, cache_key};
pub use error::{OptimizerError, Result};
pub use oracle::{HttpOracle, Oracle, OracleReply, Quota, RateLimitedOracle};
pub use params::{Configuration, CorrelatedGroup, ParamKind, ParameterRule, ParameterSpace};
pub use run::{ChainReport, ChainedRun, OptimizationRun, RunReport, RunStart, StopReason};
pub use scoring::{Metrics, ScoredResult, Scorer, ScoringMode};
pub use search::{BestState, SearchContext};
pub use settings::RunSettings;
pub use stop::{Deadline, StopFlag};
