pub mod agent;
pub mod config;
pub mod dataset;
pub mod error;
pub mod execution;
pub mod llm;
pub mod narrative;
pub mod plan;
pub mod planner;
pub mod presenter;

pub use agent::{QueryAgent, RequestPhase, RequestTrace};
pub use config::{AgentConfig, ExecutionLimits, NarrativeLimits};
pub use dataset::{ColumnKind, ColumnSchema, Dataset, DatasetCache};
pub use error::{AgentError, BackendError, LoadError, LoadErrorKind, Result};
pub use execution::{QueryAnswer, QueryResult, Scalar};
pub use llm::{LlmBackend, LlmClient};
pub use narrative::{NarrativeGenerator, NarrativeResult};
pub use plan::QueryPlan;
pub use planner::QueryPlanner;
pub use presenter::{Presenter, SUGGESTED_QUESTIONS};
