pub mod interpreter;
pub mod result;

pub use interpreter::{lower_plan, Execution, PlanExecutor};
pub use result::{dataframe_to_json, QueryAnswer, QueryResult, Scalar};
