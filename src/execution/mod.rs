//! Execution: resilience policy layered on top of [`crate::mcp_client`].
//!
//! Argument validation and transformation, timed and retried tool calls,
//! and result normalization with error classification.

pub mod errors;
pub mod executor;
pub mod result_handler;
pub mod transform;
pub mod validation;

pub use errors::{ExecutionError, HandlerError, ValidationError};
pub use executor::{ExecutionContext, ExecutionOutcome, ExecutorOptions, ToolExecutor};
pub use result_handler::{
    ErrorPattern, ErrorResult, HandledResult, HandlerContext, HandlerOptions, NormalizedContent,
    ResultHandler, RetryOutcome,
};
pub use transform::ArgumentTransformer;
pub use validation::validate_arguments;
