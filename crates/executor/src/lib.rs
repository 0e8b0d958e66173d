pub mod config;
pub mod dlq;
pub mod error;
pub mod executor;
pub mod retry;

pub use config::ExecutorConfig;
pub use dlq::DeadLetterQueue;
pub use error::ExecutionError;
pub use executor::{DispatchExecutor, DispatchOutcome, error_code};
pub use retry::RetryStrategy;
