//! Full proxy validation
//!
//! [`ProxyValidator`] runs the staged protocol against one candidate and
//! [`ValidationScheduler`] drives it over a bounded worker pool with retry.

pub mod models;
pub mod protocol;
pub mod scheduler;

pub use models::{StageResults, TestResult, ValidationResult, ValidationStats, ValidationTask};
pub use protocol::{ProxyValidator, Validator};
pub use scheduler::ValidationScheduler;
