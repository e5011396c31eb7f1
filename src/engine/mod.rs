pub mod errors;
pub mod executor;
pub mod types;

pub use errors::EngineError;
pub use executor::{ClaimResult, CompleteResult, FailResult, WorkflowEngine};
