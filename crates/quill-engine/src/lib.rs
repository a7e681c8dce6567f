pub mod demo;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod parse;
pub mod plan;
pub mod quality;
pub mod worker;
pub mod workers;

pub use error::EngineError;
pub use orchestrator::{JobReport, Orchestrator};
pub use outcome::{TaskFailure, TaskOutcome, TaskStatus, TaskSummary};
pub use plan::{JobPlan, TaskSpec};
pub use worker::{Worker, WorkerError, WorkerInput, WorkerRegistry};
