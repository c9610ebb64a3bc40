//! Flow engine implementation: the DAG scheduler, the timeout monitor and
//! the in-memory flow store

mod in_memory_repository;
mod monitor;
mod scheduler;

pub use in_memory_repository::InMemoryFlowRepository;
pub use monitor::{SweepReport, TimeoutMonitor};
pub use scheduler::FlowScheduler;
