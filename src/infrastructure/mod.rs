//! Infrastructure layer - Engine, repositories and runners

pub mod execution;
pub mod flow;
pub mod logging;
pub mod runners;
