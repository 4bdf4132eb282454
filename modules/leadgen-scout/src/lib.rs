pub mod dataset;
pub mod extract;
pub mod launcher;
pub mod merge;
pub mod orchestrator;
pub mod partition;
pub mod run_log;
pub mod search_worker;
pub mod session;
pub mod stage1;
pub mod stage2;
pub mod stats;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod tracker;
pub mod traits;
