pub mod batch;
pub mod merge;
pub mod post_process;
pub mod run_stage;
