//! Run orchestration
//!
//! - [`engine`]: the run coordinator (worker pool, deadline, shutdown sweep)
//! - [`results`]: JSON output and terminal summary of a finished run

pub mod engine;
pub mod results;

pub use engine::{RunCoordinator, RunSettings, domain_label, instance_name, new_run_id};
pub use results::{print_results_summary, write_results};
