//! Run lifecycle: the run record, the manager, and their watchers.

pub mod manager;
pub mod monitor;
pub mod names;
pub mod record;
pub mod resolve;

pub use manager::{CreateOptions, Manager, RunError};
pub use monitor::last_n_lines;
pub use record::{Run, RunState};
pub use resolve::{is_run_id, ResolveError};
