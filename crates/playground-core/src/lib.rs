pub mod config;
pub mod progress;

pub use config::format_error_chain;
pub use progress::{Group, Progress, ProgressOptions, Task, TaskStatus};
