pub mod diagnostics;
pub mod paths;

pub use paths::{app_dir, app_log_dir};
