/// fern-based logger setup and old log cleanup.
pub mod logsetup;

pub use logsetup::{cleanup_old_logs, parse_level, setup_logging};
