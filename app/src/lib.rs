//! Wiring shared by the `photojournal` and `journal_cli` binaries.

pub mod config;
mod context;
mod logging;

pub use context::{AppContext, AppError};
pub use logging::init_logging;
