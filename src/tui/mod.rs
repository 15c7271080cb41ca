//! Terminal user interface using Ratatui.

mod app;
mod compose;
mod debug_log;
pub mod log_capture;
mod timeline;
mod ui;

pub use app::run;
