//! Terminal front end: instance list on the left, log panel on the right.

pub mod app;
pub mod confirm;
pub mod event;
pub mod ui;

pub use app::App;
