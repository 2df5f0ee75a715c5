//! Browser automation module
//!
//! Owns the single Chrome instance the updater drives over the DevTools
//! protocol: launch/teardown, script evaluation, bounded waits and
//! coordinate-level mouse/keyboard input.

mod errors;
mod session;

pub use errors::BrowserError;
pub use session::{BrowserSession, POLL_INTERVAL};
