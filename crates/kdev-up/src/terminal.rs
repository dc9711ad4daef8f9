//! Local terminal state.

use crossterm::terminal;
use tracing::{debug, warn};

/// Leaves raw mode if the user's command left the terminal in it.
pub fn restore() {
    match terminal::is_raw_mode_enabled() {
        Ok(true) => {
            if let Err(e) = terminal::disable_raw_mode() {
                warn!(error = %e, "Failed to restore terminal");
            } else {
                debug!("Terminal restored");
            }
        }
        Ok(false) => {}
        Err(e) => debug!(error = %e, "Terminal state unavailable"),
    }
}
