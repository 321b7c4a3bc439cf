//! Engine-wide "most recent failure" slot.
//!
//! Every facade failure and every worker failure overwrites the slot, so under
//! concurrent failures it only ever shows the latest one. It is a convenience
//! for status displays, not an error history; the per-call `Result` is the
//! authoritative report.

use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Default)]
pub struct LastError {
    slot: Mutex<Option<String>>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot with `message`.
    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(error = %message, "Last error updated");
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    pub fn get(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The line `print_last_error` writes.
    pub fn describe(&self) -> String {
        match self.get() {
            Some(message) if !message.is_empty() => format!("Error: {message}"),
            _ => String::from("No error occurred."),
        }
    }
}
