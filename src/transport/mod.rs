//! Outbound message delivery.

mod telegram;

pub use telegram::{DEFAULT_API_BASE, TelegramTransport};

use crate::Result;

/// Sends rendered text to a named channel.
///
/// Any error is treated as transient; the pipeline owns the retry policy.
/// Implementations are called from blocking worker threads.
pub trait Transport: Send + Sync {
    /// Sends `text` to `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message was not accepted.
    fn send(&self, channel: &str, text: &str) -> Result<()>;
}
