//! Message rendering.
//!
//! Turns a [`FeedItem`] and a per-feed template into the text that is sent
//! to a channel. An empty result means there is nothing worth sending.

mod html;
mod operations;
mod template_renderer;

pub use html::html_to_markdown;
pub use operations::{FieldExpr, Operation, split_unescaped};
pub use template_renderer::{DEFAULT_TEMPLATE, PUB_DATE_FORMAT, TemplateRenderer};

use crate::feed::FeedItem;

/// Converts an item into message text.
pub trait Renderer: Send + Sync {
    /// Renders `item` through `template`. An empty string suppresses the send.
    fn render(&self, item: &FeedItem, template: &str) -> String;
}
