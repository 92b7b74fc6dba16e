//! Placeholder substitution for feed items.

use super::Renderer;
use super::html::html_to_markdown;
use super::operations::FieldExpr;
use crate::feed::FeedItem;
use regex::Regex;
use std::sync::LazyLock;

/// Template used when a feed does not configure one.
pub const DEFAULT_TEMPLATE: &str = "{title}\n\n{link}";

/// Format for the `pubDate` field.
pub const PUB_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").unwrap_or_else(|_| unreachable!()));

/// Renders items through `{field | op:params}` templates.
///
/// Known fields are `title`, `link`, `description`, `content`, and `pubDate`.
/// `description` and `content` are converted from HTML first. A placeholder
/// naming any other field is copied to the output untouched.
///
/// # Example
///
/// ```rust
/// use feedrelay::{FeedItem, Renderer, TemplateRenderer};
///
/// let item = FeedItem::new("Release 1.0", "https://example.com/1.0");
/// let text = TemplateRenderer::new().render(&item, "*{ title }*\n{link}");
/// assert_eq!(text, "*Release 1.0*\nhttps://example.com/1.0");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    /// Creates a renderer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn field_value(item: &FeedItem, field: &str) -> Option<String> {
        let value = match field {
            "title" => item.title.clone(),
            "link" => item.link.clone(),
            "description" => html_to_markdown(&item.description),
            "content" => html_to_markdown(&item.content),
            "pubDate" => item
                .published
                .map(|p| p.format(PUB_DATE_FORMAT).to_string())
                .unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }

    fn substitute(item: &FeedItem, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];

            let Some(close) = matching_brace(after_open) else {
                out.push_str(&rest[open..]);
                return out;
            };

            let body = &after_open[..close];
            let expr = FieldExpr::parse(body);
            match Self::field_value(item, &expr.field) {
                Some(value) => out.push_str(&expr.apply(&value)),
                None => {
                    out.push('{');
                    out.push_str(body);
                    out.push('}');
                },
            }
            rest = &after_open[close + 1..];
        }

        out.push_str(rest);
        out
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, item: &FeedItem, template: &str) -> String {
        let template = if template.is_empty() {
            DEFAULT_TEMPLATE
        } else {
            template
        };

        let message = Self::substitute(item, template);
        EXCESS_NEWLINES
            .replace_all(message.trim(), "\n\n")
            .into_owned()
    }
}

/// Finds the byte offset of the `}` closing a placeholder whose `{` was just consumed.
///
/// Nested braces (regex quantifiers such as `\d{4}`, replacement references
/// such as `${1}`) are balanced; a backslash escapes the next character.
fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {},
        }
    }
    None
}
