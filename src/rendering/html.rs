//! HTML to chat-Markdown conversion.
//!
//! Feed summaries and bodies are HTML fragments. Messages are sent with the
//! Telegram legacy Markdown parse mode, so the conversion keeps links, bold,
//! italics, line structure, and list bullets, rewrites images to
//! `[Media](src)` links, and drops everything else.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").unwrap_or_else(|_| unreachable!()));

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
        .unwrap_or_else(|_| unreachable!())
});

static IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b([^>]*)>").unwrap_or_else(|_| unreachable!()));

static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a\s*>").unwrap_or_else(|_| unreachable!())
});

static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .unwrap_or_else(|_| unreachable!())
});

static HREF_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .unwrap_or_else(|_| unreachable!())
});

static BOLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:strong|b)\b[^>]*>(.*?)</(?:strong|b)\s*>")
        .unwrap_or_else(|_| unreachable!())
});

static ITALIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:em|i)\b[^>]*>(.*?)</(?:em|i)\s*>").unwrap_or_else(|_| unreachable!())
});

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap_or_else(|_| unreachable!()));

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<li\b[^>]*>").unwrap_or_else(|_| unreachable!()));

static BLOCK_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(?:p|div|h[1-6]|blockquote|ul|ol|table|tr|pre|section|article)\s*>|<hr\s*/?>")
        .unwrap_or_else(|_| unreachable!())
});

static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap_or_else(|_| unreachable!()));

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").unwrap_or_else(|_| unreachable!())
});

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").unwrap_or_else(|_| unreachable!()));

/// Converts an HTML fragment to Markdown-flavored plain text.
#[must_use]
pub fn html_to_markdown(html: &str) -> String {
    let text = SCRIPT_OR_STYLE.replace_all(html, "");
    let text = WHITESPACE.replace_all(&text, " ");

    let text = IMAGE.replace_all(&text, |caps: &Captures<'_>| {
        attribute(&SRC_ATTR, &caps[1]).map_or_else(String::new, |src| format!("[Media]({src})"))
    });
    let text = ANCHOR.replace_all(&text, |caps: &Captures<'_>| {
        let label = ANY_TAG.replace_all(&caps[2], "").trim().to_string();
        match attribute(&HREF_ATTR, &caps[1]) {
            Some(href) if label.is_empty() => href,
            Some(href) => format!("[{label}]({href})"),
            None => label,
        }
    });
    let text = BOLD.replace_all(&text, "*$1*");
    let text = ITALIC.replace_all(&text, "_${1}_");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = LIST_ITEM.replace_all(&text, "\n- ");
    let text = BLOCK_END.replace_all(&text, "\n\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = decode_entities(&text);

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    EXCESS_NEWLINES
        .replace_all(joined.trim(), "\n\n")
        .into_owned()
}

fn attribute(pattern: &Regex, attrs: &str) -> Option<String> {
    let caps = pattern.captures(attrs)?;
    let value = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
    let value = decode_entities(value.as_str());
    (!value.is_empty()).then_some(value)
}

fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures<'_>| {
            let name = &caps[1];
            let decoded = match name {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => numeric_entity(name),
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

fn numeric_entity(name: &str) -> Option<char> {
    let digits = name.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}
