//! Splits a raw email into freshly written text and quoted/forwarded
//! thread context, preferring text/plain, falling back to text/html with
//! DOM-based tag stripping, then to "everything after the header block".
//!
//! The new/quoted split walks the body line by line building a drop mask,
//! mirroring the line-drop-mask style used for patch-payload stripping in
//! the teacher's search sanitizer: mark lines to exclude from `new_text`,
//! then join what's left.

use crate::mime_parser::ParsedMessage;
use scraper::{Html, Selector};

#[derive(Debug, Clone, Default)]
pub struct ExtractedBody {
    pub new_text: String,
    pub quoted_text: String,
}

const SEPARATOR_LINES: &[&str] = &[
    "-----original message-----",
    "begin forwarded message:",
];

/// Extract `{new_text, quoted_text}` from a parsed message, per spec.md
/// §4.3. `raw` is the original bytes, used for the header-block fallback
/// when no text leaf is present at all.
pub fn extract_body(message: &ParsedMessage, raw: &[u8]) -> ExtractedBody {
    if let Some(plain) = message.first_text_plain() {
        return split_plain_text(plain);
    }
    if let Some(html) = message.first_text_html() {
        return split_html(html);
    }
    split_plain_text(&everything_after_headers(raw))
}

fn everything_after_headers(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match text.find("\r\n\r\n").or_else(|| text.find("\n\n")) {
        Some(idx) => {
            let sep_len = if text[idx..].starts_with("\r\n\r\n") { 4 } else { 2 };
            text[idx + sep_len..].to_string()
        }
        None => String::new(),
    }
}

/// Split plain text into new vs quoted content. Heuristics, in order:
/// explicit separator lines, `On ... wrote:` attribution lines, `From:`
/// lines containing `@`, lines beginning with `>`, and an attribution
/// intro line ending in `:` followed (past blank lines) by a quoted line.
/// If no explicit header is found, trailing `>`-prefixed lines are peeled
/// off instead.
fn split_plain_text(body: &str) -> ExtractedBody {
    let lines: Vec<&str> = body.lines().collect();

    if let Some(split_at) = find_explicit_quote_header(&lines) {
        let new_text = join_trimmed(&lines[..split_at]);
        let quoted_text = join_trimmed(&lines[split_at..]);
        return ExtractedBody { new_text, quoted_text };
    }

    // No explicit header: peel trailing `>`-prefixed lines.
    let mut split_at = lines.len();
    while split_at > 0 && is_quote_marker_line(lines[split_at - 1]) {
        split_at -= 1;
    }
    let new_text = join_trimmed(&lines[..split_at]);
    let quoted_text = join_trimmed(&lines[split_at..]);
    ExtractedBody { new_text, quoted_text }
}

fn find_explicit_quote_header(lines: &[&str]) -> Option<usize> {
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();

        if SEPARATOR_LINES.iter().any(|sep| lower == *sep) {
            return Some(idx);
        }
        if is_on_wrote_line(trimmed) {
            return Some(idx);
        }
        if lower.starts_with("from:") && trimmed.contains('@') {
            return Some(idx);
        }
        if trimmed.starts_with('>') {
            return Some(idx);
        }
        if trimmed.ends_with(':') && !trimmed.is_empty() {
            if let Some(next_quoted) = next_nonblank_is_quote(lines, idx + 1) {
                if next_quoted {
                    return Some(idx);
                }
            }
        }
    }
    None
}

fn next_nonblank_is_quote(lines: &[&str], start: usize) -> Option<bool> {
    for line in lines.iter().skip(start) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Some(trimmed.starts_with('>'));
    }
    None
}

fn is_on_wrote_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("on ") && lower.contains("wrote:")
}

fn is_quote_marker_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('>')
}

fn join_trimmed(lines: &[&str]) -> String {
    lines.join("\n").trim().to_string()
}

/// Split HTML body: `blockquote, .gmail_quote, .yahoo_quoted,
/// #divRplyFwdMsg` nodes are quoted content; the remainder (with
/// script/style/head/noscript dropped) is new content.
fn split_html(html: &str) -> ExtractedBody {
    let document = Html::parse_document(html);

    let quote_selector =
        Selector::parse("blockquote, .gmail_quote, .yahoo_quoted, #divRplyFwdMsg").unwrap();
    let noise_selector = Selector::parse("script, style, head, noscript").unwrap();

    let quoted_text: Vec<String> = document
        .select(&quote_selector)
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let mut new_text = String::new();
    collect_new_text(document.root_element(), &quote_selector, &noise_selector, &mut new_text);

    ExtractedBody {
        new_text: collapse_whitespace(&new_text),
        quoted_text: quoted_text.join("\n\n"),
    }
}

/// Recurse into everything except subtrees rooted at a quote or noise
/// element, so quoted/noise text never leaks into `new_text` regardless of
/// nesting depth.
fn collect_new_text(
    element: scraper::ElementRef,
    quote_selector: &Selector,
    noise_selector: &Selector,
    out: &mut String,
) {
    for child in element.children() {
        if let Some(child_el) = scraper::ElementRef::wrap(child) {
            if quote_selector.matches(&child_el) || noise_selector.matches(&child_el) {
                continue;
            }
            collect_new_text(child_el, quote_selector, noise_selector, out);
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_on_wrote_attribution() {
        let body = "Sounds good to me.\n\nOn Mon, Jan 1, 2024 at 10:00 AM, Alice <alice@example.com> wrote:\n> original question\n> more quote";
        let result = split_plain_text(body);
        assert_eq!(result.new_text, "Sounds good to me.");
        assert!(result.quoted_text.starts_with("On Mon"));
    }

    #[test]
    fn splits_on_explicit_separator() {
        let body = "My reply here.\n\n-----Original Message-----\nFrom: bob@example.com\nOld content";
        let result = split_plain_text(body);
        assert_eq!(result.new_text, "My reply here.");
        assert!(result.quoted_text.contains("Old content"));
    }

    #[test]
    fn peels_trailing_quote_markers_without_header() {
        let body = "New content here\n> quoted line one\n> quoted line two";
        let result = split_plain_text(body);
        assert_eq!(result.new_text, "New content here");
        assert!(result.quoted_text.contains("quoted line one"));
    }

    #[test]
    fn no_quote_present_all_new() {
        let body = "Just a plain message with no quoting at all.";
        let result = split_plain_text(body);
        assert_eq!(result.new_text, body);
        assert!(result.quoted_text.is_empty());
    }

    #[test]
    fn splits_html_blockquote_as_quoted() {
        let html = "<html><body><p>Hello there</p><blockquote>Old reply text</blockquote></body></html>";
        let result = split_html(html);
        assert!(result.new_text.contains("Hello there"));
        assert!(result.quoted_text.contains("Old reply text"));
        assert!(!result.new_text.contains("Old reply text"));
    }

    #[test]
    fn splits_html_drops_script_and_style() {
        let html = "<html><head><style>.x{color:red}</style></head><body><script>evil()</script><p>Visible text</p></body></html>";
        let result = split_html(html);
        assert!(result.new_text.contains("Visible text"));
        assert!(!result.new_text.contains("evil"));
        assert!(!result.new_text.contains("color:red"));
    }
}
