//! RFC822/MIME parsing: headers, multipart structure, attachment filenames.
//!
//! Wraps `mailparse` with the header-folding and attachment-filename
//! conventions described in spec.md §4.2. `mailparse` already performs the
//! MIME-structure split (headers/body, multipart boundaries, recursive
//! subparts); this module adds the case-insensitive merged-header view and
//! the attachment classification spec.md asks for on top of it.

use mailparse::{MailHeaderMap, ParsedMail, parse_mail};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MimeParseError {
    #[error("failed to parse MIME structure: {0}")]
    Parse(#[from] mailparse::MailParseError),
}

/// A single leaf MIME part: its own headers and decoded text body.
#[derive(Debug, Clone)]
pub struct LeafPart {
    pub content_type: String,
    pub is_attachment: bool,
    pub filename: Option<String>,
    pub body: String,
}

/// A parsed message: merged headers plus the flattened leaf parts.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Header names are lower-cased; values for repeated headers are
    /// merged with ", " in the order they appeared.
    pub headers: BTreeMap<String, String>,
    pub leaves: Vec<LeafPart>,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn first_text_plain(&self) -> Option<&str> {
        self.leaves
            .iter()
            .find(|leaf| leaf.content_type == "text/plain")
            .map(|leaf| leaf.body.as_str())
    }

    pub fn first_text_html(&self) -> Option<&str> {
        self.leaves
            .iter()
            .find(|leaf| leaf.content_type == "text/html")
            .map(|leaf| leaf.body.as_str())
    }

    pub fn attachments(&self) -> impl Iterator<Item = &LeafPart> {
        self.leaves.iter().filter(|leaf| leaf.is_attachment)
    }
}

/// Parse raw RFC822 bytes into merged headers and flattened leaf parts.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, MimeParseError> {
    let parsed = parse_mail(raw)?;
    let headers = merge_headers(&parsed);
    let mut leaves = Vec::new();
    collect_leaves(&parsed, &mut leaves);
    Ok(ParsedMessage { headers, leaves })
}

fn merge_headers(parsed: &ParsedMail) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for header in parsed.get_headers() {
        let name = header.get_key().to_ascii_lowercase();
        let value = header.get_value();
        merged.entry(name).or_default().push(value);
    }
    merged
        .into_iter()
        .map(|(k, values)| (k, values.join(", ")))
        .collect()
}

fn collect_leaves(part: &ParsedMail, out: &mut Vec<LeafPart>) {
    if part.subparts.is_empty() {
        let content_type = part.ctype.mimetype.to_ascii_lowercase();
        let (is_attachment, filename) = classify_disposition(part);
        let body = if content_type.starts_with("text/") {
            part.get_body().unwrap_or_default()
        } else {
            String::new()
        };
        out.push(LeafPart {
            content_type,
            is_attachment,
            filename,
            body,
        });
    } else {
        for subpart in &part.subparts {
            collect_leaves(subpart, out);
        }
    }
}

/// Classify a leaf part as an attachment if it carries
/// `Content-Disposition: attachment` or a `filename`/`name` parameter on
/// either the Content-Disposition or Content-Type header. Filename
/// priority: `filename*`, `filename`, `name*`, `name` (the starred forms
/// are RFC2231 charset-encoded and decoded via the same RFC2047 path used
/// elsewhere, since mailparse already performs RFC2231 decoding of
/// parameter values).
fn classify_disposition(part: &ParsedMail) -> (bool, Option<String>) {
    let disposition = part.get_content_disposition();
    let is_attachment = disposition.disposition == mailparse::DispositionType::Attachment;

    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());

    let has_filename_param = filename.is_some();
    (is_attachment || has_filename_param, filename)
}
