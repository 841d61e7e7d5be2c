//! Content type detection for user-data and vendor-data
//!
//! A payload is classified by its gzip magic, its first-line header
//! (`#cloud-config`, `#!`, `#include`, ...), a multipart `Content-Type`, or
//! failing all of those by looking like base64.

use crate::template::is_jinja_template;
use std::fmt;

/// Kinds of payload a datasource may hand over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Cloud-config YAML (`#cloud-config`)
    CloudConfig,
    /// `## template: jinja`; rendered, then classified again
    JinjaTemplate,
    /// Shell script (`#!`)
    Script,
    /// `#cloud-boothook`
    CloudBoothook,
    /// `#include` list of URLs
    IncludeUrl,
    /// `#part-handler`
    PartHandler,
    /// Gzip compressed data
    Gzip,
    /// MIME multipart message
    Multipart,
    /// Base64 encoded data
    Base64,
    Unknown,
}

/// First-line headers, checked in order
const HEADERS: [(&str, ContentType); 6] = [
    ("#cloud-config", ContentType::CloudConfig),
    ("#cloud-boothook", ContentType::CloudBoothook),
    ("#include", ContentType::IncludeUrl),
    ("#part-handler", ContentType::PartHandler),
    ("#!", ContentType::Script),
    ("#upstart-job", ContentType::Script),
];

impl ContentType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::CloudConfig => "text/cloud-config",
            Self::JinjaTemplate => "text/jinja2",
            Self::Script => "text/x-shellscript",
            Self::CloudBoothook => "text/cloud-boothook",
            Self::IncludeUrl => "text/x-include-url",
            Self::PartHandler => "text/part-handler",
            Self::Gzip => "application/x-gzip",
            Self::Multipart => "multipart/mixed",
            Self::Base64 => "text/plain",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// Classify a MIME type; parameters after `;` are ignored
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        let mime = mime.split(';').next().unwrap_or_default().trim();

        match mime {
            "text/cloud-config" | "text/x-cloud-config" => Self::CloudConfig,
            "text/jinja2" | "text/x-jinja2" => Self::JinjaTemplate,
            "text/x-shellscript" | "text/x-sh" | "text/upstart-job" => Self::Script,
            "text/cloud-boothook" => Self::CloudBoothook,
            "text/x-include-url" | "text/x-include-once-url" => Self::IncludeUrl,
            "text/part-handler" => Self::PartHandler,
            "application/x-gzip" | "application/gzip" => Self::Gzip,
            m if m.starts_with("multipart/") => Self::Multipart,
            _ => Self::Unknown,
        }
    }

    /// Classify raw bytes
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            return Self::Gzip;
        }

        match std::str::from_utf8(data) {
            Ok(text) => Self::detect_from_text(text),
            Err(_) => Self::Unknown,
        }
    }

    pub fn detect_from_text(text: &str) -> Self {
        let trimmed = text.trim_start();

        if is_jinja_template(trimmed) {
            return Self::JinjaTemplate;
        }

        if let Some((_, kind)) = HEADERS.iter().find(|(header, _)| trimmed.starts_with(header)) {
            return *kind;
        }

        if is_multipart_message(trimmed) {
            return Self::Multipart;
        }

        if looks_like_base64(trimmed.as_bytes()) {
            return Self::Base64;
        }

        Self::Unknown
    }

    /// Whether this payload contributes configuration
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::CloudConfig | Self::JinjaTemplate)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_type())
    }
}

/// A message whose top-level headers declare a multipart content type
fn is_multipart_message(text: &str) -> bool {
    text.lines()
        .take_while(|line| !line.trim().is_empty())
        .any(|line| {
            let lower = line.to_ascii_lowercase();
            lower.starts_with("content-type:") && lower.contains("multipart/")
        })
}

/// Only base64 alphabet and whitespace, in whole quads, with no padding
/// before the end
fn looks_like_base64(data: &[u8]) -> bool {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    if compact.len() < 4 || compact.len() % 4 != 0 {
        return false;
    }

    let body = compact
        .iter()
        .rposition(|&b| b != b'=')
        .map(|end| &compact[..=end])
        .unwrap_or_default();

    compact.len() - body.len() <= 2
        && body
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}
