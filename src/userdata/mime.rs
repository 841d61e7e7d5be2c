//! MIME multipart splitting
//!
//! Only what user-data needs: a boundary from the top-level headers,
//! per-part headers (folded continuation lines joined, names lower-cased)
//! and the `base64` / `quoted-printable` transfer encodings. Bodies are
//! decoded per part, so one badly encoded part leaves the others usable,
//! and decode to bytes because a part may itself be gzip data.

use super::types::ContentType;
use crate::CloudInitError;
use base64::Engine;
use std::collections::HashMap;
use tracing::debug;

/// One part of a multipart message
#[derive(Debug, Clone)]
pub struct MimePart {
    pub content_type: ContentType,
    /// Declared MIME type, `text/plain` when absent
    pub mime_type: String,
    /// Body as it appears in the message
    pub body: String,
    /// Lower-cased `Content-Transfer-Encoding`
    pub encoding: Option<String>,
    /// From `Content-Disposition`
    pub filename: Option<String>,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
}

impl MimePart {
    /// `Merge-Type`, falling back to `X-Merge-Type`
    pub fn merge_type(&self) -> Option<&str> {
        self.headers
            .get("merge-type")
            .or_else(|| self.headers.get("x-merge-type"))
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Body after transfer decoding
    pub fn content(&self) -> Result<Vec<u8>, CloudInitError> {
        match self.encoding.as_deref() {
            Some("base64") => decode_base64(&self.body),
            Some("quoted-printable") => Ok(decode_quoted_printable(&self.body)),
            _ => Ok(self.body.as_bytes().to_vec()),
        }
    }
}

/// Split a multipart message into its parts
pub fn parse_multipart(data: &str) -> Result<Vec<MimePart>, CloudInitError> {
    let (top_headers, _) = split_headers(data);
    let boundary = top_headers
        .get("content-type")
        .and_then(|ct| header_param(ct, "boundary"))
        .ok_or_else(|| CloudInitError::InvalidData("No MIME boundary found".to_string()))?;
    debug!("Found MIME boundary: {}", boundary);

    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();

    // The first section is the preamble; a section starting with `--` follows
    // the closing delimiter
    for section in data.split(delimiter.as_str()).skip(1) {
        if section.starts_with("--") {
            break;
        }
        let section = section
            .strip_prefix("\r\n")
            .or_else(|| section.strip_prefix('\n'))
            .unwrap_or(section);
        let section = strip_line_break(section);
        if section.trim().is_empty() {
            continue;
        }
        parts.push(parse_part(section));
    }

    debug!("Parsed {} MIME parts", parts.len());
    Ok(parts)
}

fn parse_part(section: &str) -> MimePart {
    let (headers, body) = split_headers(section);

    let mime_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "text/plain".to_string());

    let filename = headers
        .get("content-disposition")
        .and_then(|cd| header_param(cd, "filename"));

    let encoding = headers
        .get("content-transfer-encoding")
        .map(|e| e.trim().to_ascii_lowercase());

    MimePart {
        content_type: ContentType::from_mime(&mime_type),
        mime_type,
        body: body.to_string(),
        encoding,
        filename,
        headers,
    }
}

/// Split a header block from its body at the first empty line
fn split_headers(data: &str) -> (HashMap<String, String>, &str) {
    let (head, body) = match (data.find("\r\n\r\n"), data.find("\n\n")) {
        (Some(crlf), Some(lf)) if lf < crlf => (&data[..lf], &data[lf + 2..]),
        (Some(crlf), _) => (&data[..crlf], &data[crlf + 4..]),
        (None, Some(lf)) => (&data[..lf], &data[lf + 2..]),
        (None, None) => (data, ""),
    };

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut last: Option<String> = None;

    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some(value) = last.as_ref().and_then(|name| headers.get_mut(name)) {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            headers.insert(name.clone(), value.trim().to_string());
            last = Some(name);
        }
    }

    (headers, body)
}

/// Value of `name=` in a header such as `multipart/mixed; boundary="x"`
fn header_param(header: &str, name: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// The line break before a delimiter belongs to the delimiter
fn strip_line_break(body: &str) -> &str {
    body.strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body)
}

fn decode_base64(data: &str) -> Result<Vec<u8>, CloudInitError> {
    let clean: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(clean)
        .map_err(|e| CloudInitError::InvalidData(format!("Base64 decode error: {}", e)))
}

fn decode_quoted_printable(data: &str) -> Vec<u8> {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        let rest = &bytes[i + 1..];
        if rest.starts_with(b"\r\n") {
            i += 3;
        } else if rest.starts_with(b"\n") {
            i += 2;
        } else if let Some(byte) = rest
            .get(..2)
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(byte);
            i += 3;
        } else {
            out.push(b'=');
            i += 1;
        }
    }

    out
}
