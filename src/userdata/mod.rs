//! User-data and vendor-data processing
//!
//! Turns the raw bytes a datasource hands over into configuration
//! fragments:
//! - gzip data is decompressed and base64 text decoded, then classified
//!   again;
//! - `## template: jinja` documents are rendered with instance metadata,
//!   then classified again;
//! - multipart messages are split, and every configuration part becomes one
//!   fragment carrying its `Merge-Type` / `X-Merge-Type` header;
//! - scripts, boothooks, part handlers and `#include` lists are not
//!   configuration and are skipped.
//!
//! Problems with one payload never abort the others; they are reported as
//! [`FragmentError`]s next to the fragments that could be produced.

pub mod mime;
pub mod types;

pub use mime::{MimePart, parse_multipart};
pub use types::ContentType;

use crate::CloudInitError;
use crate::config::{Domain, Fragment, FragmentError};
use crate::datasources::InstanceMetadata;
use crate::template;
use base64::Engine;
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::{debug, warn};

/// Gzip, base64 and multipart layers may nest at most this deep
const MAX_DEPTH: usize = 8;

/// Fragments and problems found in one payload
#[derive(Debug, Default)]
pub struct Processed {
    pub fragments: Vec<Fragment>,
    pub errors: Vec<FragmentError>,
}

/// Split one raw payload into configuration fragments
///
/// `source` names the payload in logs and errors; parts of a multipart
/// message are named `<source>/<filename>` or `<source>/part-<n>`.
pub fn process_userdata(
    data: &[u8],
    domain: Domain,
    source: &str,
    metadata: &InstanceMetadata,
) -> Processed {
    let mut walker = Walker {
        domain,
        metadata,
        out: Processed::default(),
    };
    walker.walk(data, source.to_string(), None, 0);

    debug!(
        "{} produced {} fragments and {} errors",
        source,
        walker.out.fragments.len(),
        walker.out.errors.len()
    );
    walker.out
}

struct Walker<'a> {
    domain: Domain,
    metadata: &'a InstanceMetadata,
    out: Processed,
}

impl Walker<'_> {
    fn walk(&mut self, data: &[u8], source: String, merge_type: Option<String>, depth: usize) {
        if data.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let kind = ContentType::detect(data);
        self.dispatch(kind, data, source, merge_type, depth);
    }

    fn dispatch(
        &mut self,
        kind: ContentType,
        data: &[u8],
        source: String,
        merge_type: Option<String>,
        depth: usize,
    ) {
        if depth > MAX_DEPTH {
            self.error(source, "payload nested too deeply".to_string());
            return;
        }

        match kind {
            ContentType::CloudConfig => match std::str::from_utf8(data) {
                Ok(text) => {
                    let mut fragment = Fragment::raw(source, self.domain, text);
                    if let Some(header) = merge_type {
                        fragment = fragment.with_merge_type(header);
                    }
                    self.out.fragments.push(fragment);
                }
                Err(e) => self.error(source, format!("not valid UTF-8: {e}")),
            },
            ContentType::JinjaTemplate => {
                let rendered = String::from_utf8_lossy(data);
                match template::render_template(&rendered, self.metadata) {
                    Ok(text) => self.walk(text.as_bytes(), source, merge_type, depth + 1),
                    Err(e) => self.error(source, e.to_string()),
                }
            }
            ContentType::Gzip => match gunzip(data) {
                Ok(inflated) => self.walk(&inflated, source, merge_type, depth + 1),
                Err(e) => self.error(source, e.to_string()),
            },
            ContentType::Base64 => match decode_base64(data) {
                Ok(decoded) => self.walk(&decoded, source, merge_type, depth + 1),
                Err(e) => self.error(source, e.to_string()),
            },
            ContentType::Multipart => self.multipart(data, &source, depth),
            ContentType::Script
            | ContentType::CloudBoothook
            | ContentType::IncludeUrl
            | ContentType::PartHandler => {
                debug!("Skipping {} ({}): not configuration", source, kind);
            }
            ContentType::Unknown => {
                warn!("Skipping {}: unrecognised content", source);
            }
        }
    }

    fn multipart(&mut self, data: &[u8], source: &str, depth: usize) {
        let text = String::from_utf8_lossy(data);
        let parts = match parse_multipart(&text) {
            Ok(parts) => parts,
            Err(e) => return self.error(source.to_string(), e.to_string()),
        };

        for (index, part) in parts.into_iter().enumerate() {
            let name = match &part.filename {
                Some(filename) => format!("{source}/{filename}"),
                None => format!("{source}/part-{:03}", index + 1),
            };
            let content = match part.content() {
                Ok(content) => content,
                Err(e) => {
                    self.error(name, e.to_string());
                    continue;
                }
            };
            let merge_type = part.merge_type().map(str::to_string);

            // text/plain and unlisted types are classified by their content
            match part.content_type {
                ContentType::Unknown => self.walk(&content, name, merge_type, depth + 1),
                kind => self.dispatch(kind, &content, name, merge_type, depth + 1),
            }
        }
    }

    fn error(&mut self, source: String, message: String) {
        warn!("Skipping {} ({}): {}", source, self.domain, message);
        self.out.errors.push(FragmentError {
            source,
            domain: self.domain,
            message,
        });
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let mut inflated = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut inflated)
        .map_err(|e| CloudInitError::InvalidData(format!("Gzip decompression failed: {}", e)))?;
    Ok(inflated)
}

fn decode_base64(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(clean)
        .map_err(|e| CloudInitError::InvalidData(format!("Base64 decode error: {}", e)))
}
