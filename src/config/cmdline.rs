//! Kernel command line configuration
//!
//! Two sources are recognised:
//! - inline payloads, `cc: <yaml> end_cc`, possibly repeated and
//!   percent-encoded, with literal `\n` standing for a newline;
//! - `cloud-config-url=<url>` (or `url=<url>`), whose body is only accepted
//!   when it starts with the `#cloud-config` marker.

use super::aggregate::{Domain, Fragment};
use super::is_cloud_config;
use crate::CloudInitError;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

const CC_BEGIN: &str = "cc:";
const CC_END: &str = "end_cc";
const URL_KEYS: [&str; 2] = ["cloud-config-url", "url"];

/// Read the kernel command line; a missing file reads as empty
pub async fn read_cmdline(path: impl AsRef<Path>) -> Result<String, CloudInitError> {
    match fs::read_to_string(path.as_ref()).await {
        Ok(content) => Ok(content.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Collect every `cc: ... end_cc` payload into one document
pub fn read_cc_payload(cmdline: &str) -> Option<String> {
    let mut tokens = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = cmdline[search_from..].find(CC_BEGIN) {
        let begin = search_from + offset + CC_BEGIN.len();
        let end = cmdline[begin..]
            .find(CC_END)
            .map(|i| begin + i)
            .unwrap_or(cmdline.len());

        let raw = cmdline[begin..end].trim_start();
        let decoded = urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        tokens.push(decoded.replace("\\n", "\n"));

        search_from = (end + CC_END.len()).min(cmdline.len());
    }

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join("\n"))
    }
}

/// Inline `cc:` payload as a fragment
pub fn inline_fragment(cmdline: &str) -> Option<Fragment> {
    read_cc_payload(cmdline).map(|payload| {
        debug!("Found inline cloud-config on the kernel command line");
        Fragment::raw("kernel-cmdline:cc", Domain::KernelCmdline, payload)
    })
}

/// Value of the first `cloud-config-url=`/`url=` parameter
pub fn config_url(cmdline: &str) -> Option<&str> {
    URL_KEYS.iter().find_map(|key| {
        cmdline.split_whitespace().find_map(|token| {
            token
                .split_once('=')
                .filter(|(k, v)| k == key && !v.is_empty())
                .map(|(_, v)| v)
        })
    })
}

/// Fetch the `cloud-config-url` payload, keeping it only if it is cloud-config
pub async fn fetch_url_fragment(
    cmdline: &str,
    timeout: Duration,
) -> Result<Option<Fragment>, CloudInitError> {
    let Some(url) = config_url(cmdline) else {
        return Ok(None);
    };

    info!("Fetching cloud-config from kernel command line url: {}", url);
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(CloudInitError::Http(format!(
            "Fetching {} returned {}",
            url,
            response.status()
        )));
    }

    let body = response.text().await?;
    if !is_cloud_config(&body) {
        warn!(
            "Ignoring content from {}: it does not start with #cloud-config",
            url
        );
        return Ok(None);
    }

    Ok(Some(Fragment::raw(
        format!("kernel-cmdline:{url}"),
        Domain::KernelCmdline,
        body,
    )))
}
