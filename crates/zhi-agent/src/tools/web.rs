//! Web fetch: download a page and reduce it to plain text.
//!
//! Redirects are followed by hand so every hop passes the same
//! private-address check as the first URL.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use tracing::{debug, warn};
use zhi_core::utils::truncate_at_char_boundary;

use super::base::{require_string, Tool};

const USER_AGENT: &str = concat!("zhi/", env!("CARGO_PKG_VERSION"));

/// Content cap in bytes.
const MAX_CONTENT_SIZE: usize = 50 * 1024;

const TIMEOUT_SECS: u64 = 30;

const MAX_REDIRECTS: usize = 5;

/// Hostnames refused regardless of what they resolve to.
const BLOCKED_HOSTS: &[&str] = &["localhost", "metadata.google.internal", "metadata"];

// ─────────────────────────────────────────────
// WebFetchTool
// ─────────────────────────────────────────────

pub struct WebFetchTool {
    client: Client,
    /// Tests point the tool at a local mock server.
    allow_private: bool,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent(USER_AGENT)
                .redirect(reqwest::redirect::Policy::none())
                .timeout(Duration::from_secs(TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            allow_private: false,
        }
    }

    #[cfg(test)]
    fn allowing_private() -> Self {
        Self {
            allow_private: true,
            ..Self::new()
        }
    }

    fn check_target(&self, url: &Url) -> anyhow::Result<()> {
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Invalid URL. Must start with http:// or https://.");
        }
        if !self.allow_private && is_blocked_host(url) {
            warn!(url = %url, "blocked fetch of internal address");
            anyhow::bail!("Access to internal/private addresses is not allowed.");
        }
        Ok(())
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch the text content of a web page. \
         HTML is converted to plain text. \
         Response capped at 50KB."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch."
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let raw_url = require_string(&params, "url")?;
        if !raw_url.starts_with("http://") && !raw_url.starts_with("https://") {
            anyhow::bail!("Invalid URL. Must start with http:// or https://.");
        }
        let mut current =
            Url::parse(&raw_url).map_err(|_| anyhow::anyhow!("Could not parse URL."))?;
        self.check_target(&current)?;

        let mut response = None;
        for _ in 0..MAX_REDIRECTS {
            debug!(url = %current, "fetching");
            let resp = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| request_error(e, &raw_url))?;

            if !resp.status().is_redirection() {
                response = Some(resp);
                break;
            }
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow::anyhow!("Redirect with no Location header."))?;
            let next = current
                .join(location)
                .map_err(|_| anyhow::anyhow!("Could not parse URL."))?;
            self.check_target(&next)?;
            current = next;
        }
        let Some(resp) = response else {
            anyhow::bail!("Too many redirects (>{MAX_REDIRECTS}).");
        };

        let status = resp.status();
        if status.as_u16() != 200 {
            anyhow::bail!("HTTP {} for {raw_url}.", status.as_u16());
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Request failed: {e}"))?;

        let head = body.trim_start();
        let is_html =
            content_type.contains("html") || head.starts_with("<!") || head.starts_with("<html");
        let text = if is_html { html_to_text(&body) } else { body.clone() };

        if text.trim().is_empty() {
            return Ok("Page returned no extractable text content.".into());
        }
        if text.len() > MAX_CONTENT_SIZE {
            return Ok(format!(
                "{}\n[truncated, showing first 50KB of {}B]",
                truncate_at_char_boundary(&text, MAX_CONTENT_SIZE),
                body.len()
            ));
        }
        Ok(text)
    }
}

fn request_error(err: reqwest::Error, url: &str) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("Request timed out after {TIMEOUT_SECS}s.")
    } else if err.is_connect() {
        anyhow::anyhow!("Could not connect to {url}.")
    } else {
        anyhow::anyhow!("Request failed: {err}")
    }
}

// ─────────────────────────────────────────────
// Address checks
// ─────────────────────────────────────────────

fn is_blocked_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_private_ip(ip);
    }
    let host = host.trim_end_matches('.').to_lowercase();
    BLOCKED_HOSTS.contains(&host.as_str()) || host.ends_with(".localhost")
}

/// Private, loopback, link-local, and reserved ranges.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link-local
                || (first == 0x2001 && v6.segments()[1] == 0x0db8) // documentation
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || (a == 100 && (64..128).contains(&b)) // shared address space
        || (a == 192 && b == 0 && ip.octets()[2] == 0) // IETF protocol assignments
        || (a == 198 && (b == 18 || b == 19)) // benchmarking
        || a >= 240 // reserved
}

// ─────────────────────────────────────────────
// HTML → text
// ─────────────────────────────────────────────

struct HtmlPatterns {
    script: Regex,
    style: Regex,
    br: Regex,
    block_end: Regex,
    tag: Regex,
    numeric_entity: Regex,
    spaces: Regex,
    blank_lines: Regex,
}

fn html_patterns() -> Option<&'static HtmlPatterns> {
    static PATTERNS: OnceLock<Option<HtmlPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(HtmlPatterns {
                script: Regex::new(r"(?is)<script[^>]*>.*?</script>").ok()?,
                style: Regex::new(r"(?is)<style[^>]*>.*?</style>").ok()?,
                br: Regex::new(r"(?i)<br\s*/?>").ok()?,
                block_end: Regex::new(r"(?i)</(?:p|div|h[1-6]|li|tr)>").ok()?,
                tag: Regex::new(r"<[^>]+>").ok()?,
                numeric_entity: Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").ok()?,
                spaces: Regex::new(r"[ \t]+").ok()?,
                blank_lines: Regex::new(r"\n{3,}").ok()?,
            })
        })
        .as_ref()
}

/// Drop scripts, styles and tags, decode entities, collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    let Some(p) = html_patterns() else {
        return html.to_string();
    };
    let text = p.script.replace_all(html, "");
    let text = p.style.replace_all(&text, "");
    let text = p.br.replace_all(&text, "\n");
    let text = p.block_end.replace_all(&text, "\n");
    let text = p.tag.replace_all(&text, "");
    let text = p.numeric_entity.replace_all(&text, |caps: &regex::Captures<'_>| {
        let code = &caps[1];
        let parsed = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse().ok(),
        };
        parsed
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    let text = p.spaces.replace_all(&text, " ");
    let text = p.blank_lines.replace_all(&text, "\n\n");
    text.trim().to_string()
}
