//! Relay URL validation and normalization.

use crate::error::{PoolError, Result};
use url::Url;

/// Validate a relay URL and bring it to the form used as a pool key.
///
/// Only `ws://` and `wss://` are accepted. Scheme and host are lower-cased
/// by the parser; a trailing slash is dropped so `wss://a.example/` and
/// `wss://a.example` name the same relay.
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())?;

    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(PoolError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(PoolError::InvalidUrl(format!("missing host: {}", raw)));
    }

    let mut normalized = url.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

/// Normalize every URL, dropping duplicates while keeping first occurrence.
pub fn normalize_relay_urls<I, S>(urls: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        let url = normalize_relay_url(url.as_ref())?;
        if !out.contains(&url) {
            out.push(url);
        }
    }
    Ok(out)
}
