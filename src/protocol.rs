use std::collections::HashMap;

use anyhow::{Context, Result};
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};

/// Header carrying the absolute destination URL on the public peer.
pub const DESTINATION_HEADER: &str = "X-PROXY-DESTINATION";

/// Header carrying the shared secret on `/register`.
pub const SECRET_HEADER: &str = "X-SECRET-KEY";

/// Proxy-layer failure on the public peer.
pub const PROXY_ERROR_STATUS: u16 = 526;

/// Execution failure on the internal peer, forwarded through the tunnel.
pub const REMOTE_ERROR_STATUS: u16 = 527;

/// Greeting sent by the internal peer as the first text frame on `/register`.
///
/// `id` groups all tunnels of one internal peer into a single server-side
/// pool. `pool_size` is the number of idle tunnels the peer intends to
/// maintain; the server-side garbage collector uses it as the keep count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "PoolSize")]
    pub pool_size: usize,
    #[serde(rename = "ConnectionId")]
    pub connection_id: u64,
}

impl ClientSettings {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("unable to parse client settings")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("unable to serialize client settings")
    }
}

/// Serializable shape of an HTTP request, sent as the first frame of an
/// exchange. The body is not part of this shape; it travels as the next
/// binary frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Header")]
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

/// Serializable shape of an HTTP response, sent as the third frame of an
/// exchange. The body follows as the fourth (binary) frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
    #[serde(rename = "Header")]
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

impl ResponseFrame {
    /// Synthesized response for a request the internal peer could not
    /// execute. The error string travels as the response body.
    pub fn error(message: &str) -> Self {
        Self {
            status_code: REMOTE_ERROR_STATUS,
            header: HashMap::new(),
            content_length: message.len() as i64,
        }
    }
}

/// Convert a hyper header map to the serializable multimap shape.
pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Rebuild a hyper header map from the serializable multimap shape.
/// Names or values that are not valid HTTP header tokens are skipped.
pub fn headers_from_map(map: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}
