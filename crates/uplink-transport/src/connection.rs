//! RTMP endpoint parsing.

use url::Url;

use crate::error::TransportError;
use crate::TransportResult;

/// Default RTMP port.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// A parsed `rtmp[s]://host[:port]/app/stream-key` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpEndpoint {
    pub host: String,
    pub port: u16,
    /// Application name (first path segment).
    pub app: String,
    /// Stream key (remaining path, query string included).
    pub stream_key: String,
}

impl RtmpEndpoint {
    /// Parse a publish URL.
    pub fn parse(url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "rtmp" | "rtmps" => {}
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{}', expected rtmp or rtmps",
                    other
                )))
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl("missing host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_RTMP_PORT);

        let path = parsed.path().trim_start_matches('/');
        let (app, key) = path.split_once('/').unwrap_or((path, ""));

        if app.is_empty() {
            return Err(TransportError::InvalidUrl(
                "missing application name in URL path".to_string(),
            ));
        }
        if key.is_empty() {
            return Err(TransportError::InvalidUrl(
                "missing stream key in URL path".to_string(),
            ));
        }

        let stream_key = match parsed.query() {
            Some(query) => format!("{}?{}", key, query),
            None => key.to_string(),
        };

        Ok(Self {
            host,
            port,
            app: app.to_string(),
            stream_key,
        })
    }

    /// `host:port` for the TCP connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
