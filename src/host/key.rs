use thiserror::Error;

/// Error deriving a host key from a request url.
#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("invalid url `{url}`: {source}")]
    Parse {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("url missing host: {0}")]
    MissingHost(String),
    #[error("url missing port and scheme has no default: {0}")]
    UnknownPort(String),
}

/// Key used to index per-host slot tracking.
///
/// Urls are normalised down to `(scheme, host, port)` so different paths on
/// the same origin share one concurrency ceiling, with default ports made
/// explicit (`https://example.com/a` and `https://example.com:443/b` land in
/// the same bucket).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    /// Derive a host key from a url string.
    pub fn from_url(url: &str) -> Result<Self, HostKeyError> {
        let parsed = url::Url::parse(url).map_err(|source| HostKeyError::Parse {
            url: url.to_string(),
            source,
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| HostKeyError::MissingHost(url.to_string()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| HostKeyError::UnknownPort(url.to_string()))?;

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port,
        })
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
