//! Remote source of truth
//!
//! The upstream project publishes a free-text status document containing a
//! `timestamp=<ISO-8601>` marker for its last update.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

static TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"timestamp=(\S+)").expect("static regex must compile"));

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("No timestamp marker in remote payload")]
    MissingTimestamp,
    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

pub trait RemoteTruth {
    type Error: std::error::Error;

    /// Last update of the remote source, in unix seconds.
    fn last_update(&self) -> impl Future<Output = Result<i64, Self::Error>> + Send;
}

/// Unix seconds of the first `timestamp=` marker in `payload`.
pub fn parse_timestamp(payload: &str) -> Result<i64, Error> {
    let raw = TIMESTAMP
        .captures(payload)
        .and_then(|captures| captures.get(1))
        .ok_or(Error::MissingTimestamp)?
        .as_str()
        // escaped colons appear in osmosis state files
        .replace("\\:", ":");
    if let Ok(datetime) = chrono::DateTime::parse_from_rfc3339(&raw) {
        return Ok(datetime.timestamp());
    }
    chrono::NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|datetime| datetime.and_utc().timestamp())
        .map_err(|_| Error::InvalidTimestamp(raw))
}

pub struct HttpRemoteTruth {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpRemoteTruth {
    pub fn new(client: reqwest::Client, url: url::Url) -> Self {
        Self { client, url }
    }
}

impl RemoteTruth for HttpRemoteTruth {
    type Error = Error;

    async fn last_update(&self) -> Result<i64, Error> {
        let payload = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let timestamp = parse_timestamp(&payload)?;
        trace!(url = %self.url, timestamp, "remote last update");
        Ok(timestamp)
    }
}
