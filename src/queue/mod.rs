//! Job queue
//!
//! This module defines the queue capability the worker consumes from, the
//! job payload, and the [`Consumer`] that drives concurrent
//! fetch/process/acknowledge loops.

mod consumer;
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::grid::Tile;

pub use consumer::Consumer;

pub type JobId = i64;

/// Payload of a rendering job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TileJob {
    #[serde(flatten)]
    pub tile: Tile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<i64>,
}

impl TileJob {
    pub fn new(tile: Tile) -> Self {
        Self {
            tile,
            force: None,
            parent: None,
            state: None,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.force == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub data: TileJob,
}

/// A durable queue with fetch-and-lease semantics.
///
/// A fetched job stays leased to the caller until it is completed or failed.
pub trait JobQueue {
    type Error: std::error::Error;

    /// Lease the next available job, or `None` when the queue is empty.
    fn fetch(&self) -> impl Future<Output = Result<Option<Job>, Self::Error>>;

    fn complete(&self, id: JobId) -> impl Future<Output = Result<(), Self::Error>>;

    fn fail(&self, id: JobId, error: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_payload() {
        let job: TileJob =
            serde_json::from_str(r#"{"z":3,"x":1,"y":2,"metatile":8,"force":true,"state":7}"#)
                .unwrap();
        assert_eq!(job.tile, Tile::new(3, 1, 2).with_metatile(8));
        assert!(job.is_forced());
        assert_eq!(job.state, Some(7));
        assert_eq!(job.parent, None);
    }

    #[test]
    fn metatile_defaults_to_one() {
        let job: TileJob = serde_json::from_str(r#"{"z":0,"x":1,"y":0}"#).unwrap();
        assert_eq!(job.tile.metatile, 1);
        assert!(!job.is_forced());
    }
}
