//! Tile render tracking
//!
//! A tracking store remembers when each tile was last rendered and which
//! cooldown windows are active. The decision engine is its only client.

pub mod sqlite;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::grid::{BoundingBox, Tile};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub kit: String,
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(kit: impl Into<String>, tile: &Tile) -> Self {
        Self {
            kit: kit.into(),
            z: tile.z,
            x: tile.x,
            y: tile.y,
        }
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}/{}", self.kit, self.z, self.x, self.y)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Rendered,
    Skipped,
    Cooled,
}

impl TileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rendered => "rendered",
            Self::Skipped => "skipped",
            Self::Cooled => "cooled",
        }
    }
}

impl std::fmt::Display for TileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rendered" => Ok(Self::Rendered),
            "skipped" => Ok(Self::Skipped),
            "cooled" => Ok(Self::Cooled),
            other => Err(format!("unknown tile status {other:?}")),
        }
    }
}

/// Tracking record of one tile. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDetail {
    pub kit: String,
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub state: Option<i64>,
    pub status: TileStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub rendered_at: Option<i64>,
    pub update_count: i64,
    pub skip_count: i64,
    pub cool_count: i64,
    pub location: String,
}

impl TileDetail {
    /// Moment the stored output was last known to be current.
    pub fn fresh_since(&self) -> i64 {
        self.rendered_at.unwrap_or(self.updated_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileUpdate {
    pub status: TileStatus,
    pub state: Option<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownWindow {
    /// Seconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CooldownQuery {
    pub area: Option<BoundingBox>,
    pub kits: Vec<String>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub enabled: bool,
}

pub trait TrackingStore {
    type Error: std::error::Error + Send;

    fn get_tile_detail(
        &self,
        key: &TileKey,
    ) -> impl Future<Output = Result<Option<TileDetail>, Self::Error>> + Send;

    /// Records a decision outcome. A `rendered` outcome creates the record
    /// when missing; other outcomes only touch existing records.
    fn set_tile_detail(
        &self,
        key: &TileKey,
        update: &TileUpdate,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Matching cooldown windows, produced lazily one batch at a time.
    fn query_cooldowns<'a>(
        &'a self,
        query: &'a CooldownQuery,
    ) -> BoxStream<'a, Result<Vec<CooldownWindow>, Self::Error>>;
}
