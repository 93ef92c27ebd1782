//! Tile grid math
//!
//! Pure coordinate functions over a zoom-indexed world tile grid: bounds
//! validation, Y-axis flipping, geographic bounding boxes and storage key
//! templating. Nothing in here performs I/O.

use serde::{Deserialize, Serialize};

/// A square region at zoom `z` covering `metatile × metatile` base tiles.
///
/// `(x, y)` are expressed in the metatile's own coordinate space, with the
/// origin in the top-left corner of the grid.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
    #[serde(default = "default_metatile")]
    pub metatile: u32,
}

fn default_metatile() -> u32 {
    1
}

impl Tile {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self {
            z,
            x,
            y,
            metatile: 1,
        }
    }

    pub fn with_metatile(self, metatile: u32) -> Self {
        Self { metatile, ..self }
    }

    /// Base tile at grid cell `(row, col)` of this metatile, or `None` when
    /// its coordinates do not fit in `u32`.
    pub fn child(&self, row: u32, col: u32) -> Option<Tile> {
        Some(Tile {
            z: self.z,
            x: self.x.checked_mul(self.metatile)?.checked_add(col)?,
            y: self.y.checked_mul(self.metatile)?.checked_add(row)?,
            metatile: 1,
        })
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.metatile == 1 {
            write!(f, "{}/{}/{}", self.z, self.x, self.y)
        } else {
            write!(f, "{}/{}/{}@{}", self.z, self.x, self.y, self.metatile)
        }
    }
}

/// Geographic extent in grid units (degrees for [`TileGrid::WORLD_CRS84`]).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.west, self.south, self.east, self.north
        )
    }
}

/// A world tile grid whose tile count doubles on both axes per zoom level.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    /// Tile count along X at zoom 0.
    pub root_width: u32,
    /// Tile count along Y at zoom 0.
    pub root_height: u32,
    pub extent: BoundingBox,
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::WORLD_CRS84
    }
}

impl TileGrid {
    /// Two square tiles at zoom 0 covering the whole world in WGS84 degrees.
    pub const WORLD_CRS84: TileGrid = TileGrid {
        root_width: 2,
        root_height: 1,
        extent: BoundingBox {
            west: -180.0,
            south: -90.0,
            east: 180.0,
            north: 90.0,
        },
    };

    /// Deepest zoom whose tile counts still fit in `u32` on both axes.
    pub fn max_zoom(&self) -> u8 {
        let root = self.root_width.max(self.root_height).max(1);
        (u32::MAX / root).ilog2() as u8
    }

    // Zooms past 32 are clamped; `is_in_bounds` rejects them anyway.
    pub fn tile_count_x(&self, z: u8) -> u64 {
        (self.root_width as u64) << z.min(32)
    }

    pub fn tile_count_y(&self, z: u8) -> u64 {
        (self.root_height as u64) << z.min(32)
    }

    // A metatile overhanging the grid edge still counts as a valid cell.
    fn metatile_count_x(&self, tile: &Tile) -> u64 {
        self.tile_count_x(tile.z).div_ceil(tile.metatile.max(1) as u64)
    }

    fn metatile_count_y(&self, tile: &Tile) -> u64 {
        self.tile_count_y(tile.z).div_ceil(tile.metatile.max(1) as u64)
    }

    pub fn is_in_bounds(&self, tile: &Tile) -> bool {
        tile.metatile >= 1
            && tile.z <= self.max_zoom()
            && (tile.x as u64) < self.metatile_count_x(tile)
            && (tile.y as u64) < self.metatile_count_y(tile)
    }

    /// Y coordinate of `tile` in a bottom-left origin scheme.
    ///
    /// Returns `None` when the tile is outside the grid.
    pub fn flip_y(&self, tile: &Tile) -> Option<u32> {
        if !self.is_in_bounds(tile) {
            return None;
        }
        let flipped = self.metatile_count_y(tile) - tile.y as u64 - 1;
        Some(flipped as u32)
    }

    /// Extent covered by `tile`, including any part of a metatile that
    /// hangs over the grid edge.
    pub fn bounding_box(&self, tile: &Tile) -> BoundingBox {
        let span_x = (self.extent.east - self.extent.west) / self.tile_count_x(tile.z) as f64;
        let span_y = (self.extent.north - self.extent.south) / self.tile_count_y(tile.z) as f64;
        let m = tile.metatile as f64;
        let west = self.extent.west + tile.x as f64 * m * span_x;
        let north = self.extent.north - tile.y as f64 * m * span_y;
        BoundingBox {
            west,
            south: north - m * span_y,
            east: west + m * span_x,
            north,
        }
    }
}

/// Per-destination key layout: a `{z}`/`{x}`/`{y}` template and whether the
/// destination counts rows from the bottom of the grid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TileLayout {
    pub template: String,
    #[serde(default)]
    pub flip_y: bool,
}

impl Default for TileLayout {
    fn default() -> Self {
        Self {
            template: "{z}/{x}/{y}.png".into(),
            flip_y: false,
        }
    }
}

impl TileLayout {
    pub fn validate(&self) -> Result<(), String> {
        for placeholder in ["{z}", "{x}", "{y}"] {
            if !self.template.contains(placeholder) {
                return Err(format!(
                    "layout template {:?} lacks {placeholder}",
                    self.template
                ));
            }
        }
        Ok(())
    }

    /// Storage key of `tile`; the canonical tile is left untouched.
    pub fn key(&self, grid: &TileGrid, tile: &Tile) -> String {
        let y = if self.flip_y {
            grid.flip_y(tile).unwrap_or(tile.y)
        } else {
            tile.y
        };
        self.template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &y.to_string())
    }
}
