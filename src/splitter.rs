//! Metatile splitting
//!
//! Decomposes one fetched map image into its grid of base tiles, discarding
//! cells that fall outside the world grid and routing blank cells aside so
//! that storage can delete them instead of writing empty images.

use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, GenericImageView as _, RgbaImage};
use itertools::Itertools as _;
use tracing::{debug, trace};

use crate::{
    config::{BlankRule, ImageFormat},
    grid::{Tile, TileGrid},
};

/// A base tile with its encoded image.
#[derive(Clone, derive_debug::Dbg)]
pub struct RenderedTile {
    pub tile: Tile,
    #[dbg(skip)]
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct MapSplitResult {
    pub splitted_tiles: Vec<RenderedTile>,
    pub blank_tiles: Vec<Tile>,
    pub out_of_bounds_count: usize,
    pub is_metatile_blank: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("Failed to decode map image: {0}")]
    Decode(image::ImageError),
    #[error("Map image is {width}x{height}, expected {expected}x{expected}")]
    Dimensions {
        width: u32,
        height: u32,
        expected: u32,
    },
    #[error("Metatile of {metatile} tiles at {tile_size}px exceeds the image size limit")]
    Oversized { metatile: u32, tile_size: u32 },
    #[error("Failed to encode tile {tile}: {error}")]
    Encode {
        tile: Tile,
        error: image::ImageError,
    },
    #[error("Split task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub trait MapSplitter {
    type Error: std::error::Error;

    fn split_map(
        &self,
        tile: &Tile,
        image: Bytes,
    ) -> impl Future<Output = Result<MapSplitResult, Self::Error>> + Send;
}

#[derive(Debug, Clone)]
pub struct ImageSplitter {
    pub grid: TileGrid,
    pub tile_size: u32,
    pub format: ImageFormat,
    /// `None` disables blank filtering.
    pub blank_rule: Option<BlankRule>,
}

impl MapSplitter for ImageSplitter {
    type Error = SplitError;

    async fn split_map(&self, tile: &Tile, image: Bytes) -> Result<MapSplitResult, SplitError> {
        let splitter = self.clone();
        let tile = *tile;
        tokio::task::spawn_blocking(move || splitter.split_blocking(&tile, &image)).await?
    }
}

impl ImageSplitter {
    pub fn split_blocking(&self, tile: &Tile, image: &[u8]) -> Result<MapSplitResult, SplitError> {
        let expected = tile
            .metatile
            .checked_mul(self.tile_size)
            .ok_or(SplitError::Oversized {
                metatile: tile.metatile,
                tile_size: self.tile_size,
            })?;
        let image = image::load_from_memory(image).map_err(SplitError::Decode)?;
        let (width, height) = image.dimensions();
        if width != expected || height != expected {
            return Err(SplitError::Dimensions {
                width,
                height,
                expected,
            });
        }

        let mut result = MapSplitResult::default();
        for (row, col) in (0..tile.metatile).cartesian_product(0..tile.metatile) {
            let Some(child) = tile.child(row, col).filter(|child| self.grid.is_in_bounds(child))
            else {
                trace!(%tile, row, col, "skipping out of bounds tile");
                result.out_of_bounds_count += 1;
                continue;
            };
            let cropped = image.crop_imm(
                col * self.tile_size,
                row * self.tile_size,
                self.tile_size,
                self.tile_size,
            );
            if let Some(rule) = self.blank_rule
                && is_blank(&cropped.to_rgba8(), rule)
            {
                result.blank_tiles.push(child);
                continue;
            }
            let data = self.encode(&cropped).map_err(|error| SplitError::Encode {
                tile: child,
                error,
            })?;
            result.splitted_tiles.push(RenderedTile { tile: child, data });
        }
        result.is_metatile_blank =
            result.splitted_tiles.is_empty() && !result.blank_tiles.is_empty();
        debug!(
            %tile,
            rendered = result.splitted_tiles.len(),
            blank = result.blank_tiles.len(),
            out_of_bounds = result.out_of_bounds_count,
            "map split"
        );
        Ok(result)
    }

    fn encode(&self, image: &DynamicImage) -> Result<Bytes, image::ImageError> {
        let mut buffer = Cursor::new(Vec::new());
        match self.format {
            // jpeg has no alpha channel
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
                .write_to(&mut buffer, self.format.encoding())?,
            ImageFormat::Png | ImageFormat::Webp => {
                DynamicImage::ImageRgba8(image.to_rgba8())
                    .write_to(&mut buffer, self.format.encoding())?
            }
        }
        Ok(buffer.into_inner().into())
    }
}

fn is_blank(image: &RgbaImage, rule: BlankRule) -> bool {
    match rule {
        BlankRule::Transparent => image.pixels().all(|pixel| pixel[3] == 0),
        BlankRule::Uniform => {
            let mut pixels = image.pixels();
            match pixels.next() {
                Some(first) => pixels.all(|pixel| pixel == first),
                None => true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    const TILE_SIZE: u32 = 16;

    fn splitter(blank_rule: Option<BlankRule>) -> ImageSplitter {
        ImageSplitter {
            grid: TileGrid::WORLD_CRS84,
            tile_size: TILE_SIZE,
            format: ImageFormat::Png,
            blank_rule,
        }
    }

    fn encode(image: RgbaImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    /// Opaque everywhere except cells listed in `transparent` (row, col).
    fn metatile_image(metatile: u32, transparent: &[(u32, u32)]) -> Vec<u8> {
        let size = metatile * TILE_SIZE;
        encode(RgbaImage::from_fn(size, size, |x, y| {
            let cell = (y / TILE_SIZE, x / TILE_SIZE);
            if transparent.contains(&cell) {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
            }
        }))
    }

    #[test]
    fn whole_world_at_zoom_zero() {
        let tile = Tile::new(0, 0, 0).with_metatile(8);
        let result = splitter(Some(BlankRule::Transparent))
            .split_blocking(&tile, &metatile_image(8, &[]))
            .unwrap();
        let tiles = result
            .splitted_tiles
            .iter()
            .map(|rendered| rendered.tile)
            .collect::<Vec<_>>();
        assert_eq!(tiles, vec![Tile::new(0, 0, 0), Tile::new(0, 1, 0)]);
        assert_eq!(result.out_of_bounds_count, 62);
        assert!(result.blank_tiles.is_empty());
        assert!(!result.is_metatile_blank);
    }

    #[test]
    fn partition_covers_grid() {
        let tile = Tile::new(3, 1, 1).with_metatile(4);
        let result = splitter(Some(BlankRule::Transparent))
            .split_blocking(&tile, &metatile_image(4, &[(0, 0), (2, 3)]))
            .unwrap();
        assert_eq!(result.splitted_tiles.len(), 14);
        assert_eq!(result.blank_tiles, vec![Tile::new(3, 4, 4), Tile::new(3, 7, 6)]);
        assert_eq!(result.out_of_bounds_count, 0);
        assert_eq!(
            result.splitted_tiles.len() + result.blank_tiles.len() + result.out_of_bounds_count,
            16
        );
        for rendered in &result.splitted_tiles {
            let image = image::load_from_memory(&rendered.data).unwrap();
            assert_eq!(image.dimensions(), (TILE_SIZE, TILE_SIZE));
            assert!(!result.blank_tiles.contains(&rendered.tile));
        }
    }

    #[test]
    fn crops_the_right_cell() {
        let tile = Tile::new(4, 0, 0).with_metatile(2);
        let result = splitter(None)
            .split_blocking(&tile, &metatile_image(2, &[]))
            .unwrap();
        let rendered = result
            .splitted_tiles
            .iter()
            .find(|rendered| rendered.tile == Tile::new(4, 1, 1))
            .unwrap();
        let image = image::load_from_memory(&rendered.data).unwrap().to_rgba8();
        assert_eq!(
            image.get_pixel(0, 0),
            &Rgba([TILE_SIZE as u8, TILE_SIZE as u8, 128, 255])
        );
    }

    #[test]
    fn fully_transparent_metatile_is_blank() {
        let tile = Tile::new(2, 0, 0).with_metatile(2);
        let result = splitter(Some(BlankRule::Transparent))
            .split_blocking(&tile, &metatile_image(2, &[(0, 0), (0, 1), (1, 0), (1, 1)]))
            .unwrap();
        assert!(result.splitted_tiles.is_empty());
        assert_eq!(result.blank_tiles.len(), 4);
        assert!(result.is_metatile_blank);
    }

    #[test]
    fn blank_filtering_disabled() {
        let tile = Tile::new(2, 0, 0).with_metatile(2);
        let result = splitter(None)
            .split_blocking(&tile, &metatile_image(2, &[(0, 0), (0, 1), (1, 0), (1, 1)]))
            .unwrap();
        assert_eq!(result.splitted_tiles.len(), 4);
        assert!(result.blank_tiles.is_empty());
        assert!(!result.is_metatile_blank);
    }

    #[test]
    fn uniform_rule() {
        let size = 2 * TILE_SIZE;
        let image = encode(RgbaImage::from_fn(size, size, |x, _| {
            if x < TILE_SIZE {
                Rgba([10, 60, 200, 255])
            } else {
                Rgba([x as u8, 0, 0, 255])
            }
        }));
        let tile = Tile::new(2, 0, 0).with_metatile(2);
        let result = splitter(Some(BlankRule::Uniform))
            .split_blocking(&tile, &image)
            .unwrap();
        assert_eq!(result.blank_tiles, vec![Tile::new(2, 0, 0), Tile::new(2, 0, 1)]);
        assert_eq!(result.splitted_tiles.len(), 2);
    }

    #[test]
    fn rejects_wrong_dimensions() {
        let tile = Tile::new(2, 0, 0).with_metatile(2);
        let result = splitter(None).split_blocking(&tile, &metatile_image(1, &[]));
        assert!(matches!(
            result,
            Err(SplitError::Dimensions { expected: 32, .. })
        ));
    }

    #[test]
    fn oversized_metatile_is_rejected_before_decoding() {
        let tile = Tile::new(2, 0, 0).with_metatile(1 << 25);
        let result = splitter(None).split_blocking(&tile, &metatile_image(1, &[]));
        assert!(matches!(
            result,
            Err(SplitError::Oversized {
                metatile: 33554432,
                tile_size: TILE_SIZE
            })
        ));
    }

    #[test]
    fn rejects_garbage() {
        let tile = Tile::new(2, 0, 0);
        let result = splitter(None).split_blocking(&tile, b"<ServiceException/>");
        assert!(matches!(result, Err(SplitError::Decode(_))));
    }

    #[tokio::test]
    async fn split_off_the_runtime() {
        let tile = Tile::new(1, 0, 0).with_metatile(2);
        let result = splitter(Some(BlankRule::Transparent))
            .split_map(&tile, metatile_image(2, &[]).into())
            .await
            .unwrap();
        assert_eq!(result.splitted_tiles.len(), 4);
    }
}
