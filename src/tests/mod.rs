//! In-memory collaborators shared by the unit and scenario tests.


use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use futures::{StreamExt as _, stream::BoxStream};
use image::{Rgba, RgbaImage};

use crate::{
    grid::{BoundingBox, Tile},
    provider::MapProvider,
    remote::RemoteTruth,
    splitter::RenderedTile,
    storage::StorageProvider,
    tracking::{
        CooldownQuery, CooldownWindow, TileDetail, TileKey, TileStatus, TileUpdate, TrackingStore,
    },
};

#[derive(Debug, thiserror::Error)]
#[error("{0} failed")]
pub struct MockError(pub &'static str);

/// Tracking record rendered at `rendered_at` and untouched since.
pub fn detail(kit: &str, tile: &Tile, rendered_at: i64) -> TileDetail {
    TileDetail {
        kit: kit.into(),
        z: tile.z,
        x: tile.x,
        y: tile.y,
        state: None,
        status: TileStatus::Rendered,
        created_at: rendered_at,
        updated_at: rendered_at,
        rendered_at: Some(rendered_at),
        update_count: 1,
        skip_count: 0,
        cool_count: 0,
        location: "test".into(),
    }
}

#[derive(Default)]
pub struct MockTracking {
    pub details: Mutex<HashMap<TileKey, TileDetail>>,
    pub cooldowns: Vec<Vec<CooldownWindow>>,
    pub records: Mutex<Vec<(TileKey, TileUpdate)>>,
    pub queries: Mutex<Vec<CooldownQuery>>,
    pub fail_lookup: bool,
    pub fail_cooldowns: bool,
    pub fail_record: bool,
    pub lookups: AtomicUsize,
    pub cooldown_queries: AtomicUsize,
    pub batches_pulled: AtomicUsize,
}

impl MockTracking {
    pub fn with_detail(self, detail: TileDetail) -> Self {
        let key = TileKey {
            kit: detail.kit.clone(),
            z: detail.z,
            x: detail.x,
            y: detail.y,
        };
        self.details.lock().unwrap().insert(key, detail);
        self
    }

    pub fn with_cooldowns(self, cooldowns: Vec<Vec<CooldownWindow>>) -> Self {
        Self { cooldowns, ..self }
    }

    pub fn last_query(&self) -> Option<CooldownQuery> {
        self.queries.lock().unwrap().last().cloned()
    }

    pub fn statuses(&self) -> Vec<TileStatus> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, update)| update.status)
            .collect()
    }
}

impl TrackingStore for MockTracking {
    type Error = MockError;

    async fn get_tile_detail(&self, key: &TileKey) -> Result<Option<TileDetail>, MockError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup {
            return Err(MockError("tile detail lookup"));
        }
        Ok(self.details.lock().unwrap().get(key).cloned())
    }

    async fn set_tile_detail(&self, key: &TileKey, update: &TileUpdate) -> Result<(), MockError> {
        if self.fail_record {
            return Err(MockError("tile detail update"));
        }
        self.records.lock().unwrap().push((key.clone(), *update));
        Ok(())
    }

    fn query_cooldowns<'a>(
        &'a self,
        query: &'a CooldownQuery,
    ) -> BoxStream<'a, Result<Vec<CooldownWindow>, MockError>> {
        self.cooldown_queries.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if self.fail_cooldowns {
            return futures::stream::once(async { Err(MockError("cooldown query")) }).boxed();
        }
        futures::stream::iter(self.cooldowns.iter().cloned())
            .map(|batch| {
                self.batches_pulled.fetch_add(1, Ordering::SeqCst);
                Ok(batch)
            })
            .boxed()
    }
}

pub struct MockRemote {
    pub timestamp: Option<i64>,
    pub calls: AtomicUsize,
}

impl MockRemote {
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            timestamp: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl RemoteTruth for MockRemote {
    type Error = MockError;

    async fn last_update(&self) -> Result<i64, MockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.timestamp.ok_or(MockError("remote truth fetch"))
    }
}

pub struct MockMap {
    pub image: Bytes,
    pub requests: Mutex<Vec<(BoundingBox, u32, u32)>>,
}

impl MockMap {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image: image.into(),
            requests: Mutex::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl MapProvider for MockMap {
    type Error = MockError;

    async fn get_map(&self, bbox: &BoundingBox, width: u32, height: u32) -> Result<Bytes, MockError> {
        self.requests.lock().unwrap().push((*bbox, width, height));
        Ok(self.image.clone())
    }
}

pub struct MockStorage {
    pub name: &'static str,
    pub fail_store: bool,
    pub fail_delete: bool,
    pub stored: Mutex<Vec<Tile>>,
    pub deleted: Mutex<Vec<Tile>>,
    pub store_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MockStorage {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fail_store: false,
            fail_delete: false,
            stored: Mutex::default(),
            deleted: Mutex::default(),
            store_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            fail_store: true,
            ..Self::new(name)
        }
    }
}

impl std::fmt::Display for MockStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl StorageProvider for MockStorage {
    type Error = MockError;

    async fn store_tile(&self, tile: &RenderedTile) -> Result<(), MockError> {
        self.store_tiles(std::slice::from_ref(tile)).await
    }

    async fn store_tiles(&self, tiles: &[RenderedTile]) -> Result<(), MockError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        // let sibling destinations start before this one settles
        tokio::task::yield_now().await;
        if self.fail_store {
            return Err(MockError(self.name));
        }
        self.stored
            .lock()
            .unwrap()
            .extend(tiles.iter().map(|rendered| rendered.tile));
        Ok(())
    }

    async fn delete_tiles(&self, tiles: &[Tile]) -> Result<(), MockError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail_delete {
            return Err(MockError(self.name));
        }
        self.deleted.lock().unwrap().extend_from_slice(tiles);
        Ok(())
    }
}

/// PNG of `metatile × metatile` cells of `tile_size` pixels. Cells listed in
/// `transparent` as `(row, col)` are fully transparent, the others opaque.
pub fn metatile_png(metatile: u32, tile_size: u32, transparent: &[(u32, u32)]) -> Vec<u8> {
    let size = metatile * tile_size;
    let image = RgbaImage::from_fn(size, size, |x, y| {
        if transparent.contains(&(y / tile_size, x / tile_size)) {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([(x % 256) as u8, (y % 256) as u8, 200, 255])
        }
    });
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}
