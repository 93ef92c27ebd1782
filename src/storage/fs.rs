use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use futures::future::join_all;
use tracing::{debug, trace};

use crate::{
    grid::{Tile, TileGrid, TileLayout},
    splitter::RenderedTile,
};

use super::{Error, StorageProvider};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sibling of `path` that readers never look up.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

pub struct FsStorage {
    base_path: PathBuf,
    layout: TileLayout,
    grid: TileGrid,
}

impl FsStorage {
    pub fn new(base_path: PathBuf, layout: TileLayout, grid: TileGrid) -> Self {
        Self {
            base_path,
            layout,
            grid,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn path(&self, tile: &Tile) -> PathBuf {
        self.base_path.join(self.layout.key(&self.grid, tile))
    }
}

impl StorageProvider for FsStorage {
    type Error = Error;

    async fn store_tile(&self, tile: &RenderedTile) -> Result<(), Error> {
        let path = self.path(&tile.tile);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| Error::Write {
                    path: parent.to_owned(),
                    error,
                })?;
        }
        // readers see either the previous tile or the complete new one
        let temp = temp_path(&path);
        tokio::fs::write(&temp, &tile.data)
            .await
            .map_err(|error| Error::Write {
                path: temp.clone(),
                error,
            })?;
        if let Err(error) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::Write { path, error });
        }
        trace!(path = %path.display(), "tile written");
        Ok(())
    }

    async fn store_tiles(&self, tiles: &[RenderedTile]) -> Result<(), Error> {
        join_all(tiles.iter().map(|tile| self.store_tile(tile)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        debug!(base = %self.base_path.display(), count = tiles.len(), "tiles written");
        Ok(())
    }

    async fn delete_tiles(&self, tiles: &[Tile]) -> Result<(), Error> {
        let tasks = tiles.iter().map(|tile| async move {
            let path = self.path(tile);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(Error::Delete { path, error }),
            }
        });
        join_all(tasks)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        debug!(base = %self.base_path.display(), count = tiles.len(), "tiles deleted");
        Ok(())
    }
}
