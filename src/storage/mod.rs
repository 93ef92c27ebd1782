//! Tile storage destinations
//!
//! Every destination owns its own key layout, so the same logical tile can
//! land under different keys in different destinations. Deleting a tile that
//! does not exist is never an error.

mod fs;
mod s3;

use crate::{
    config::{ImageFormat, StorageConfig},
    grid::{Tile, TileGrid},
    splitter::RenderedTile,
};

pub use fs::FsStorage;
pub use s3::S3Storage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to write {path}: {error}")]
    Write {
        path: std::path::PathBuf,
        error: std::io::Error,
    },
    #[error("Failed to delete {path}: {error}")]
    Delete {
        path: std::path::PathBuf,
        error: std::io::Error,
    },
    #[error("Failed to put object {bucket}/{key}: {error}")]
    Put {
        bucket: String,
        key: String,
        error: String,
    },
    #[error("Failed to delete object {bucket}/{key}: {error}")]
    DeleteObject {
        bucket: String,
        key: String,
        error: String,
    },
}

pub trait StorageProvider {
    type Error: std::error::Error;

    fn store_tile(
        &self,
        tile: &RenderedTile,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Batch operations attempt every tile and report the first failure
    /// only once all of them have settled.
    fn store_tiles(
        &self,
        tiles: &[RenderedTile],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_tiles(&self, tiles: &[Tile]) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A destination resolved from configuration at startup.
pub enum StorageBackend {
    Fs(FsStorage),
    S3(S3Storage),
}

impl StorageBackend {
    pub async fn from_config(config: &StorageConfig, grid: TileGrid, format: ImageFormat) -> Self {
        match config {
            StorageConfig::Fs { base_path, layout } => {
                Self::Fs(FsStorage::new(base_path.clone(), layout.clone(), grid))
            }
            StorageConfig::S3 {
                bucket,
                prefix,
                endpoint,
                region,
                force_path_style,
                layout,
            } => {
                let client =
                    s3::create_client(endpoint.as_deref(), region.as_deref(), *force_path_style)
                        .await;
                Self::S3(S3Storage::new(
                    client,
                    bucket.clone(),
                    prefix.clone(),
                    layout.clone(),
                    grid,
                    format.content_type(),
                ))
            }
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fs(storage) => write!(f, "fs:{}", storage.base_path().display()),
            Self::S3(storage) => write!(f, "s3:{}", storage.bucket()),
        }
    }
}

impl StorageProvider for StorageBackend {
    type Error = Error;

    async fn store_tile(&self, tile: &RenderedTile) -> Result<(), Error> {
        match self {
            Self::Fs(storage) => storage.store_tile(tile).await,
            Self::S3(storage) => storage.store_tile(tile).await,
        }
    }

    async fn store_tiles(&self, tiles: &[RenderedTile]) -> Result<(), Error> {
        match self {
            Self::Fs(storage) => storage.store_tiles(tiles).await,
            Self::S3(storage) => storage.store_tiles(tiles).await,
        }
    }

    async fn delete_tiles(&self, tiles: &[Tile]) -> Result<(), Error> {
        match self {
            Self::Fs(storage) => storage.delete_tiles(tiles).await,
            Self::S3(storage) => storage.delete_tiles(tiles).await,
        }
    }
}
