//! Tile processor
//!
//! Runs a single job end to end: validate the tile, decide, fetch the map,
//! split it and fan the result out to every storage destination.

use std::fmt::Display;

use futures::{future::join_all, join};
use tracing::{debug, error, info};

use crate::{
    decision::{Decision, DecisionEngine, RecordError},
    grid::{Tile, TileGrid},
    provider::MapProvider,
    queue::TileJob,
    remote::RemoteTruth,
    splitter::{MapSplitResult, MapSplitter},
    storage::StorageProvider,
    tracking::{TileStatus, TrackingStore},
};

pub struct TileProcessor<M, X, S, T, R> {
    pub map: M,
    pub splitter: X,
    pub storages: Vec<S>,
    pub decision: DecisionEngine<T, R>,
    pub grid: TileGrid,
    pub tile_size: u32,
    /// Largest accepted metatile side, in tiles.
    pub max_metatile: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Rendered {
        stored: usize,
        blank: usize,
        out_of_bounds: usize,
    },
    Skipped,
    Cooled,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError<ME, XE, SE, TE> {
    #[error("tile {0} is outside the grid")]
    InvalidTile(Tile),
    #[error("metatile of {tile} exceeds the limit of {max} tiles per side")]
    Oversized { tile: Tile, max: u32 },
    #[error("map: {0}")]
    Map(ME),
    #[error("split: {0}")]
    Split(XE),
    #[error("storage: {error} ({failed} of {total} operations failed)")]
    Storage {
        error: SE,
        failed: usize,
        total: usize,
    },
    #[error("record: {0}")]
    Record(RecordError<TE>),
}

type Failure<M, X, S, T> = ProcessError<
    <M as MapProvider>::Error,
    <X as MapSplitter>::Error,
    <S as StorageProvider>::Error,
    <T as TrackingStore>::Error,
>;

impl<M, X, S, T, R> TileProcessor<M, X, S, T, R>
where
    M: MapProvider,
    X: MapSplitter,
    S: StorageProvider + Display,
    T: TrackingStore,
    R: RemoteTruth,
{
    pub async fn process_tile(
        &self,
        job: TileJob,
    ) -> Result<ProcessOutcome, Failure<M, X, S, T>> {
        let tile = job.tile;
        if !self.grid.is_in_bounds(&tile) {
            return Err(ProcessError::InvalidTile(tile));
        }
        let size = tile
            .metatile
            .checked_mul(self.tile_size)
            .filter(|_| tile.metatile <= self.max_metatile)
            .ok_or(ProcessError::Oversized {
                tile,
                max: self.max_metatile,
            })?;
        let verdict = self.decision.decide(&job).await;
        match verdict.decision {
            Decision::Skip => {
                self.decision
                    .record(&tile, TileStatus::Skipped, job.state, verdict.timestamp)
                    .await
                    .map_err(ProcessError::Record)?;
                info!(%tile, "tile is up to date, skipped");
                return Ok(ProcessOutcome::Skipped);
            }
            Decision::Cool => {
                self.decision
                    .record(&tile, TileStatus::Cooled, job.state, verdict.timestamp)
                    .await
                    .map_err(ProcessError::Record)?;
                info!(%tile, "tile is cooling down, deferred");
                return Ok(ProcessOutcome::Cooled);
            }
            Decision::Render => {}
        }

        let bbox = self.grid.bounding_box(&tile);
        let image = self
            .map
            .get_map(&bbox, size, size)
            .await
            .inspect_err(|error| error!(%tile, %bbox, %error, "failed to fetch map"))
            .map_err(ProcessError::Map)?;
        let split = self
            .splitter
            .split_map(&tile, image)
            .await
            .inspect_err(|error| error!(%tile, %error, "failed to split map"))
            .map_err(ProcessError::Split)?;
        if split.is_metatile_blank {
            debug!(%tile, "metatile is blank");
        }
        self.fan_out(&split).await?;

        self.decision
            .record(&tile, TileStatus::Rendered, job.state, verdict.timestamp)
            .await
            .map_err(ProcessError::Record)?;
        info!(%tile, stored = split.splitted_tiles.len(), "tile rendered");
        Ok(ProcessOutcome::Rendered {
            stored: split.splitted_tiles.len(),
            blank: split.blank_tiles.len(),
            out_of_bounds: split.out_of_bounds_count,
        })
    }

    /// Writes and deletes on every destination concurrently. Every operation
    /// settles before the first failure is reported.
    async fn fan_out(&self, split: &MapSplitResult) -> Result<(), Failure<M, X, S, T>> {
        let rendered = &split.splitted_tiles;
        let blank = &split.blank_tiles;
        let stores = self
            .storages
            .iter()
            .filter(|_| !rendered.is_empty())
            .map(|storage| async move {
                storage.store_tiles(rendered).await.inspect_err(|error| {
                    error!(%storage, %error, count = rendered.len(), "failed to store tiles")
                })
            });
        let deletes = self
            .storages
            .iter()
            .filter(|_| !blank.is_empty())
            .map(|storage| async move {
                storage.delete_tiles(blank).await.inspect_err(|error| {
                    error!(%storage, %error, count = blank.len(), "failed to delete blank tiles")
                })
            });
        let (stored, deleted) = join!(join_all(stores), join_all(deletes));
        let total = stored.len() + deleted.len();
        let mut failures = stored.into_iter().chain(deleted).filter_map(Result::err);
        match failures.next() {
            None => Ok(()),
            Some(error) => Err(ProcessError::Storage {
                error,
                failed: 1 + failures.count(),
                total,
            }),
        }
    }
}
