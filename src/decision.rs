//! Staleness and cooldown decisions
//!
//! Before any expensive work happens the engine decides whether a job's tile
//! should be rendered, skipped because its stored output is already current,
//! or deferred because a cooldown window covers it. Lookups are best effort:
//! a failing tracking store or remote source never blocks rendering.

use futures::TryStreamExt as _;
use tracing::{debug, error, warn};

use crate::{
    config::DecisionConfig,
    grid::{Tile, TileGrid},
    queue::TileJob,
    remote::RemoteTruth,
    tracking::{CooldownQuery, TileKey, TileStatus, TileUpdate, TrackingStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Render,
    Skip,
    Cool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    /// Unix seconds at which the decision was taken.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub kit: String,
    pub force_process: bool,
    pub proceed_on_failure: bool,
    /// Minimum window duration, in seconds, that defers a render. `None`
    /// disables cooldown queries.
    pub cooldown_min_duration: Option<u64>,
}

impl DecisionPolicy {
    pub fn from_config(config: &DecisionConfig) -> Self {
        Self {
            kit: config
                .tracking
                .as_ref()
                .map(|tracking| tracking.kit.clone())
                .unwrap_or_default(),
            force_process: config.force_process,
            proceed_on_failure: config.proceed_on_failure,
            cooldown_min_duration: config
                .cooldown
                .enabled
                .then_some(config.cooldown.min_duration),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to record {status} outcome of {key}: {error}")]
pub struct RecordError<E> {
    pub key: TileKey,
    pub status: TileStatus,
    pub error: E,
}

pub struct DecisionEngine<T, R> {
    tracking: Option<T>,
    remote: Option<R>,
    policy: DecisionPolicy,
    grid: TileGrid,
}

impl<T: TrackingStore, R: RemoteTruth> DecisionEngine<T, R> {
    pub fn new(
        policy: DecisionPolicy,
        grid: TileGrid,
        tracking: Option<T>,
        remote: Option<R>,
    ) -> Self {
        Self {
            tracking,
            remote,
            policy,
            grid,
        }
    }

    /// An engine without tracking store; every job renders.
    pub fn disabled(grid: TileGrid) -> Self {
        Self::new(
            DecisionPolicy {
                kit: String::new(),
                force_process: false,
                proceed_on_failure: true,
                cooldown_min_duration: None,
            },
            grid,
            None,
            None,
        )
    }

    pub fn tracking(&self) -> Option<&T> {
        self.tracking.as_ref()
    }

    fn key(&self, tile: &Tile) -> TileKey {
        TileKey::new(self.policy.kit.clone(), tile)
    }

    pub async fn decide(&self, job: &TileJob) -> Verdict {
        let timestamp = chrono::Utc::now().timestamp();
        let decision = self.evaluate(job).await;
        debug!(tile = %job.tile, ?decision, "decision taken");
        Verdict {
            decision,
            timestamp,
        }
    }

    async fn evaluate(&self, job: &TileJob) -> Decision {
        let Some(tracking) = &self.tracking else {
            return Decision::Render;
        };
        if job.is_forced() || self.policy.force_process {
            return Decision::Render;
        }
        let key = self.key(&job.tile);
        if self.is_fresh(tracking, &key).await {
            return Decision::Skip;
        }
        if self.is_cooling(tracking, &job.tile).await {
            return Decision::Cool;
        }
        Decision::Render
    }

    async fn is_fresh(&self, tracking: &T, key: &TileKey) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        let detail = match tracking.get_tile_detail(key).await {
            Ok(Some(detail)) => detail,
            Ok(None) => return false,
            Err(error) => {
                warn!(%key, %error, "tile detail lookup failed, ignoring freshness");
                return false;
            }
        };
        match remote.last_update().await {
            Ok(last_update) => {
                debug!(%key, fresh_since = detail.fresh_since(), last_update, "freshness check");
                detail.fresh_since() >= last_update
            }
            Err(error) => {
                warn!(%key, %error, "remote truth fetch failed, ignoring freshness");
                false
            }
        }
    }

    async fn is_cooling(&self, tracking: &T, tile: &Tile) -> bool {
        let Some(min_duration) = self.policy.cooldown_min_duration else {
            return false;
        };
        let query = CooldownQuery {
            area: Some(self.grid.bounding_box(tile)),
            kits: vec![self.policy.kit.clone()],
            min_zoom: tile.z,
            max_zoom: tile.z,
            enabled: true,
        };
        let mut cooldowns = tracking.query_cooldowns(&query);
        loop {
            match cooldowns.try_next().await {
                Ok(Some(batch)) => {
                    if let Some(window) = batch.iter().find(|window| window.duration > min_duration)
                    {
                        debug!(%tile, duration = window.duration, "cooldown active");
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(error) => {
                    warn!(%tile, %error, "cooldown query failed, rendering");
                    return false;
                }
            }
        }
    }

    /// Records the outcome of a decision. Failures are only returned when the
    /// policy does not allow proceeding without a record.
    pub async fn record(
        &self,
        tile: &Tile,
        status: TileStatus,
        state: Option<i64>,
        timestamp: i64,
    ) -> Result<(), RecordError<T::Error>> {
        let Some(tracking) = &self.tracking else {
            return Ok(());
        };
        let key = self.key(tile);
        let update = TileUpdate {
            status,
            state,
            timestamp,
        };
        match tracking.set_tile_detail(&key, &update).await {
            Ok(()) => Ok(()),
            Err(error) if self.policy.proceed_on_failure => {
                warn!(%key, %status, %error, "failed to record outcome, proceeding");
                Ok(())
            }
            Err(error) => {
                error!(%key, %status, %error, "failed to record outcome");
                Err(RecordError { key, status, error })
            }
        }
    }
}
