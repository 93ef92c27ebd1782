use std::str::FromStr as _;

use futures::{StreamExt as _, stream::BoxStream};
use sqlx::FromRow;
use tracing::{debug, error};

use crate::grid::BoundingBox;

use super::{
    CooldownQuery, CooldownWindow, TileDetail, TileKey, TileStatus, TileUpdate, TrackingStore,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("failed to encode kits: {0}")]
    Encode(serde_json::Error),
    #[error("corrupted tile detail {key}: {detail}")]
    Corrupted { key: String, detail: String },
}

pub struct SqliteTracking {
    pool: sqlx::SqlitePool,
    location: String,
    page_size: u32,
}

/// Cooldown definition, as inserted by operators.
#[derive(Debug, Clone)]
pub struct NewCooldown {
    pub kits: Vec<String>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub duration: u64,
    pub enabled: bool,
    pub area: Option<BoundingBox>,
    pub expires_at: Option<i64>,
}

#[derive(FromRow)]
struct DetailRow {
    kit: String,
    z: i64,
    x: i64,
    y: i64,
    state: Option<i64>,
    status: String,
    created_at: i64,
    updated_at: i64,
    rendered_at: Option<i64>,
    update_count: i64,
    skip_count: i64,
    cool_count: i64,
    location: String,
}

impl TryFrom<DetailRow> for TileDetail {
    type Error = Error;

    fn try_from(row: DetailRow) -> Result<Self, Error> {
        let corrupted = |detail: String| Error::Corrupted {
            key: format!("{}:{}/{}/{}", row.kit, row.z, row.x, row.y),
            detail,
        };
        let status = TileStatus::from_str(&row.status).map_err(corrupted)?;
        let z = u8::try_from(row.z).map_err(|error| corrupted(error.to_string()))?;
        let x = u32::try_from(row.x).map_err(|error| corrupted(error.to_string()))?;
        let y = u32::try_from(row.y).map_err(|error| corrupted(error.to_string()))?;
        Ok(TileDetail {
            kit: row.kit,
            z,
            x,
            y,
            state: row.state,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            rendered_at: row.rendered_at,
            update_count: row.update_count,
            skip_count: row.skip_count,
            cool_count: row.cool_count,
            location: row.location,
        })
    }
}

impl SqliteTracking {
    pub async fn open(
        url: &str,
        location: impl Into<String>,
        page_size: u32,
    ) -> Result<Self, Error> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(url)
            .inspect_err(|error| error!(%error, %url, "Failed to open tracking db"))?
            .create_if_missing(true);
        let pool = sqlx::pool::PoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .inspect_err(|error| error!(%error, %url, "Failed to open tracking db"))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tile_details(
                kit TEXT NOT NULL,
                z INTEGER NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                state INTEGER,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                rendered_at INTEGER,
                update_count INTEGER NOT NULL DEFAULT 0,
                skip_count INTEGER NOT NULL DEFAULT 0,
                cool_count INTEGER NOT NULL DEFAULT 0,
                location TEXT NOT NULL,
                PRIMARY KEY(kit, z, x, y)
            );

            CREATE TABLE IF NOT EXISTS cooldowns(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kits TEXT NOT NULL,
                min_zoom INTEGER NOT NULL,
                max_zoom INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                west REAL,
                south REAL,
                east REAL,
                north REAL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            );
        "#,
        )
        .execute(&pool)
        .await
        .inspect_err(|error| error!(%error, %url, "Failed to execute DDL to tracking db"))?;
        Ok(Self {
            pool,
            location: location.into(),
            page_size: page_size.max(1),
        })
    }

    pub async fn add_cooldown(&self, cooldown: &NewCooldown) -> Result<i64, Error> {
        let kits = serde_json::to_string(&cooldown.kits).map_err(Error::Encode)?;
        let area = cooldown.area;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO cooldowns(
                kits, min_zoom, max_zoom, duration, enabled,
                west, south, east, north, created_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(kits)
        .bind(cooldown.min_zoom as i64)
        .bind(cooldown.max_zoom as i64)
        .bind(cooldown.duration as i64)
        .bind(cooldown.enabled)
        .bind(area.map(|area| area.west))
        .bind(area.map(|area| area.south))
        .bind(area.map(|area| area.east))
        .bind(area.map(|area| area.north))
        .bind(chrono::Utc::now().timestamp())
        .bind(cooldown.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn cooldown_page(
        &self,
        query: &CooldownQuery,
        kits: &str,
        offset: i64,
    ) -> Result<Vec<CooldownWindow>, Error> {
        let area = query.area.unwrap_or(BoundingBox {
            west: f64::MIN,
            south: f64::MIN,
            east: f64::MAX,
            north: f64::MAX,
        });
        let rows = sqlx::query_as::<_, (i64,)>(
            r#"
            SELECT duration FROM cooldowns
            WHERE
                enabled = ?
                AND min_zoom <= ? AND max_zoom >= ?
                AND (expires_at IS NULL OR expires_at > ?)
                AND EXISTS (
                    SELECT 1 FROM json_each(cooldowns.kits)
                    WHERE value IN (SELECT value FROM json_each(?))
                )
                AND (
                    west IS NULL
                    OR (west < ? AND ? < east AND south < ? AND ? < north)
                )
            ORDER BY id
            LIMIT ? OFFSET ?
        "#,
        )
        .bind(query.enabled)
        .bind(query.max_zoom as i64)
        .bind(query.min_zoom as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(kits)
        .bind(area.east)
        .bind(area.west)
        .bind(area.north)
        .bind(area.south)
        .bind(self.page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(duration,)| CooldownWindow {
                duration: duration.max(0) as u64,
            })
            .collect())
    }
}

impl TrackingStore for SqliteTracking {
    type Error = Error;

    async fn get_tile_detail(&self, key: &TileKey) -> Result<Option<TileDetail>, Error> {
        let row = sqlx::query_as::<_, DetailRow>(
            "SELECT * FROM tile_details WHERE kit = ? AND z = ? AND x = ? AND y = ?",
        )
        .bind(&key.kit)
        .bind(key.z as i64)
        .bind(key.x as i64)
        .bind(key.y as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TileDetail::try_from).transpose()
    }

    async fn set_tile_detail(&self, key: &TileKey, update: &TileUpdate) -> Result<(), Error> {
        match update.status {
            TileStatus::Rendered => {
                sqlx::query(
                    r#"
                    INSERT INTO tile_details(
                        kit, z, x, y, state, status,
                        created_at, updated_at, rendered_at, update_count, location
                    )
                    VALUES (?, ?, ?, ?, ?, 'rendered', ?, ?, ?, 1, ?)
                    ON CONFLICT(kit, z, x, y)
                    DO UPDATE SET
                        state = COALESCE(EXCLUDED.state, tile_details.state),
                        status = EXCLUDED.status,
                        updated_at = EXCLUDED.updated_at,
                        rendered_at = EXCLUDED.rendered_at,
                        update_count = tile_details.update_count + 1,
                        location = EXCLUDED.location
                "#,
                )
                .bind(&key.kit)
                .bind(key.z as i64)
                .bind(key.x as i64)
                .bind(key.y as i64)
                .bind(update.state)
                .bind(update.timestamp)
                .bind(update.timestamp)
                .bind(update.timestamp)
                .bind(&self.location)
                .execute(&self.pool)
                .await?;
            }
            status @ (TileStatus::Skipped | TileStatus::Cooled) => {
                let skipped = (status == TileStatus::Skipped) as i64;
                sqlx::query(
                    r#"
                    UPDATE tile_details
                    SET
                        state = COALESCE(?, state),
                        status = ?,
                        updated_at = ?,
                        skip_count = skip_count + ?,
                        cool_count = cool_count + ?,
                        location = ?
                    WHERE kit = ? AND z = ? AND x = ? AND y = ?
                "#,
                )
                .bind(update.state)
                .bind(status.as_str())
                .bind(update.timestamp)
                .bind(skipped)
                .bind(1 - skipped)
                .bind(&self.location)
                .bind(&key.kit)
                .bind(key.z as i64)
                .bind(key.x as i64)
                .bind(key.y as i64)
                .execute(&self.pool)
                .await?;
            }
        }
        debug!(%key, status = update.status.as_str(), "tile detail recorded");
        Ok(())
    }

    fn query_cooldowns<'a>(
        &'a self,
        query: &'a CooldownQuery,
    ) -> BoxStream<'a, Result<Vec<CooldownWindow>, Error>> {
        let kits = match serde_json::to_string(&query.kits) {
            Ok(kits) => kits,
            Err(error) => {
                return futures::stream::once(async move { Err(Error::Encode(error)) }).boxed();
            }
        };
        let page_size = self.page_size as usize;
        futures::stream::try_unfold(Some(0i64), move |offset| {
            let kits = kits.clone();
            async move {
                let Some(offset) = offset else {
                    return Ok(None);
                };
                let page = self.cooldown_page(query, &kits, offset).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = (page.len() == page_size).then(|| offset + page.len() as i64);
                Ok::<_, Error>(Some((page, next)))
            }
        })
        .boxed()
    }
}
