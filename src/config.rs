use std::path::PathBuf;

use serde::Deserialize;

use crate::grid::{TileGrid, TileLayout};

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub queue: QueueConfig,
    #[serde(default)]
    pub grid: TileGrid,
    #[serde(default)]
    pub tiles: TilesConfig,
    pub map: MapProviderConfig,
    pub storage: Vec<StorageConfig>,
    #[serde(default)]
    pub decision: DecisionConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct QueueConfig {
    pub url: String,
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Seconds a failed job waits before it becomes visible again.
    #[serde(default)]
    pub retry_delay_secs: u64,
    /// Seconds after which an unacknowledged lease is handed out again.
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,
}

fn default_concurrency() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_limit() -> u32 {
    3
}

fn default_expire_secs() -> u64 {
    3600
}

#[derive(Deserialize, Hash, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    pub fn encoding(self) -> image::ImageFormat {
        match self {
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Webp => image::ImageFormat::WebP,
        }
    }
}

/// Rule deciding whether a cropped sub-tile carries no content.
#[derive(Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlankRule {
    /// Every pixel is fully transparent.
    #[default]
    Transparent,
    /// Every pixel has the same value.
    Uniform,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TilesConfig {
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default = "default_true")]
    pub filter_blank: bool,
    #[serde(default)]
    pub blank_rule: BlankRule,
    /// Largest metatile side a job may request, in tiles.
    #[serde(default = "default_max_metatile")]
    pub max_metatile: u32,
}

fn default_tile_size() -> u32 {
    256
}

fn default_max_metatile() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            format: ImageFormat::default(),
            filter_blank: true,
            blank_rule: BlankRule::default(),
            max_metatile: default_max_metatile(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MapProviderConfig {
    Wms {
        url: url::Url,
        layers: String,
        #[serde(default)]
        styles: String,
        #[serde(default = "default_wms_format")]
        format: String,
        #[serde(default = "default_crs")]
        crs: String,
    },
    Arcgis {
        url: url::Url,
        #[serde(default = "default_arcgis_format")]
        format: String,
    },
}

fn default_wms_format() -> String {
    "image/png".into()
}

fn default_arcgis_format() -> String {
    "png32".into()
}

fn default_crs() -> String {
    "EPSG:4326".into()
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StorageConfig {
    S3 {
        bucket: String,
        prefix: Option<String>,
        endpoint: Option<String>,
        region: Option<String>,
        #[serde(default)]
        force_path_style: bool,
        #[serde(default)]
        layout: TileLayout,
    },
    Fs {
        base_path: PathBuf,
        #[serde(default)]
        layout: TileLayout,
    },
}

impl StorageConfig {
    pub fn layout(&self) -> &TileLayout {
        match self {
            Self::S3 { layout, .. } | Self::Fs { layout, .. } => layout,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct TrackingConfig {
    pub url: String,
    pub kit: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RemoteTruthConfig {
    pub url: url::Url,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CooldownConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Windows not longer than this many seconds never defer a render.
    #[serde(default)]
    pub min_duration: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    100
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_duration: 0,
            page_size: default_page_size(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DecisionConfig {
    #[serde(default)]
    pub force_process: bool,
    #[serde(default = "default_true")]
    pub proceed_on_failure: bool,
    pub tracking: Option<TrackingConfig>,
    pub remote_truth: Option<RemoteTruthConfig>,
    #[serde(default)]
    pub cooldown: CooldownConfig,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            force_process: false,
            proceed_on_failure: true,
            tracking: None,
            remote_truth: None,
            cooldown: CooldownConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.queue.concurrency == 0 {
            return Err("queue.concurrency must be at least 1".into());
        }
        if self.tiles.tile_size == 0 {
            return Err("tiles.tile_size must be at least 1".into());
        }
        if self.tiles.max_metatile == 0 {
            return Err("tiles.max_metatile must be at least 1".into());
        }
        if self
            .tiles
            .max_metatile
            .checked_mul(self.tiles.tile_size)
            .is_none()
        {
            return Err("tiles.max_metatile times tiles.tile_size overflows".into());
        }
        if self.queue.expire_secs == 0 {
            return Err("queue.expire_secs must be at least 1".into());
        }
        if self.grid.root_width == 0 || self.grid.root_height == 0 {
            return Err("grid root dimensions must be at least 1".into());
        }
        if self.storage.is_empty() {
            return Err("at least one storage destination is required".into());
        }
        for storage in &self.storage {
            storage.layout().validate()?;
        }
        Ok(())
    }
}
