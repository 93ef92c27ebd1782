use aws_config::BehaviorVersion;
use aws_sdk_s3::error::ProvideErrorMetadata as _;
use futures::future::join_all;
use tracing::{debug, trace};

use crate::{
    grid::{Tile, TileGrid, TileLayout},
    splitter::RenderedTile,
};

use super::{Error, StorageProvider};

pub(super) async fn create_client(
    endpoint: Option<&str>,
    region: Option<&str>,
    force_path_style: bool,
) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(endpoint) = endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region.to_owned()));
    }
    let config = loader.load().await;
    let config = aws_sdk_s3::config::Builder::from(&config)
        .force_path_style(force_path_style)
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
    layout: TileLayout,
    grid: TileGrid,
    content_type: &'static str,
}

impl S3Storage {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: String,
        prefix: Option<String>,
        layout: TileLayout,
        grid: TileGrid,
        content_type: &'static str,
    ) -> Self {
        Self {
            client,
            bucket,
            prefix,
            layout,
            grid,
            content_type,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self, tile: &Tile) -> String {
        let key = self.layout.key(&self.grid, tile);
        match &self.prefix {
            Some(prefix) => format!("{}/{key}", prefix.trim_end_matches('/')),
            None => key,
        }
    }

    async fn delete_tile(&self, tile: &Tile) -> Result<(), Error> {
        let key = self.key(tile);
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error)
                if error
                    .as_service_error()
                    .and_then(|error| error.code())
                    .is_some_and(|code| code == "NoSuchKey" || code == "NotFound") =>
            {
                trace!(bucket = self.bucket, key, "object already absent");
                Ok(())
            }
            Err(error) => Err(Error::DeleteObject {
                bucket: self.bucket.clone(),
                key,
                error: error.to_string(),
            }),
        }
    }
}

impl StorageProvider for S3Storage {
    type Error = Error;

    async fn store_tile(&self, tile: &RenderedTile) -> Result<(), Error> {
        let key = self.key(&tile.tile);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(self.content_type)
            .body(tile.data.clone().into())
            .send()
            .await
            .map_err(|error| Error::Put {
                bucket: self.bucket.clone(),
                key: key.clone(),
                error: error.to_string(),
            })?;
        trace!(bucket = self.bucket, key, "tile uploaded");
        Ok(())
    }

    async fn store_tiles(&self, tiles: &[RenderedTile]) -> Result<(), Error> {
        join_all(tiles.iter().map(|tile| self.store_tile(tile)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        debug!(bucket = self.bucket, count = tiles.len(), "tiles uploaded");
        Ok(())
    }

    async fn delete_tiles(&self, tiles: &[Tile]) -> Result<(), Error> {
        join_all(tiles.iter().map(|tile| self.delete_tile(tile)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        debug!(bucket = self.bucket, count = tiles.len(), "tiles deleted");
        Ok(())
    }
}
