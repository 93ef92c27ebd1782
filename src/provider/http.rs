use bytes::Bytes;
use tracing::{debug, trace, warn};
use url::Url;

use crate::{config::MapProviderConfig, grid::BoundingBox};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Map request failed with {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("Map response is not an image: {content_type}")]
    NotAnImage { content_type: String },
}

impl MapProviderConfig {
    /// GetMap (WMS 1.3.0) or export (ArcGIS REST) request for `bbox`.
    pub fn url(&self, bbox: &BoundingBox, width: u32, height: u32) -> Url {
        match self {
            Self::Wms {
                url,
                layers,
                styles,
                format,
                crs,
            } => {
                // WMS 1.3.0 uses latitude-first axis order for EPSG:4326
                let bbox = if crs == "EPSG:4326" {
                    format!("{},{},{},{}", bbox.south, bbox.west, bbox.north, bbox.east)
                } else {
                    bbox.to_string()
                };
                let mut url = url.clone();
                url.query_pairs_mut()
                    .append_pair("SERVICE", "WMS")
                    .append_pair("VERSION", "1.3.0")
                    .append_pair("REQUEST", "GetMap")
                    .append_pair("LAYERS", layers)
                    .append_pair("STYLES", styles)
                    .append_pair("FORMAT", format)
                    .append_pair("TRANSPARENT", "TRUE")
                    .append_pair("CRS", crs)
                    .append_pair("BBOX", &bbox)
                    .append_pair("WIDTH", &width.to_string())
                    .append_pair("HEIGHT", &height.to_string());
                url
            }
            Self::Arcgis { url, format } => {
                let mut url = url.clone();
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.pop_if_empty().push("export");
                }
                url.query_pairs_mut()
                    .append_pair("bbox", &bbox.to_string())
                    .append_pair("bboxSR", "4326")
                    .append_pair("imageSR", "4326")
                    .append_pair("size", &format!("{width},{height}"))
                    .append_pair("format", format)
                    .append_pair("transparent", "true")
                    .append_pair("f", "image");
                url
            }
        }
    }
}

pub struct HttpMapProvider {
    client: reqwest::Client,
    config: MapProviderConfig,
}

impl HttpMapProvider {
    pub fn new(client: reqwest::Client, config: MapProviderConfig) -> Self {
        Self { client, config }
    }
}

impl super::MapProvider for HttpMapProvider {
    type Error = Error;

    async fn get_map(&self, bbox: &BoundingBox, width: u32, height: u32) -> Result<Bytes, Error> {
        let url = self.config.url(bbox, width, height);
        trace!(%url, "map request");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, "map request failed");
            return Err(Error::Status { status, body });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        if !content_type.starts_with("image/") {
            // servers report rendering errors as XML with a 200 status
            let body = response.text().await.unwrap_or_default();
            warn!(
                %url,
                content_type = content_type.as_str(),
                body = body.as_str(),
                "map response is not an image"
            );
            return Err(Error::NotAnImage { content_type });
        }
        let body = response.bytes().await?;
        debug!(%url, size = body.len(), "map fetched");
        Ok(body)
    }
}
