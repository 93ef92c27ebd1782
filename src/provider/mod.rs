//! Upstream map sources.

mod http;

use bytes::Bytes;

use crate::grid::BoundingBox;

pub use http::{Error, HttpMapProvider};

/// Fetches a rendered map image covering a bounding box.
pub trait MapProvider {
    type Error: std::error::Error;

    fn get_map(
        &self,
        bbox: &BoundingBox,
        width: u32,
        height: u32,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}
