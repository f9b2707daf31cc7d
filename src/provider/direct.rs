use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_RANGE, RANGE},
    StatusCode,
};
use url::Url;

use super::Provider;
use crate::{
    error::{Error, Result},
    http::{self, Transport},
    resource::{Refresh, ResourceInformation},
};

/// Plays plain `http` and `https` URLs.
///
/// The file size is probed with a one-byte range request, which also tells
/// whether the server supports range requests at all. Plain URLs carry no
/// duration, so unless one is given with
/// [`with_duration`](Self::with_duration) positions cannot be mapped to
/// offsets and seeking starts from the beginning.
pub struct DirectProvider {
    transport: Arc<dyn Transport>,
    duration: Duration,
    bitrate: u32,
}

impl DirectProvider {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            duration: Duration::ZERO,
            bitrate: 0,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }
}

#[async_trait]
impl Provider for DirectProvider {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn can_play(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn get_information(&self, url: &Url) -> Result<ResourceInformation> {
        let probe = Probe {
            transport: Arc::clone(&self.transport),
            url: url.clone(),
            duration: self.duration,
            bitrate: self.bitrate,
        };

        probe.run().await
    }
}

/// Finds the size of a resource. Doubles as its refresh capability.
#[derive(Clone)]
struct Probe {
    transport: Arc<dyn Transport>,
    url: Url,
    duration: Duration,
    bitrate: u32,
}

impl Probe {
    async fn run(&self) -> Result<ResourceInformation> {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=0-0"));

        // Only the headers are of interest; dropping the body aborts it.
        let response = http::fetch(&*self.transport, &self.url, &headers).await?;
        match response.status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                return Err(Error::unimplemented(format!(
                    "{} does not support range requests",
                    self.url
                )))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(Error::not_found(format!("{} not found", self.url)))
            }
            status => {
                return Err(Error::unavailable(format!(
                    "probing {} returned {status}",
                    self.url
                )))
            }
        }

        let content_range = response
            .headers
            .get(CONTENT_RANGE)
            .ok_or_else(|| {
                Error::unimplemented(format!("{} returned no content range", self.url))
            })?
            .to_str()?;

        // An unknown total size means an indefinite stream.
        let file_size = total_size(content_range);
        let livestream = file_size.is_none() && content_range.ends_with("/*");
        if file_size.is_none() && !livestream {
            return Err(Error::invalid_argument(format!(
                "invalid content range: {content_range}"
            )));
        }

        let information = ResourceInformation::new(
            self.url.clone(),
            file_size.unwrap_or_default(),
            self.duration,
            Arc::new(self.clone()),
        )
        .with_bitrate(self.bitrate)
        .with_livestream(livestream);

        trace!("probed {}: {information:?}", self.url);
        Ok(information)
    }
}

#[async_trait]
impl Refresh for Probe {
    async fn refresh(&self) -> Result<ResourceInformation> {
        self.run().await
    }
}

/// Parses the complete length from a `content-range` value like
/// `bytes 0-0/12345`.
fn total_size(content_range: &str) -> Option<u64> {
    let (unit, range) = content_range.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }

    let (_, total) = range.split_once('/')?;
    total.parse().ok()
}
