//! Metadata of a playable remote resource.
//!
//! A [`ResourceInformation`] describes where the raw media bytes can be
//! fetched, how many there are and how long they play. Direct URLs handed
//! out by providers tend to be signed and time-limited, so every value
//! carries a [`Refresh`] capability to resolve a fresh one.
//!
//! Values are never mutated in place: a refresh returns a new value.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use crate::{
    error::Result,
    util::{self, mib},
};

/// Resolves the same resource again, typically for a new direct URL.
#[async_trait]
pub trait Refresh: Send + Sync {
    async fn refresh(&self) -> Result<ResourceInformation>;
}

#[derive(Clone)]
pub struct ResourceInformation {
    url: Url,
    file_size: u64,
    duration: Duration,
    bitrate: u32,
    livestream: bool,
    refresh: Arc<dyn Refresh>,
}

impl ResourceInformation {
    #[must_use]
    pub fn new(url: Url, file_size: u64, duration: Duration, refresh: Arc<dyn Refresh>) -> Self {
        Self {
            url,
            file_size,
            duration,
            bitrate: 0,
            livestream: false,
            refresh,
        }
    }

    #[must_use]
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    #[must_use]
    pub fn with_livestream(mut self, livestream: bool) -> Self {
        self.livestream = livestream;
        self
    }

    /// The direct, byte-range addressable URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Audio rate as reported by the provider, or zero when unknown.
    #[must_use]
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    #[must_use]
    pub fn is_livestream(&self) -> bool {
        self.livestream
    }

    /// Byte offset to start fetching from to play from `position`.
    ///
    /// Assumes a constant byte rate over the whole resource, which is what a
    /// container-unaware fetcher can do. Positions past the end map to the
    /// file size.
    #[must_use]
    pub fn offset_for(&self, position: Duration) -> u64 {
        let duration = self.duration.as_millis();
        if duration == 0 {
            return 0;
        }

        util::scale(self.file_size, position.as_millis(), duration).min(self.file_size)
    }

    /// Playback time at which byte `offset` is reached. The inverse of
    /// [`offset_for`](Self::offset_for).
    #[must_use]
    pub fn position_at(&self, offset: u64) -> Duration {
        util::scale_duration(self.duration, offset.min(self.file_size), self.file_size)
    }

    /// Resolves this resource again.
    ///
    /// # Errors
    ///
    /// Whatever the provider reports when it cannot resolve the resource.
    pub async fn refresh(&self) -> Result<Self> {
        self.refresh.refresh().await
    }
}

impl fmt::Debug for ResourceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceInformation")
            .field("url", &self.url.as_str())
            .field("file_size", &self.file_size)
            .field("duration", &self.duration)
            .field("bitrate", &self.bitrate)
            .field("livestream", &self.livestream)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ResourceInformation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({:.1} MiB; {}s)",
            self.url.host_str().unwrap_or("?"),
            mib(self.file_size),
            self.duration.as_secs()
        )
    }
}
