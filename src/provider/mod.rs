//! Resolution of caller-facing URLs into fetchable resources.
//!
//! A [`Provider`] turns a URL like a video page into [`ResourceInformation`]
//! that a fetch session can download: a direct URL, its size and duration,
//! and a way to resolve it again once the direct URL expires.
//!
//! Two providers are included:
//! * [`YtDlpProvider`] extracts audio from video sites through `yt-dlp`
//! * [`DirectProvider`] plays plain HTTP URLs of servers that support range
//!   requests

use async_trait::async_trait;
use url::Url;

use crate::{error::Result, resource::ResourceInformation};

mod direct;
mod ytdlp;

pub use direct::DirectProvider;
pub use ytdlp::YtDlpProvider;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Whether this provider recognizes `url`. Cheap and without I/O.
    fn can_play(&self, url: &Url) -> bool;

    /// Resolves `url`.
    ///
    /// # Errors
    ///
    /// Returns error when `url` cannot be resolved, typically `NotFound` or
    /// `Unavailable`.
    async fn get_information(&self, url: &Url) -> Result<ResourceInformation>;
}
