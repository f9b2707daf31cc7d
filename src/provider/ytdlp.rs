use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use tokio::process::Command;
use url::Url;

use super::Provider;
use crate::{
    error::{Error, Result},
    resource::{Refresh, ResourceInformation},
};

/// Extracts audio through the `yt-dlp` command line tool.
///
/// `yt-dlp` must be installed and on the `PATH`, unless another program is
/// set with [`with_program`](Self::with_program).
pub struct YtDlpProvider {
    extractor: Arc<Extractor>,
    pattern: Regex,
}

/// Runs the extraction. Shared with the refresh capabilities it hands out.
#[derive(Debug)]
struct Extractor {
    program: String,
    format: String,
}

/// Fields of `yt-dlp --dump-json` output for the selected format.
#[serde_as]
#[derive(Debug, Deserialize)]
struct Dump {
    url: Url,

    #[serde(default)]
    filesize: Option<u64>,

    #[serde(default)]
    filesize_approx: Option<u64>,

    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    duration: Option<Duration>,

    /// Audio sampling rate.
    #[serde(default)]
    asr: Option<u32>,

    #[serde(default)]
    is_live: Option<bool>,
}

impl YtDlpProvider {
    const DEFAULT_PROGRAM: &'static str = "yt-dlp";

    /// Best audio-only format in a container that can be fetched by range.
    const DEFAULT_FORMAT: &'static str = "bestaudio[ext=webm]";

    /// Video sites this provider recognizes.
    const DEFAULT_PATTERN: &'static str =
        r"^https?://((www|m|music)\.)?(youtube\.com|youtube-nocookie\.com|youtu\.be)/";

    /// Creates a provider for the default sites.
    ///
    /// # Errors
    ///
    /// See [`with_pattern`](Self::with_pattern).
    pub fn new() -> Result<Self> {
        Self::with_pattern(Self::DEFAULT_PATTERN)
    }

    /// Creates a provider for URLs matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `pattern` is not a valid regular
    /// expression.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            Error::invalid_argument(format!("invalid url pattern {pattern}: {e}"))
        })?;

        Ok(Self {
            extractor: Arc::new(Extractor {
                program: Self::DEFAULT_PROGRAM.to_owned(),
                format: Self::DEFAULT_FORMAT.to_owned(),
            }),
            pattern,
        })
    }

    #[must_use]
    pub fn with_program(self, program: &str) -> Self {
        Self {
            extractor: Arc::new(Extractor {
                program: program.to_owned(),
                format: self.extractor.format.clone(),
            }),
            ..self
        }
    }

    #[must_use]
    pub fn with_format(self, format: &str) -> Self {
        Self {
            extractor: Arc::new(Extractor {
                program: self.extractor.program.clone(),
                format: format.to_owned(),
            }),
            ..self
        }
    }
}

#[async_trait]
impl Provider for YtDlpProvider {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn can_play(&self, url: &Url) -> bool {
        self.pattern.is_match(url.as_str())
    }

    async fn get_information(&self, url: &Url) -> Result<ResourceInformation> {
        Arc::clone(&self.extractor).extract(url).await
    }
}

impl Extractor {
    async fn extract(self: Arc<Self>, reference: &Url) -> Result<ResourceInformation> {
        debug!("extracting {reference} with {}", self.program);

        let output = Command::new(&self.program)
            .arg(reference.as_str())
            .args(["-f", self.format.as_str(), "--dump-json"])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::not_found(format!(
                "{} could not extract {reference} ({}): {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let refresh = Arc::new(Reextract {
            extractor: self,
            reference: reference.clone(),
        });

        parse(&output.stdout, refresh)
    }
}

/// Refresh capability: extracts the same reference again.
struct Reextract {
    extractor: Arc<Extractor>,
    reference: Url,
}

#[async_trait]
impl Refresh for Reextract {
    async fn refresh(&self) -> Result<ResourceInformation> {
        Arc::clone(&self.extractor).extract(&self.reference).await
    }
}

fn parse(json: &[u8], refresh: Arc<dyn Refresh>) -> Result<ResourceInformation> {
    let dump: Dump = serde_json::from_slice(json)?;
    let livestream = dump.is_live.unwrap_or_default();

    let file_size = match dump.filesize.or(dump.filesize_approx) {
        Some(file_size) => file_size,
        None if livestream => 0,
        None => {
            return Err(Error::unimplemented(format!(
                "{} has no known file size",
                dump.url.host_str().unwrap_or("format")
            )))
        }
    };

    let information = ResourceInformation::new(
        dump.url,
        file_size,
        dump.duration.unwrap_or_default(),
        refresh,
    )
    .with_bitrate(dump.asr.unwrap_or_default())
    .with_livestream(livestream);

    Ok(information)
}
