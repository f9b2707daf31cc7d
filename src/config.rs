//! Tunables for fetch sessions and the HTTP client.
//!
//! All fields have defaults, so a configuration file only needs to list the
//! settings it changes. Durations are given in milliseconds:
//!
//! ```toml
//! tick_interval = 2000
//! request_limit = 1048576
//! max_retries = 8
//! retry_min_backoff = 250
//! retry_max_backoff = 10000
//! request_timeout = 10000
//! ```

use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::{
    error::{Error, Result},
    util::MIB,
};

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `User-Agent` sent with every request.
    pub user_agent: String,

    /// Interval between fetch session ticks.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,

    /// Bytes per range request. Fetching also pauses while at least this
    /// many bytes are buffered and unread.
    pub request_limit: u64,

    /// Retries of a failed range request before a fetch session gives up.
    /// Received data resets the count.
    pub max_retries: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_min_backoff: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_max_backoff: Duration,

    /// Maximum time to wait for each network read.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Config {
    /// Configuration files are small. Anything larger is refused.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * The file cannot be read, or is too large
    /// * The contents are not valid TOML or contain unknown keys
    /// * Values are out of range
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: the file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Checks values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for zero intervals or limits and for
    /// inverted backoff bounds.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::invalid_argument("tick interval cannot be zero"));
        }

        if self.request_limit == 0 {
            return Err(Error::invalid_argument("request limit cannot be zero"));
        }

        if self.retry_min_backoff > self.retry_max_backoff {
            return Err(Error::invalid_argument(format!(
                "minimum backoff {:?} exceeds maximum backoff {:?}",
                self.retry_min_backoff, self.retry_max_backoff
            )));
        }

        if self.user_agent.is_empty() {
            return Err(Error::invalid_argument("user agent cannot be empty"));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: user_agent(),
            tick_interval: Duration::from_millis(2000),
            request_limit: MIB,
            max_retries: 8,
            retry_min_backoff: Duration::from_millis(250),
            retry_max_backoff: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds a `User-Agent` from the application and operating system.
fn user_agent() -> String {
    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");

    // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
    let illegal_chars = |chr| chr == '/' || chr == ';';

    let os_name = match std::env::consts::OS {
        "macos" => "osx",
        other => other,
    };
    let os_version = sysinfo::System::os_version()
        .filter(|version| !version.is_empty() && !version.contains(illegal_chars))
        .unwrap_or_else(|| String::from("0"));

    let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
    trace!("user agent: {user_agent}");

    user_agent
}
