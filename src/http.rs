//! HTTP transport for range requests, with rate limiting and redirect
//! handling.
//!
//! This module provides:
//! * The [`Transport`] trait that fetch sessions and providers issue their
//!   requests through, so that tests can substitute an in-memory server
//! * [`Client`], the production transport wrapping `reqwest::Client`
//! * [`fetch`], which follows redirects on top of any transport and fails
//!   on redirect loops
//!
//! [`Client`] lets 50 requests through at once and one more every 100 ms
//! after that. Requests over the limit wait.
//!
//! ```no_run
//! use rangeplay::{config::Config, http::{self, Client}};
//! use reqwest::header::{HeaderMap, HeaderValue, RANGE};
//! use url::Url;
//!
//! # async fn example() -> rangeplay::error::Result<()> {
//! let client = Client::new(&Config::default())?;
//! let url = Url::parse("https://media.example.com/audio.webm")?;
//!
//! let mut headers = HeaderMap::new();
//! headers.insert(RANGE, HeaderValue::from_static("bytes=0-1048576"));
//! let response = http::fetch(&client, &url, &headers).await?;
//! # Ok(())
//! # }
//! ```

use std::{collections::HashSet, fmt, num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{
    header::{HeaderMap, LOCATION},
    redirect, StatusCode, Url,
};

use crate::{
    config::Config,
    error::{Error, RedirectLoop, Result},
};

/// Incremental response body.
pub type Body = BoxStream<'static, Result<Bytes>>;

/// Response to a request issued through a [`Transport`].
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,

    /// The body, or `None` when the response has none.
    pub body: Option<Body>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Issues single GET requests without following redirects.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a GET request for `url` with `headers`.
    ///
    /// Resolves as soon as the response headers arrived; the body is
    /// delivered incrementally.
    ///
    /// # Errors
    ///
    /// Returns error when the request could not be sent or no response
    /// headers were received. HTTP error statuses are *not* errors.
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<Response>;
}

/// Maximum number of redirects [`fetch`] follows for one request.
pub const MAX_REDIRECTS: usize = 10;

/// Sends a GET request, following redirects.
///
/// Redirects are followed through their `location` header, which may be
/// relative to the URL it was received from. Every request in the chain
/// carries the same `headers`.
///
/// # Errors
///
/// * `Aborted` with a [`RedirectLoop`] when a location is visited twice
/// * `Unavailable` when a redirect has no `location`, or the chain is longer
///   than [`MAX_REDIRECTS`]
/// * Whatever the transport reports
pub async fn fetch<T>(transport: &T, url: &Url, headers: &HeaderMap) -> Result<Response>
where
    T: Transport + ?Sized,
{
    let mut url = url.clone();
    let mut visited = HashSet::from([url.clone()]);

    loop {
        let response = transport.get(&url, headers).await?;
        if !response.status.is_redirection() {
            return Ok(response);
        }

        let location = response.headers.get(LOCATION).ok_or_else(|| {
            Error::unavailable(format!(
                "{} redirect from {url} without location",
                response.status
            ))
        })?;
        let target = url.join(location.to_str()?)?;

        if !visited.insert(target.clone()) {
            return Err(Error::aborted(RedirectLoop { url: target }));
        }

        if visited.len() > MAX_REDIRECTS {
            return Err(Error::unavailable(format!(
                "more than {MAX_REDIRECTS} redirects from {url}"
            )));
        }

        trace!("{} redirect to {target}", response.status);
        url = target;
    }
}

/// Production [`Transport`] on top of `reqwest`.
///
/// Requests wait for a rate limiter before going out, so retries after
/// quick failures are spaced. Redirects are left to [`fetch`].
pub struct Client {
    inner: reqwest::Client,
    throttle: DefaultDirectRateLimiter,
}

impl Client {
    /// Requests allowed back to back before throttling kicks in.
    const BURST: u32 = 50;

    /// Time for the limiter to regain one request.
    const REPLENISH: Duration = Duration::from_millis(100);

    /// Range requests for a resource hit the same host every few seconds.
    const KEEPALIVE: Duration = Duration::from_secs(60);

    /// # Errors
    ///
    /// Fails when the user agent is not a valid header value, or the TLS
    /// backend cannot be initialized.
    pub fn new(config: &Config) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .read_timeout(config.request_timeout)
            .tcp_keepalive(Self::KEEPALIVE)
            .user_agent(&config.user_agent)
            .build()?;

        let burst = NonZeroU32::new(Self::BURST)
            .ok_or_else(|| Error::internal("rate limiter burst is zero"))?;
        let quota = Quota::with_period(Self::REPLENISH)
            .ok_or_else(|| Error::internal("rate limiter period is zero"))?
            .allow_burst(burst);

        Ok(Self {
            inner,
            throttle: RateLimiter::direct(quota),
        })
    }
}

#[async_trait]
impl Transport for Client {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<Response> {
        self.throttle.until_ready().await;

        let response = self
            .inner
            .get(url.clone())
            .headers(headers.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.content_length() {
            Some(0) => None,
            _ => Some(response.bytes_stream().map_err(Error::from).boxed()),
        };

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
