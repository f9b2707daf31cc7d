//! In-memory media server and refresh doubles shared by the integration
//! tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use rangeplay::{
    error::{Error, Result},
    http::{Response, Transport},
    resource::{Refresh, ResourceInformation},
    session::Settings,
    util::MIB,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_RANGE, LOCATION, RANGE},
    StatusCode,
};
use url::Url;

/// Size of the body chunks the server delivers.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Range requests as the server received them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub url: Url,
    pub range: String,
}

/// Misbehavior of a single range request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Delivers the first half of the range, then the connection resets.
    BrokenBody,

    /// Answers `206 Partial Content` without a body.
    NoBody,
}

/// Serves files by path through range requests.
///
/// Ranges are served as `[start, end)`, clamped to the file size, except the
/// one-byte probe `bytes=0-0`.
#[derive(Default)]
pub struct MediaServer {
    files: HashMap<String, Bytes>,

    /// Paths whose probe succeeds while every other range fails.
    broken: HashSet<String>,

    /// URLs answered with `403 Forbidden`, like expired signed URLs.
    expired: Mutex<HashSet<String>>,

    redirects: HashMap<String, String>,

    /// Faults of upcoming range requests, by path, in order.
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,

    requests: Mutex<Vec<Request>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight count once a body is done with.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Deterministic content that differs from offset to offset.
pub fn media(len: u64) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

impl MediaServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, len: u64) -> Self {
        self.files.insert(path.to_owned(), media(len));
        self
    }

    pub fn with_broken_file(mut self, path: &str, len: u64) -> Self {
        self.broken.insert(path.to_owned());
        self.with_file(path, len)
    }

    /// Makes the next range request for `path` that has no fault yet fail
    /// with `fault`. Probes are not affected.
    pub fn with_fault(self, path: &str, fault: Fault) -> Self {
        self.faults
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push_back(fault);
        self
    }

    pub fn with_redirect(mut self, from: &Url, to: &Url) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse("https://media.test")
            .and_then(|base| base.join(path))
            .unwrap()
    }

    pub fn file(&self, path: &str) -> Bytes {
        self.files[path].clone()
    }

    pub fn expire(&self, url: &Url) {
        self.expired.lock().unwrap().insert(url.to_string());
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Range headers of all requests except probes.
    pub fn ranges(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.range)
            .filter(|range| range != "bytes=0-0")
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn serve(&self, data: &Bytes, range: &str, fault: Option<Fault>) -> Response {
        let (start, end) = range
            .strip_prefix("bytes=")
            .and_then(|range| range.split_once('-'))
            .and_then(|(start, end)| {
                Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
            })
            .unwrap_or((0, data.len()));

        let end = if start == end { start + 1 } else { end };
        let end = end.min(data.len());
        let start = start.min(end);

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!(
                "bytes {start}-{}/{}",
                end.saturating_sub(1),
                data.len()
            ))
            .unwrap(),
        );

        let mut chunks: Vec<Result<Bytes>> = data
            .slice(start..end)
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        if fault == Some(Fault::BrokenBody) {
            chunks.truncate(chunks.len() / 2);
            chunks.push(Err(Error::data_loss("connection reset by peer")));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let in_flight = InFlight(Arc::clone(&self.in_flight));

        let body = stream::iter(chunks).map(move |chunk| {
            let _guard = &in_flight;
            chunk
        });

        Response {
            status: StatusCode::PARTIAL_CONTENT,
            headers,
            body: Some(body.boxed()),
        }
    }
}

fn status(status: StatusCode) -> Response {
    Response {
        status,
        headers: HeaderMap::new(),
        body: None,
    }
}

#[async_trait]
impl Transport for MediaServer {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<Response> {
        let range = headers
            .get(RANGE)
            .and_then(|range| range.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        self.requests.lock().unwrap().push(Request {
            url: url.clone(),
            range: range.clone(),
        });

        if let Some(location) = self.redirects.get(url.as_str()) {
            let mut response = status(StatusCode::FOUND);
            response
                .headers
                .insert(LOCATION, HeaderValue::from_str(location).unwrap());
            return Ok(response);
        }

        if self.expired.lock().unwrap().contains(url.as_str()) {
            return Ok(status(StatusCode::FORBIDDEN));
        }

        if url.path() == "/live" {
            let mut response = status(StatusCode::PARTIAL_CONTENT);
            response
                .headers
                .insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-0/*"));
            return Ok(response);
        }

        if self.broken.contains(url.path()) && range != "bytes=0-0" {
            return Ok(status(StatusCode::SERVICE_UNAVAILABLE));
        }

        let Some(data) = self.files.get(url.path()) else {
            return Ok(status(StatusCode::NOT_FOUND));
        };

        let fault = if range == "bytes=0-0" {
            None
        } else {
            self.faults
                .lock()
                .unwrap()
                .get_mut(url.path())
                .and_then(VecDeque::pop_front)
        };

        match fault {
            Some(Fault::NoBody) => Ok(status(StatusCode::PARTIAL_CONTENT)),
            fault => Ok(self.serve(data, &range, fault)),
        }
    }
}

/// Refresh capability that hands out a fixed URL and counts its calls.
#[derive(Clone)]
pub struct Refresher {
    state: Arc<RefreshState>,
}

struct RefreshState {
    url: Url,
    file_size: u64,
    duration: Duration,
    calls: AtomicUsize,
}

impl Refresher {
    /// Refreshes to `url`.
    pub fn new(url: Url, file_size: u64, duration: Duration) -> Self {
        Self {
            state: Arc::new(RefreshState {
                url,
                file_size,
                duration,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Information for `url` that refreshes through this refresher.
    pub fn information(&self, url: Url) -> ResourceInformation {
        ResourceInformation::new(
            url,
            self.state.file_size,
            self.state.duration,
            Arc::new(self.clone()),
        )
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Refresh for Refresher {
    async fn refresh(&self) -> Result<ResourceInformation> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.information(self.state.url.clone()))
    }
}

/// Fast retries and the default 1 MiB requests.
pub fn settings() -> Settings {
    Settings {
        tick_interval: Duration::from_secs(2),
        request_limit: MIB,
        max_retries: 3,
        retry_min_backoff: Duration::from_millis(100),
        retry_max_backoff: Duration::from_secs(1),
    }
}
