//! Fetch sessions: incremental download of one resource through range
//! requests.
//!
//! A [`Session`] keeps a [`Sink`] filled with the bytes of one remote
//! resource, fetching at most `request_limit` bytes per HTTP range request.
//! It runs in its own task, driven by a [`Timer`]:
//!
//! 1. On every tick, when no request is in flight, fewer than
//!    `request_limit` bytes are buffered and not everything was received,
//!    the next range is requested
//! 2. The response body is pushed into the sink chunk by chunk as it
//!    arrives
//! 3. Once everything was received and the consumer read it all, the
//!    session completes
//!
//! # Failure Handling
//!
//! Direct URLs expire. When a range request fails or returns an error
//! status, the session refreshes its [`ResourceInformation`] for a new
//! URL, backs off and tries again right away. Successful data resets the
//! retry budget; when the budget is spent the session fails with
//! `ResourceExhausted`.
//!
//! # Lifecycle
//!
//! A session starts fetching as soon as it is created and ends with an
//! [`Outcome`]:
//! * [`Completed`](Outcome::Completed) - all bytes were fetched and read
//! * [`Closed`](Outcome::Closed) - the consumer dropped the stream
//! * [`Destroyed`](Outcome::Destroyed) - [`Session::destroy`] was called
//! * [`Failed`](Outcome::Failed) - retries were exhausted
//!
//! # Example
//!
//! ```no_run
//! use rangeplay::session::{Outcome, Session, Settings};
//!
//! let session = Session::new(information, reference, transport, Settings::default());
//! let stream = session.take_stream();
//!
//! // ... hand `stream` to a decoder ...
//!
//! match session.finished().await {
//!     Outcome::Completed => println!("done"),
//!     outcome => println!("ended early: {outcome:?}"),
//! }
//! ```

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use exponential_backoff::Backoff;
use futures_util::StreamExt;
use reqwest::{
    header::{HeaderMap, HeaderValue, RANGE},
    StatusCode, Url,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{self, AudioStream, Sink},
    config::Config,
    error::{Error, Result},
    http::{self, Body, Transport},
    resource::ResourceInformation,
    timer::Timer,
    util::mib,
    uuid::SessionId,
};

/// Fetch behaviour of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    pub tick_interval: Duration,
    pub request_limit: u64,
    pub max_retries: u32,
    pub retry_min_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Settings {
    /// Delay before retrying after the `attempt`th consecutive failure,
    /// counting from zero.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Backoff::new(
            self.max_retries.saturating_add(1),
            self.retry_min_backoff,
            self.retry_max_backoff,
        )
        .into_iter()
        .nth(attempt as usize)
        .flatten()
        .unwrap_or(self.retry_max_backoff)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(2000),
            request_limit: crate::util::MIB,
            max_retries: 8,
            retry_min_backoff: Duration::from_millis(250),
            retry_max_backoff: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            tick_interval: config.tick_interval,
            request_limit: config.request_limit,
            max_retries: config.max_retries,
            retry_min_backoff: config.retry_min_backoff,
            retry_max_backoff: config.retry_max_backoff,
        }
    }
}

/// How a [`Session`] ended.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Every byte was fetched and read.
    Completed,

    /// The consumer closed the stream before the end.
    Closed,

    /// The session was destroyed.
    Destroyed,

    /// Fetching failed for good.
    Failed(Arc<Error>),
}

impl Outcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Closed => write!(f, "closed"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Counters and flags shared between a session and its task.
#[derive(Debug, Default)]
struct Progress {
    bytes_received: AtomicU64,

    /// Whether a range request is in flight.
    locked: AtomicBool,

    /// Set once and never reset.
    destroyed: AtomicBool,

    /// Set once everything up to the file size was received.
    fetch_completed: AtomicBool,
}

/// Incremental download of one resource.
///
/// Dropping a session destroys it.
pub struct Session {
    id: SessionId,

    /// Caller-facing URL the resource was resolved from.
    reference: Url,

    /// Byte offset fetching started at.
    start: u64,

    information: Arc<Mutex<ResourceInformation>>,
    progress: Arc<Progress>,
    sink: Arc<dyn Sink>,
    timer: Timer,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<Outcome>>,
    stream: Mutex<Option<AudioStream>>,
}

impl Session {
    /// Starts fetching `information` from the beginning into a new
    /// [`Buffer`](buffer::Buffer).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        information: ResourceInformation,
        reference: Url,
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Self {
        Self::starting_at(information, reference, 0, transport, settings)
    }

    /// Starts fetching `information` from byte `start` into a new
    /// [`Buffer`](buffer::Buffer).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn starting_at(
        information: ResourceInformation,
        reference: Url,
        start: u64,
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Self {
        let (buffer, stream) = buffer::channel();
        let session = Self::with_sink(
            information,
            reference,
            start,
            Arc::new(buffer),
            transport,
            settings,
        );
        *session.stream_slot() = Some(stream);
        session
    }

    /// Starts fetching `information` from byte `start` into `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_sink(
        information: ResourceInformation,
        reference: Url,
        start: u64,
        sink: Arc<dyn Sink>,
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Self {
        let id = SessionId::random();
        let file_size = information.file_size();
        let start = start.min(file_size);
        debug!("[{id}] starting at byte {start} of {information} for {reference}");

        let information = Arc::new(Mutex::new(information));
        let progress = Arc::new(Progress {
            bytes_received: AtomicU64::new(start),
            ..Progress::default()
        });
        let timer = Timer::new(settings.tick_interval);
        let cancel = CancellationToken::new();
        let (outcome_tx, outcome) = watch::channel(None);

        let driver = Driver {
            id,
            file_size,
            start,
            information: Arc::clone(&information),
            progress: Arc::clone(&progress),
            sink: Arc::clone(&sink),
            transport,
            timer: timer.clone(),
            cancel: cancel.clone(),
            settings,
            failures: 0,
            body: None,
        };

        tokio::spawn(async move {
            let (outcome, parts) = driver.run().await;
            parts.release();

            debug!("[{id}] {outcome}");
            // Nobody may be waiting for the outcome anymore.
            let _ = outcome_tx.send(Some(outcome));
        });

        Self {
            id,
            reference,
            start,
            information,
            progress,
            sink,
            timer,
            cancel,
            outcome,
            stream: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn reference(&self) -> &Url {
        &self.reference
    }

    /// The most recently resolved information of the resource.
    #[must_use]
    pub fn information(&self) -> ResourceInformation {
        self.information
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Byte offset fetching started at.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Bytes received so far, including the start offset.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.progress.bytes_received.load(Ordering::SeqCst)
    }

    /// Bytes read by the consumer so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.sink.consumed()
    }

    /// Estimated playback position of the consumer.
    #[must_use]
    pub fn position(&self) -> Duration {
        self.information()
            .position_at(self.start.saturating_add(self.bytes_read()))
    }

    /// Whether a range request is in flight.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.progress.locked.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.progress.destroyed.load(Ordering::SeqCst)
    }

    /// Whether all bytes up to the file size were received.
    #[must_use]
    pub fn is_fetch_completed(&self) -> bool {
        self.progress.fetch_completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.timer.is_paused()
    }

    /// Stops fetching new ranges until resumed. A request in flight is
    /// still received.
    pub fn pause(&self) {
        self.timer.pause();
    }

    pub fn resume(&self) {
        self.timer.resume();
    }

    fn stream_slot(&self) -> MutexGuard<'_, Option<AudioStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the readable output of this session.
    ///
    /// Returns `None` on subsequent calls, and for sessions created
    /// [`with_sink`](Self::with_sink). Dropping the stream ends the session
    /// with [`Outcome::Closed`].
    #[must_use]
    pub fn take_stream(&self) -> Option<AudioStream> {
        self.stream_slot().take()
    }

    /// How the session ended, or `None` while it is running.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// Waits until the session ended.
    ///
    /// The returned future does not borrow the session, and resolves
    /// immediately when the session already ended.
    pub fn finished(&self) -> impl Future<Output = Outcome> + Send + 'static {
        let mut outcome = self.outcome.clone();
        async move {
            outcome
                .wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone())
                .ok()
                .flatten()
                // The task went away without reporting, which only happens
                // when the runtime shuts down.
                .unwrap_or(Outcome::Destroyed)
        }
    }

    /// Stops fetching and releases the sink and any request in flight.
    ///
    /// Idempotent, and safe to call after the session ended by itself.
    pub fn destroy(&self) {
        if self.progress.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("[{}] destroying", self.id);
        self.timer.destroy();
        self.cancel.cancel();
        self.sink.destroy();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("reference", &self.reference.as_str())
            .field("start", &self.start)
            .field("progress", &self.progress)
            .field("outcome", &*self.outcome.borrow())
            .finish_non_exhaustive()
    }
}

/// What the driver does after handling an event.
enum Step {
    /// Wait for the next event.
    Idle,

    /// Restart the timer and tick right away.
    Retick,

    Done(Outcome),
}

/// Event that woke the driver.
enum Wake {
    Cancelled,
    Chunk(Option<Result<Bytes>>),
    Changed,
    Tick(bool),
}

/// State owned by the task of a session.
struct Driver {
    id: SessionId,

    /// Size of the resource as first resolved. Refreshes do not change it.
    file_size: u64,

    /// Byte offset fetching started at.
    start: u64,

    information: Arc<Mutex<ResourceInformation>>,
    progress: Arc<Progress>,
    sink: Arc<dyn Sink>,
    transport: Arc<dyn Transport>,
    timer: Timer,
    cancel: CancellationToken,
    settings: Settings,

    /// Consecutive failed attempts.
    failures: u32,

    /// Body of the range request in flight.
    body: Option<Body>,
}

/// Parts of a driver needed to release its resources once it returned.
struct Parts {
    progress: Arc<Progress>,
    sink: Arc<dyn Sink>,
    timer: Timer,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) -> (Outcome, Parts) {
        self.timer.start();
        let mut step = self.tick().await;

        let outcome = loop {
            match step {
                Step::Done(outcome) => break outcome,
                Step::Retick => {
                    self.timer.reset();
                    step = self.tick().await;
                    continue;
                }
                Step::Idle => {}
            }

            let wake = tokio::select! {
                biased;

                () = self.cancel.cancelled() => Wake::Cancelled,
                chunk = next_chunk(&mut self.body) => Wake::Chunk(chunk),
                () = self.sink.changed() => Wake::Changed,
                alive = self.timer.tick() => Wake::Tick(alive),
            };

            step = match wake {
                Wake::Cancelled | Wake::Tick(false) => Step::Done(Outcome::Destroyed),
                Wake::Chunk(chunk) => self.on_chunk(chunk).await,
                Wake::Changed => self.check_completion(),
                Wake::Tick(true) => self.tick().await,
            };
        };

        let parts = Parts {
            progress: self.progress,
            sink: self.sink,
            timer: self.timer,
            cancel: self.cancel,
        };

        (outcome, parts)
    }

    fn information(&self) -> ResourceInformation {
        self.information
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bytes_received(&self) -> u64 {
        self.progress.bytes_received.load(Ordering::SeqCst)
    }

    fn is_locked(&self) -> bool {
        self.progress.locked.load(Ordering::SeqCst)
    }

    fn unlock(&self) {
        self.progress.locked.store(false, Ordering::SeqCst);
    }

    async fn tick(&mut self) -> Step {
        if self.cancel.is_cancelled() {
            return Step::Done(Outcome::Destroyed);
        }

        self.log_state();

        // Backpressure: only refill when the consumer is catching up.
        let pending = self.sink.pending_len() as u64;
        let sufficient = pending >= self.settings.request_limit;
        let received = self.bytes_received();

        if !self.is_locked() && !sufficient && received < self.file_size {
            self.progress.locked.store(true, Ordering::SeqCst);
            if let Err(e) = self.request(received).await {
                return self.recover(e).await;
            }

            if self.cancel.is_cancelled() {
                return Step::Done(Outcome::Destroyed);
            }
        }

        self.check_completion()
    }

    /// Requests the next range starting at `start`, keeping the body for
    /// the driver to stream from.
    async fn request(&mut self, start: u64) -> Result<()> {
        let end = start
            .saturating_add(self.settings.request_limit)
            .min(self.file_size);
        let headers = range_headers(start, end)?;
        let url = self.information().url().clone();
        debug!(
            "[{}] requesting bytes {start}-{end} from {}",
            self.id,
            url.host_str().unwrap_or("?")
        );

        let response = tokio::select! {
            biased;

            // Dropping the request future aborts it.
            () = self.cancel.cancelled() => return Ok(()),
            response = http::fetch(&*self.transport, &url, &headers) => response?,
        };

        let status = response.status;
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::unavailable(format!(
                "range request for bytes {start}-{end} returned {status}"
            )));
        }

        if status == StatusCode::OK && start > 0 {
            return Err(Error::unavailable(format!(
                "server ignored range request for bytes {start}-{end}"
            )));
        }

        match response.body {
            Some(body) => self.body = Some(body),
            None => {
                trace!("[{}] range request returned no body", self.id);
                self.unlock();
            }
        }

        Ok(())
    }

    async fn on_chunk(&mut self, chunk: Option<Result<Bytes>>) -> Step {
        if self.cancel.is_cancelled() {
            return Step::Done(Outcome::Destroyed);
        }

        match chunk {
            Some(Ok(mut bytes)) => {
                let received = self.bytes_received();
                let remaining = self.file_size.saturating_sub(received);
                if bytes.len() as u64 > remaining {
                    // Never exceed the file size, whatever the server sends.
                    bytes.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
                }

                let len = bytes.len() as u64;
                if len > 0 {
                    self.sink.push(bytes);
                    self.progress
                        .bytes_received
                        .fetch_add(len, Ordering::SeqCst);
                    self.failures = 0;
                }

                if received + len >= self.file_size {
                    self.complete_fetch();
                }
            }

            Some(Err(e)) => return self.recover(e).await,

            None => {
                trace!("[{}] range request finished", self.id);
                self.body = None;
                self.unlock();
            }
        }

        self.check_completion()
    }

    /// Marks that everything was received, so the consumer sees the end of
    /// the stream once it read everything.
    fn complete_fetch(&mut self) {
        if self.progress.fetch_completed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(
            "[{}] fetch completed: {:.2} MiB",
            self.id,
            mib(self.file_size)
        );
        self.body = None;
        self.unlock();
        self.sink.finish();
    }

    /// Refreshes the resource after a failed attempt and schedules a retry,
    /// or gives up when out of retries.
    async fn recover(&mut self, error: Error) -> Step {
        self.body = None;
        self.failures += 1;

        if self.failures > self.settings.max_retries {
            error!(
                "[{}] giving up after {} failed attempts: {error}",
                self.id, self.failures
            );
            self.unlock();
            return Step::Done(Outcome::Failed(Arc::new(Error::resource_exhausted(
                format!("fetch failed {} times, last: {error}", self.failures),
            ))));
        }

        warn!(
            "[{}] attempt {} of {} failed: {error}",
            self.id,
            self.failures,
            self.settings.max_retries + 1
        );

        let current = self.information();
        let refreshed = tokio::select! {
            biased;

            () = self.cancel.cancelled() => return Step::Done(Outcome::Destroyed),
            refreshed = current.refresh() => refreshed,
        };

        match refreshed {
            Ok(information) => self.replace_information(information),
            Err(e) => warn!("[{}] refresh failed: {e}", self.id),
        }

        self.unlock();

        let delay = self.settings.backoff(self.failures - 1);
        trace!("[{}] retrying in {delay:?}", self.id);
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Step::Done(Outcome::Destroyed),
            () = tokio::time::sleep(delay) => Step::Retick,
        }
    }

    fn replace_information(&self, information: ResourceInformation) {
        if information.file_size() != self.file_size {
            warn!(
                "[{}] refreshed file size {} differs from {}, keeping the latter",
                self.id,
                information.file_size(),
                self.file_size
            );
        }

        debug!("[{}] refreshed: {information}", self.id);
        *self
            .information
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = information;
    }

    /// Complete once the consumer read everything. Closing the sink discards
    /// pending chunks, so the pending length does not tell.
    fn check_completion(&self) -> Step {
        let expected = self.file_size - self.start;
        if self.bytes_received() >= self.file_size && self.sink.consumed() >= expected {
            debug!("[{}] completed", self.id);
            return Step::Done(Outcome::Completed);
        }

        if self.sink.is_closed() {
            debug!("[{}] stream closed", self.id);
            return Step::Done(Outcome::Closed);
        }

        Step::Idle
    }

    fn log_state(&self) {
        debug!(
            "[{}] received {:.2}/{:.2} MiB; buffered {:.2} MiB; locked: {}; completed: {}",
            self.id,
            mib(self.bytes_received()),
            mib(self.file_size),
            mib(self.sink.pending_len() as u64),
            self.is_locked(),
            self.progress.fetch_completed.load(Ordering::SeqCst),
        );
    }
}

impl Parts {
    fn release(&self) {
        self.progress.destroyed.store(true, Ordering::SeqCst);
        self.progress.locked.store(false, Ordering::SeqCst);
        self.timer.destroy();
        self.cancel.cancel();
        self.sink.destroy();
    }
}

/// Next chunk of the body, or never when there is none.
async fn next_chunk(body: &mut Option<Body>) -> Option<Result<Bytes>> {
    match body {
        Some(body) => body.next().await,
        None => std::future::pending().await,
    }
}

/// Builds the headers of a request for bytes `start` through `end`.
fn range_headers(start: u64, end: u64) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(RANGE, HeaderValue::from_str(&format!("bytes={start}-{end}"))?);
    Ok(headers)
}
