//! Playback orchestration over fetch sessions.
//!
//! The [`Player`] owns at most one running [`Session`] and a FIFO queue of
//! resolved resources waiting to be played. It:
//! * Selects a [`Provider`] for the first URL it is given, and keeps using
//!   it for every URL after that
//! * Rejects livestreams
//! * Implements seeking by replacing the current session with one that
//!   starts at the byte offset of the requested position
//! * Advances the queue when the current session ends by itself
//!
//! # Events
//!
//! State changes are reported through callbacks registered with
//! [`Player::on`]. Callbacks never run while the player is locked, so they
//! may call back into the player.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rangeplay::{config::Config, events::{Event, EventKind}, player::Player};
//!
//! let player = Player::with_config(&Config::default())?;
//! player.on(EventKind::Play, |event| {
//!     if let Event::Play(information) = event {
//!         println!("playing {information}");
//!     }
//! });
//!
//! player.enqueue(&"https://youtu.be/dQw4w9WgXcQ".parse()?, Duration::ZERO).await?;
//! let stream = player.take_stream();
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use url::Url;

use crate::{
    buffer::AudioStream,
    config::Config,
    error::{Error, Result},
    events::{Event, EventKind},
    http::{self, Transport},
    provider::{DirectProvider, Provider, YtDlpProvider},
    resource::ResourceInformation,
    session::{Outcome, Session, Settings},
    uuid::SessionId,
};

/// Callback registered with [`Player::on`].
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A resolved resource waiting to be played.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    /// URL the resource was resolved from.
    pub reference: Url,
    pub information: ResourceInformation,

    /// Position to start playing from.
    pub position: Duration,
}

/// Cheap to clone; clones control the same player.
#[derive(Clone)]
pub struct Player {
    inner: Arc<Inner>,
}

struct Inner {
    providers: Vec<Arc<dyn Provider>>,
    transport: Arc<dyn Transport>,
    settings: Settings,
    state: Mutex<State>,
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

#[derive(Default)]
struct State {
    /// Provider bound by the first resolved URL.
    provider: Option<Arc<dyn Provider>>,

    current: Option<Current>,
    queue: VecDeque<QueueEntry>,
    paused: bool,
}

struct Current {
    session: Arc<Session>,
    information: ResourceInformation,
}

impl Player {
    /// Creates a player that consults `providers` in order.
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                providers,
                transport,
                settings,
                state: Mutex::new(State::default()),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a player with an HTTP client and the `yt-dlp` and direct
    /// providers, in that order.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn with_config(config: &Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(http::Client::new(config)?);
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(YtDlpProvider::new()?),
            Arc::new(DirectProvider::new(Arc::clone(&transport))),
        ];

        Ok(Self::new(providers, transport, Settings::from(config)))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `callback` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
    }

    fn emit(&self, event: &Event) {
        // Clone so that callbacks may register more callbacks.
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            listener(event);
        }
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in &events {
            self.emit(event);
        }
    }

    /// The bound provider, binding the first one that can play `url` if
    /// there is none yet.
    fn provider_for(&self, url: &Url) -> Result<Arc<dyn Provider>> {
        let mut state = self.state();
        if let Some(provider) = &state.provider {
            return Ok(Arc::clone(provider));
        }

        let provider = self
            .inner
            .providers
            .iter()
            .find(|provider| provider.can_play(url))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no provider can play {url}")))?;

        debug!("binding provider {}", provider.name());
        state.provider = Some(Arc::clone(&provider));
        Ok(provider)
    }

    async fn resolve(&self, url: &Url) -> Result<ResourceInformation> {
        let provider = self.provider_for(url)?;
        let information = provider.get_information(url).await?;

        if information.is_livestream() {
            return Err(Error::unimplemented(format!(
                "{url} is a livestream, which is not supported"
            )));
        }

        Ok(information)
    }

    /// Replaces the current session with one for `entry`.
    fn start(&self, state: &mut State, entry: QueueEntry) -> ResourceInformation {
        if let Some(current) = state.current.take() {
            current.session.destroy();
        }

        let offset = entry.information.offset_for(entry.position);
        info!(
            "playing {} from {}s",
            entry.reference,
            entry.position.as_secs()
        );

        let session = Arc::new(Session::starting_at(
            entry.information.clone(),
            entry.reference,
            offset,
            Arc::clone(&self.inner.transport),
            self.inner.settings,
        ));
        if state.paused {
            session.pause();
        }

        self.watch(&session);
        state.current = Some(Current {
            session,
            information: entry.information.clone(),
        });

        entry.information
    }

    /// Reports the end of `session` back to this player.
    fn watch(&self, session: &Session) {
        let id = session.id();
        let finished = session.finished();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let outcome = finished.await;
            if let Some(inner) = Weak::upgrade(&inner) {
                Player { inner }.on_session_finished(id, outcome);
            }
        });
    }

    /// Advances the queue after the current session ended.
    fn on_session_finished(&self, id: SessionId, outcome: Outcome) {
        let mut events = Vec::new();

        {
            let mut state = self.state();
            let is_current = state
                .current
                .as_ref()
                .is_some_and(|current| current.session.id() == id);
            if !is_current {
                // Superseded, stopped or skipped: whoever did that took care
                // of what plays next.
                trace!("[{id}] ended after being replaced: {outcome}");
                return;
            }

            debug!("[{id}] ended: {outcome}; {} queued", state.queue.len());
            if let Outcome::Failed(e) = &outcome {
                error!("{e}");
                events.push(Event::Error(Arc::clone(e)));
            }

            events.extend(self.advance(&mut state));
        }

        self.emit_all(events);
    }

    /// Starts the next queued entry, if any.
    ///
    /// `Idle` is returned only when this ended the current session. With
    /// nothing playing and nothing queued there is nothing to report.
    fn advance(&self, state: &mut State) -> Option<Event> {
        if let Some(next) = state.queue.pop_front() {
            return Some(Event::Play(self.start(state, next)));
        }

        let current = state.current.take()?;
        current.session.destroy();
        Some(Event::Idle)
    }

    /// Plays `url` from `position`, replacing whatever plays now.
    ///
    /// The queue is left untouched.
    ///
    /// # Errors
    ///
    /// * `NotFound` if no provider can play `url`
    /// * `Unimplemented` if `url` is a livestream
    /// * Whatever the provider reports when resolving `url`
    pub async fn play(&self, url: &Url, position: Duration) -> Result<ResourceInformation> {
        let information = self.resolve(url).await?;

        let information = {
            let mut state = self.state();
            state.paused = false;
            self.start(
                &mut state,
                QueueEntry {
                    reference: url.clone(),
                    information,
                    position,
                },
            )
        };

        self.emit(&Event::Play(information.clone()));
        Ok(information)
    }

    /// Resolves `url` and plays it when nothing else plays, or queues it.
    ///
    /// # Errors
    ///
    /// As [`play`](Self::play).
    pub async fn enqueue(&self, url: &Url, position: Duration) -> Result<ResourceInformation> {
        let information = self.resolve(url).await?;
        let entry = QueueEntry {
            reference: url.clone(),
            information: information.clone(),
            position,
        };

        let started = {
            let mut state = self.state();
            if state.queue.is_empty() && state.current.is_none() && !state.paused {
                self.start(&mut state, entry);
                true
            } else {
                debug!("queueing {url} after {} more", state.queue.len());
                state.queue.push_back(entry);
                false
            }
        };

        self.emit(&Event::Enqueue(information.clone()));
        if started {
            self.emit(&Event::Play(information.clone()));
        }

        Ok(information)
    }

    /// Restarts the current resource at `position`.
    ///
    /// # Errors
    ///
    /// * `FailedPrecondition` if nothing plays
    /// * As [`play`](Self::play) otherwise
    pub async fn seek(&self, position: Duration) -> Result<ResourceInformation> {
        let reference = self
            .state()
            .current
            .as_ref()
            .map(|current| current.session.reference().clone())
            .ok_or_else(|| Error::failed_precondition("no stream to seek"))?;

        self.play(&reference, position).await
    }

    /// Stops the current session without advancing the queue.
    pub fn stop(&self) {
        let current = self.state().current.take();
        if let Some(current) = current {
            info!("stopping {}", current.session.reference());
            current.session.destroy();
        }
    }

    /// Ends the current session and plays the next queued entry.
    ///
    /// Emits `Idle` when this ended the last entry. Does nothing when
    /// nothing plays or is queued.
    pub fn skip(&self) {
        let event = {
            let mut state = self.state();
            self.advance(&mut state)
        };

        if let Some(event) = event {
            self.emit(&event);
        }
    }

    /// Stops fetching for the current session.
    pub fn pause(&self) {
        let mut state = self.state();
        state.paused = true;
        if let Some(current) = &state.current {
            current.session.pause();
        }
    }

    /// Continues fetching, or starts the next queued entry when nothing
    /// plays.
    pub fn resume(&self) {
        let event = {
            let mut state = self.state();
            state.paused = false;

            match &state.current {
                Some(current) => {
                    current.session.resume();
                    None
                }
                None => self.advance(&mut state),
            }
        };

        if let Some(event) = event {
            self.emit(&event);
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Rate of the current resource, or zero when nothing plays.
    #[must_use]
    pub fn current_sample_rate(&self) -> u32 {
        self.state()
            .current
            .as_ref()
            .map_or(0, |current| current.information.bitrate())
    }

    /// The resource that plays now.
    #[must_use]
    pub fn current(&self) -> Option<ResourceInformation> {
        self.state()
            .current
            .as_ref()
            .map(|current| current.information.clone())
    }

    /// The session that plays now.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state()
            .current
            .as_ref()
            .map(|current| Arc::clone(&current.session))
    }

    /// Takes the readable output of the current session. Only the first
    /// call per session returns it.
    #[must_use]
    pub fn take_stream(&self) -> Option<AudioStream> {
        self.session().and_then(|session| session.take_stream())
    }

    #[must_use]
    pub fn queue(&self) -> Vec<QueueEntry> {
        self.state().queue.iter().cloned().collect()
    }

    /// Empties the queue. The current session keeps playing.
    pub fn clear_queue(&self) {
        self.state().queue.clear();
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Player")
            .field(
                "provider",
                &state.provider.as_ref().map(|provider| provider.name()),
            )
            .field(
                "current",
                &state.current.as_ref().map(|current| &current.session),
            )
            .field("queue", &state.queue.len())
            .field("paused", &state.paused)
            .finish_non_exhaustive()
    }
}
