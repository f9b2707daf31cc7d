//! Events emitted by the [`Player`](crate::player::Player).
//!
//! Register callbacks per [`EventKind`] with
//! [`Player::on`](crate::player::Player::on). Callbacks run in registration
//! order, right after the state change they report.
//!
//! # Example
//!
//! ```rust
//! use rangeplay::events::{Event, EventKind};
//!
//! player.on(EventKind::Play, |event| {
//!     if let Event::Play(information) = event {
//!         println!("now playing {information}");
//!     }
//! });
//! ```

use std::sync::Arc;

use crate::{error::Error, resource::ResourceInformation};

#[derive(Clone, Debug)]
pub enum Event {
    /// A fetch session for this resource started.
    Play(ResourceInformation),

    /// This resource was enqueued. It may have started playing right away,
    /// in which case [`Play`](Self::Play) follows.
    Enqueue(ResourceInformation),

    /// The current session failed for good. The queue advances regardless.
    Error(Arc<Error>),

    /// The current session ended and nothing was left to play.
    Idle,
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Play(_) => EventKind::Play,
            Self::Enqueue(_) => EventKind::Enqueue,
            Self::Error(_) => EventKind::Error,
            Self::Idle => EventKind::Idle,
        }
    }
}

/// Discriminant of an [`Event`], to subscribe by.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Play,
    Enqueue,
    Error,
    Idle,
}
