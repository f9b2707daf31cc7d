//! Fetch session identifiers.
//!
//! Every fetch session gets a [`SessionId`] so that its log lines can be told
//! apart from those of the session it replaced, and so that late completion
//! notices of superseded sessions can be recognized and ignored.
//!
//! ```
//! use rangeplay::uuid::SessionId;
//!
//! let id = SessionId::random();
//! let parsed: SessionId = id.uuid().hyphenated().to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

use std::{fmt, str::FromStr};

use crate::error::Error;

/// A random identifier for one fetch session.
///
/// Shown as its first eight hexadecimal digits, which is plenty to follow a
/// session through the logs.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generates a version 4 identifier from `fastrand`.
    ///
    /// Identifiers only need to be unique, not unpredictable.
    #[must_use]
    pub fn random() -> Self {
        let bytes = fastrand::u128(..).to_le_bytes();
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    #[must_use]
    pub fn uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = uuid::Uuid::encode_buffer();
        let simple = self.0.simple().encode_lower(&mut buf);
        f.write_str(&simple[..8])
    }
}

/// Accepts every notation `uuid::Uuid` parses.
impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(Self(s.parse()?))
    }
}
