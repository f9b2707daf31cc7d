//! Shutdown requests from the operating system.
//!
//! The CLI stops playback and flushes its output when it receives one of:
//! * Ctrl-C (SIGINT), on every platform
//! * SIGTERM, on Unix
//!
//! # Example
//!
//! ```no_run
//! use rangeplay::signal::Handler;
//!
//! # async fn example() -> rangeplay::error::Result<()> {
//! let mut signals = Handler::new()?;
//! let signal = signals.recv().await;
//! println!("received {signal}, shutting down");
//! # Ok(())
//! # }
//! ```

use std::fmt;

use crate::error::Result;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[expect(clippy::module_name_repetitions)]
pub enum ShutdownSignal {
    /// Ctrl-C
    Interrupt,

    /// SIGTERM, as sent by service managers.
    Terminate,
}

/// Listens for [`ShutdownSignal`]s.
///
/// Signals are captured from the moment the handler is created, so none are
/// lost between creating it and awaiting [`recv`](Self::recv).
pub struct Handler {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,

    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Handler {
    /// # Errors
    ///
    /// Returns error if the signal listeners cannot be installed.
    #[cfg(unix)]
    pub fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// # Errors
    ///
    /// Never fails on this platform.
    #[cfg(not(unix))]
    pub fn new() -> Result<Self> {
        Ok(Self {})
    }

    /// Waits for the next shutdown signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        }
    }

    /// Waits for the next shutdown signal.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> ShutdownSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }

        ShutdownSignal::Interrupt
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "Ctrl-C",
            Self::Terminate => "SIGTERM",
        };

        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "Ctrl-C");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
