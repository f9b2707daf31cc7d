//! Seekable, buffered audio streams over chunked HTTP range requests.
//!
//! A [`player::Player`] resolves URLs through [`provider`]s into
//! [`resource::ResourceInformation`], and plays them one at a time through
//! fetch [`session`]s. Each session downloads its resource in bounded range
//! requests on a [`timer`], only as fast as the consumer reads from its
//! [`buffer`], and survives expiring URLs by refreshing them.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rangeplay::{config::Config, player::Player};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let player = Player::with_config(&Config::default())?;
//! player.play(&"https://youtu.be/dQw4w9WgXcQ".parse()?, Duration::ZERO).await?;
//!
//! let mut stream = player.take_stream().ok_or("nothing is playing")?;
//! std::io::copy(&mut stream, &mut std::io::stdout())?;
//! # Ok(())
//! # }
//! ```
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod player;
pub mod provider;
pub mod resource;
pub mod session;
pub mod signal;
pub mod timer;
pub mod util;
pub mod uuid;
