//! partybot-rs library crate
//!
//! Real-time bridge between a multi-speaker voice channel and a remote
//! streaming audio service. The main binary is in main.rs.

#[macro_use]
extern crate log;

pub mod backpressure;
pub mod config;
pub mod constants;
pub mod error;
pub mod mixer;
pub mod pcm;
pub mod pipeline;
pub mod playback;
pub mod remote;
pub mod resample;
pub mod session;
pub mod vad;

#[cfg(feature = "discord")]
pub mod discord;

#[cfg(all(test, feature = "discord"))]
mod discord_tests;
#[cfg(test)]
mod playback_tests;
#[cfg(test)]
mod resample_tests;
#[cfg(test)]
mod vad_tests;
