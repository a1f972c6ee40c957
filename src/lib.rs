//! WHIP ingest - real-time media publishing over WebRTC
//!
//! This crate captures frames from a local source, fans them out to one
//! encoder pipeline per negotiated peer sender and delivers RTP to a remote
//! ingest endpoint negotiated with WHIP (HTTP offer/answer).

pub mod config;
pub mod error;
pub mod media;
pub mod webrtc;

pub use error::{AppError, Result};
