//! WebRTC publishing and WHIP signaling
//!
//! Architecture:
//! ```text
//! FrameSource
//!      |
//!      v
//! Broadcaster ──> (per binding) EncodedReader ──> RtpPacketReader ──> PacketWriter
//!      ^                                                                   |
//!      |                                                                   v
//!    Track <── bind/unbind ── RtcTrack <── RTCPeerConnection <── WhipSession
//!                                                                          |
//!                                        WHIP endpoint <── POST / DELETE ──+
//! ```

pub mod binding;
pub mod config;
pub mod local_track;
pub mod packetizer;
pub mod peer;
pub mod track;
pub mod whip;

pub use binding::{BindingContext, FeedbackReader, FeedbackReport, PacketWriter};
pub use config::{TurnServer, WebRtcConfig, WhipConfig};
pub use local_track::RtcTrack;
pub use packetizer::{PacketBatch, RtpPacketReader};
pub use peer::{ConnectionState, PublisherPeer};
pub use track::{Track, TrackConfig, TrackStats};
pub use whip::{SessionState, SignalingPeer, WhipSession};
