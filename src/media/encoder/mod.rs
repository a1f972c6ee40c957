//! Encoder contract and codec negotiation
//!
//! Native encoders live outside this crate; they plug in through
//! [`EncoderBuilder`]. [`CodecSelector`] picks the first candidate able to
//! encode the current input for one of the requested codec names.

pub mod codec;
pub mod passthrough;
pub mod selector;
pub mod traits;

pub use codec::RtpCodec;
pub use passthrough::PassthroughEncoder;
pub use selector::CodecSelector;
pub use traits::{EncodedChunk, EncodedReader, EncoderBuilder, EncoderController, KeyFrameController};
