//! Media capture side: sources, fan-out, encoders and RTP clocking

pub mod broadcaster;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod sampler;
pub mod source;

pub use broadcaster::{BroadcastReader, Broadcaster};
pub use format::{MediaKind, MediaProps, PixelFormat, Resolution, SampleFormat};
pub use frame::MediaFrame;
pub use sampler::Sampler;
pub use source::{
    AnnexBSource, ChannelSource, FrameSource, IvfSource, OggSource, RawPipeSource, TestPatternSource,
};
