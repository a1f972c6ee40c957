//! Pass-through encoder for input that is already in its wire format
//!
//! Frames coming out of an [`AnnexBSource`](crate::media::source::AnnexBSource)
//! or [`IvfSource`](crate::media::source::IvfSource) are forwarded as-is.
//! There is no encoder to steer, so no key-frame capability is exposed.

use async_trait::async_trait;
use tracing::debug;

use super::codec::RtpCodec;
use super::traits::{EncodedChunk, EncodedReader, EncoderBuilder, EncoderController};
use crate::error::{AppError, Result};
use crate::media::broadcaster::BroadcastReader;
use crate::media::format::{MediaProps, PixelFormat, SampleFormat};

/// Bit stream layout a pass-through candidate accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accepts {
    Video(PixelFormat),
    Audio(SampleFormat),
}

/// Encoder candidate that forwards pre-encoded frames
pub struct PassthroughEncoder {
    name: String,
    codec: RtpCodec,
    accepts: Accepts,
}

impl PassthroughEncoder {
    pub fn h264() -> Self {
        Self::video("h264-passthrough", RtpCodec::h264(), PixelFormat::H264)
    }

    pub fn vp8() -> Self {
        Self::video("vp8-passthrough", RtpCodec::vp8(), PixelFormat::Vp8)
    }

    pub fn vp9() -> Self {
        Self::video("vp9-passthrough", RtpCodec::vp9(), PixelFormat::Vp9)
    }

    pub fn opus() -> Self {
        Self {
            name: "opus-passthrough".to_string(),
            codec: RtpCodec::opus(),
            accepts: Accepts::Audio(SampleFormat::Opus),
        }
    }

    fn video(name: &str, codec: RtpCodec, format: PixelFormat) -> Self {
        Self {
            name: name.to_string(),
            codec,
            accepts: Accepts::Video(format),
        }
    }

    fn check_input(&self, props: &MediaProps) -> Result<()> {
        let ok = match (self.accepts, props) {
            (Accepts::Video(expected), MediaProps::Video { format, .. }) => expected == *format,
            (Accepts::Audio(expected), MediaProps::Audio { format, .. }) => expected == *format,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(AppError::EncoderError(format!(
                "input is {}, expected {:?}",
                props, self.accepts
            )))
        }
    }
}

impl EncoderBuilder for PassthroughEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn codec(&self) -> &RtpCodec {
        &self.codec
    }

    fn build(&self, reader: BroadcastReader, props: &MediaProps) -> Result<Box<dyn EncodedReader>> {
        self.check_input(props)?;
        debug!("Starting {} for {}", self.name, props);
        Ok(Box::new(PassthroughReader {
            reader,
            accepts: self.accepts,
            closed: false,
        }))
    }
}

struct PassthroughReader {
    reader: BroadcastReader,
    accepts: Accepts,
    closed: bool,
}

#[async_trait]
impl EncodedReader for PassthroughReader {
    async fn read(&mut self) -> Result<EncodedChunk> {
        if self.closed {
            return Err(AppError::EncoderError("encoder closed".to_string()));
        }
        let frame = self.reader.read().await?;
        let key_frame = is_key_frame(self.accepts, frame.data());
        Ok(EncodedChunk {
            data: frame.data_bytes(),
            key_frame,
        })
    }

    fn controller(&self) -> EncoderController {
        EncoderController::none()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Inspect the bit stream header for a key frame marker
fn is_key_frame(accepts: Accepts, data: &[u8]) -> bool {
    match accepts {
        Accepts::Video(PixelFormat::H264) => annexb_nal_types(data).any(|t| t == 5),
        // VP8 frame tag: bit 0 clear on key frames
        Accepts::Video(PixelFormat::Vp8) => data.first().is_some_and(|b| b & 0x01 == 0),
        // VP9 profile 0-2: show_existing_frame (bit 3) and frame_type (bit 2) both clear
        Accepts::Video(PixelFormat::Vp9) => data.first().is_some_and(|b| b & 0x0C == 0),
        Accepts::Audio(_) => true,
        Accepts::Video(_) => false,
    }
}

/// NAL unit types of every unit in an Annex B buffer
fn annexb_nal_types(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        while i + 3 < data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                let header = data[i + 3];
                i += 3;
                return Some(header & 0x1F);
            }
            i += 1;
        }
        None
    })
}
