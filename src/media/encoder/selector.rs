//! Codec negotiation against the registered encoder candidates

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::MediaEngine;

use super::codec::RtpCodec;
use super::traits::{EncodedReader, EncoderBuilder};
use crate::error::{AppError, Result};
use crate::media::broadcaster::Broadcaster;
use crate::media::format::{MediaKind, MediaProps};

/// Ordered encoder candidates per media kind
#[derive(Default, Clone)]
pub struct CodecSelector {
    video: Vec<Arc<dyn EncoderBuilder>>,
    audio: Vec<Arc<dyn EncoderBuilder>>,
}

impl CodecSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate; the media kind comes from its codec
    pub fn register(&mut self, builder: Arc<dyn EncoderBuilder>) {
        debug!(
            "Registered encoder candidate {} ({})",
            builder.name(),
            builder.codec()
        );
        match builder.codec().kind {
            MediaKind::Video => self.video.push(builder),
            MediaKind::Audio => self.audio.push(builder),
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, builder: Arc<dyn EncoderBuilder>) -> Self {
        self.register(builder);
        self
    }

    pub fn candidates(&self, kind: MediaKind) -> &[Arc<dyn EncoderBuilder>] {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }

    /// Register every candidate's codec with the media engine, so offers
    /// advertise only what can actually be produced
    pub fn register_codecs(&self, media_engine: &mut MediaEngine) -> Result<()> {
        let mut seen = HashSet::new();
        for builder in self.video.iter().chain(self.audio.iter()) {
            let codec = builder.codec();
            if !seen.insert((codec.kind, codec.payload_type)) {
                continue;
            }
            media_engine
                .register_codec(codec.to_codec_parameters(), codec.kind.codec_type())
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to register {}: {}", codec, e))
                })?;
            info!("Registered codec {} (pt {})", codec, codec.payload_type);
        }
        Ok(())
    }

    /// Build the first encoder matching `names`, in caller order.
    ///
    /// Names are matched case-insensitively as suffixes of the candidate
    /// MIME type. Each attempt gets a fresh reader from `broadcaster`,
    /// deep-copying frames when `copy_frames` is set.
    pub fn select_by_names<S: AsRef<str>>(
        &self,
        kind: MediaKind,
        names: &[S],
        broadcaster: &Broadcaster,
        props: &MediaProps,
        copy_frames: bool,
    ) -> Result<(Box<dyn EncodedReader>, RtpCodec)> {
        let candidates = self.candidates(kind);
        let mut reasons = Vec::new();

        for name in names {
            let name = name.as_ref();
            let mut matched = false;

            for builder in candidates.iter().filter(|b| b.codec().matches_name(name)) {
                matched = true;
                match builder.build(broadcaster.new_reader(copy_frames), props) {
                    Ok(reader) => {
                        info!(
                            "Selected {} encoder {} for {}",
                            kind,
                            builder.name(),
                            builder.codec()
                        );
                        return Ok((reader, builder.codec().clone()));
                    }
                    Err(e) => {
                        debug!("Encoder {} rejected {}: {}", builder.name(), name, e);
                        reasons.push(format!(
                            "{} ({} {}): {}",
                            name,
                            builder.name(),
                            builder.codec().mime_type,
                            e
                        ));
                    }
                }
            }

            if !matched {
                reasons.push(format!("{}: no {} encoder registered", name, kind));
            }
        }

        if names.is_empty() {
            reasons.push(format!("no {} codec requested", kind));
        }

        Err(AppError::Negotiation(reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::encoder::passthrough::PassthroughEncoder;
    use crate::media::format::{PixelFormat, Resolution};
    use crate::media::source::ChannelSource;

    fn h264_props() -> MediaProps {
        MediaProps::Video {
            resolution: Resolution::VGA,
            format: PixelFormat::H264,
        }
    }

    fn broadcaster() -> Broadcaster {
        let (_tx, source) = ChannelSource::new(1);
        Broadcaster::new(Box::new(source))
    }

    #[tokio::test]
    async fn test_falls_through_to_later_name() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let broadcaster = broadcaster();

        let (_reader, codec) = selector
            .select_by_names(MediaKind::Video, &["vp8", "h264"], &broadcaster, &h264_props(), false)
            .unwrap();
        assert_eq!(codec, RtpCodec::h264());
    }

    #[tokio::test]
    async fn test_unmatched_name_is_reported() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let broadcaster = broadcaster();

        let err = selector
            .select_by_names(MediaKind::Video, &["vp8"], &broadcaster, &h264_props(), false)
            .err()
            .unwrap();
        match &err {
            AppError::Negotiation(reasons) => {
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("vp8"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_aggregates_build_failures() {
        let selector = CodecSelector::new()
            .with(Arc::new(PassthroughEncoder::vp8()))
            .with(Arc::new(PassthroughEncoder::h264()));
        let broadcaster = broadcaster();
        let raw = MediaProps::Video {
            resolution: Resolution::VGA,
            format: PixelFormat::Nv12,
        };

        let err = selector
            .select_by_names(MediaKind::Video, &["video/VP8", "H264", "vp9"], &broadcaster, &raw, false)
            .err()
            .unwrap();
        let message = err.to_string();
        assert!(message.contains("vp8-passthrough"));
        assert!(message.contains("h264-passthrough"));
        assert!(message.contains("vp9: no video encoder registered"));
    }

    #[tokio::test]
    async fn test_kind_is_respected() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::opus()));
        assert!(selector.candidates(MediaKind::Video).is_empty());
        assert_eq!(selector.candidates(MediaKind::Audio).len(), 1);

        let broadcaster = broadcaster();
        let result =
            selector.select_by_names(MediaKind::Video, &["opus"], &broadcaster, &h264_props(), false);
        assert!(matches!(result, Err(AppError::Negotiation(_))));
    }

    #[test]
    fn test_register_codecs() {
        let selector = CodecSelector::new()
            .with(Arc::new(PassthroughEncoder::vp8()))
            .with(Arc::new(PassthroughEncoder::h264()))
            .with(Arc::new(PassthroughEncoder::opus()));
        let mut media_engine = MediaEngine::default();
        selector.register_codecs(&mut media_engine).unwrap();
    }
}
