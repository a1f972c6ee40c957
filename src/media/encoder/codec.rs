//! Wire codec identity
//!
//! An [`RtpCodec`] names what goes on the wire for one encoder candidate:
//! MIME type, RTP clock, channel count, preferred payload type and fmtp
//! parameters. It also knows which RTP payloader splits its bit stream.

use rtp::codecs::h264::H264Payloader;
use rtp::codecs::opus::OpusPayloader;
use rtp::codecs::vp8::Vp8Payloader;
use rtp::codecs::vp9::Vp9Payloader;
use rtp::packetizer::Payloader;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::error::{AppError, Result};
use crate::media::format::MediaKind;

/// Codec description used for negotiation and packetization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub payload_type: u8,
    pub sdp_fmtp_line: String,
}

impl RtpCodec {
    /// H.264 constrained baseline, packetization mode 1
    pub fn h264() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            payload_type: 125,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
        }
    }

    pub fn vp8() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            payload_type: 96,
            sdp_fmtp_line: String::new(),
        }
    }

    pub fn vp9() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_VP9.to_string(),
            clock_rate: 90000,
            channels: 0,
            payload_type: 98,
            sdp_fmtp_line: "profile-id=0".to_string(),
        }
    }

    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            payload_type: 111,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        }
    }

    /// Case-insensitive suffix match against a short codec name ("vp8") or
    /// a full MIME type ("video/VP8")
    pub fn matches_name(&self, name: &str) -> bool {
        let mime = self.mime_type.to_lowercase();
        let name = name.trim().to_lowercase();
        !name.is_empty() && mime.ends_with(&name)
    }

    /// Parameters registered with the media engine
    pub fn to_codec_parameters(&self) -> RTCRtpCodecParameters {
        let rtcp_feedback = match self.kind {
            MediaKind::Video => vec![
                RTCPFeedback {
                    typ: "goog-remb".to_owned(),
                    parameter: "".to_owned(),
                },
                RTCPFeedback {
                    typ: "ccm".to_owned(),
                    parameter: "fir".to_owned(),
                },
                RTCPFeedback {
                    typ: "nack".to_owned(),
                    parameter: "".to_owned(),
                },
                RTCPFeedback {
                    typ: "nack".to_owned(),
                    parameter: "pli".to_owned(),
                },
            ],
            MediaKind::Audio => vec![],
        };

        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: self.mime_type.clone(),
                clock_rate: self.clock_rate,
                channels: self.channels,
                sdp_fmtp_line: self.sdp_fmtp_line.clone(),
                rtcp_feedback,
            },
            payload_type: self.payload_type,
            ..Default::default()
        }
    }

    /// Payloader splitting this codec's bit stream into RTP payloads
    pub fn payloader(&self) -> Result<Box<dyn Payloader + Send + Sync>> {
        let mime = self.mime_type.to_lowercase();
        if mime == MIME_TYPE_H264.to_lowercase() {
            Ok(Box::<H264Payloader>::default())
        } else if mime == MIME_TYPE_VP8.to_lowercase() {
            Ok(Box::<Vp8Payloader>::default())
        } else if mime == MIME_TYPE_VP9.to_lowercase() {
            Ok(Box::<Vp9Payloader>::default())
        } else if mime == MIME_TYPE_OPUS.to_lowercase() {
            Ok(Box::<OpusPayloader>::default())
        } else {
            Err(AppError::EncoderError(format!(
                "No RTP payloader for {}",
                self.mime_type
            )))
        }
    }
}

impl std::fmt::Display for RtpCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.mime_type, self.clock_rate)
    }
}
