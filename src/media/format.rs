//! Media kind, pixel/sample format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Map to the WebRTC codec type
    pub fn codec_type(&self) -> RTPCodecType {
        match self {
            MediaKind::Video => RTPCodecType::Video,
            MediaKind::Audio => RTPCodecType::Audio,
        }
    }

    /// MIME type prefix ("video" / "audio")
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_prefix())
    }
}

/// Video frame formats
///
/// Raw formats carry decoded pixels. Compressed formats carry one
/// already-encoded access unit per frame (pre-encoded pipe input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUV420 planar (I420)
    Yuv420,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// H.264 Annex B access unit
    H264,
    /// VP8 frame
    Vp8,
    /// VP9 frame
    Vp9,
}

impl PixelFormat {
    /// Check if frames of this format are already encoded
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::H264 | PixelFormat::Vp8 | PixelFormat::Vp9)
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = (resolution.width * resolution.height) as usize;
        match self {
            PixelFormat::Yuv420 | PixelFormat::Nv12 => Some(pixels * 3 / 2),
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Rgb24 => Some(pixels * 3),
            PixelFormat::H264 | PixelFormat::Vp8 | PixelFormat::Vp9 => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::H264 => "H264",
            PixelFormat::Vp8 => "VP8",
            PixelFormat::Vp9 => "VP9",
        };
        write!(f, "{}", name)
    }
}

/// Audio sample formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Interleaved signed 16-bit little endian PCM
    S16le,
    /// Opus packet
    Opus,
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is valid
    pub fn is_valid(&self) -> bool {
        self.width >= 16 && self.width <= 15360 && self.height >= 16 && self.height <= 8640
    }

    /// Common resolutions
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Format of the frames currently flowing out of a source.
///
/// Encoders are instantiated against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaProps {
    Video {
        resolution: Resolution,
        format: PixelFormat,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
    },
}

impl MediaProps {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaProps::Video { .. } => MediaKind::Video,
            MediaProps::Audio { .. } => MediaKind::Audio,
        }
    }
}

impl fmt::Display for MediaProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaProps::Video { resolution, format } => write!(f, "{} {}", format, resolution),
            MediaProps::Audio {
                sample_rate,
                channels,
                format,
            } => write!(f, "{:?} {}Hz {}ch", format, sample_rate, channels),
        }
    }
}
