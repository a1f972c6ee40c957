use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};
use crate::media::format::Resolution;

// Re-export the WebRTC side of the configuration
pub use crate::webrtc::config::{TurnServer, WebRtcConfig, WhipConfig};

/// Complete publisher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// WHIP endpoint settings
    pub whip: WhipConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Video input settings
    pub video: VideoInputConfig,
    /// Optional audio input settings
    pub audio: AudioInputConfig,
}

impl PublishConfig {
    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.whip.endpoint.trim().is_empty() {
            return Err(AppError::Config("WHIP endpoint is required".to_string()));
        }
        Url::parse(&self.whip.endpoint)
            .map_err(|e| AppError::Config(format!("Invalid WHIP endpoint: {}", e)))?;
        if self.whip.timeout_secs == 0 {
            return Err(AppError::Config("WHIP timeout must be positive".to_string()));
        }

        if self.webrtc.video_codecs.is_empty() {
            return Err(AppError::Config("At least one video codec is required".to_string()));
        }
        if !(200..=1500).contains(&self.webrtc.mtu) {
            return Err(AppError::Config(format!(
                "MTU {} out of range (200-1500)",
                self.webrtc.mtu
            )));
        }

        self.video.validate()?;
        self.audio.validate()?;
        if self.video.is_stdin() && self.audio.is_stdin() {
            return Err(AppError::Config(
                "Video and audio cannot both be read from stdin".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the pre-encoded video input is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// H.264 Annex B byte stream
    H264,
    /// VP8/VP9 in an IVF container
    Ivf,
}

impl std::fmt::Display for InputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputFormat::H264 => write!(f, "h264"),
            InputFormat::Ivf => write!(f, "ivf"),
        }
    }
}

/// Video input configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoInputConfig {
    /// Input path, "-" for stdin
    pub input: String,
    /// Input framing
    pub format: InputFormat,
    /// Frame width, informational for H.264 input
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame rate used to pace file input; 0 reads as fast as possible
    pub fps: u32,
}

impl Default for VideoInputConfig {
    fn default() -> Self {
        Self {
            input: "-".to_string(),
            format: InputFormat::H264,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

impl VideoInputConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Pacing rate, if any
    pub fn pacing(&self) -> Option<u32> {
        (self.fps > 0).then_some(self.fps)
    }

    /// Whether the input is read from stdin
    pub fn is_stdin(&self) -> bool {
        self.input == "-"
    }

    fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            return Err(AppError::Config("Video input path is required".to_string()));
        }
        if self.format == InputFormat::H264 && !self.resolution().is_valid() {
            return Err(AppError::Config(format!(
                "Invalid resolution {}",
                self.resolution()
            )));
        }
        Ok(())
    }
}

/// Audio input configuration (Opus in an Ogg container)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioInputConfig {
    /// Input path, "-" for stdin; no audio track when unset
    pub input: Option<String>,
    /// Release pages at their playback time
    pub realtime: bool,
}

impl Default for AudioInputConfig {
    fn default() -> Self {
        Self {
            input: None,
            realtime: true,
        }
    }
}

impl AudioInputConfig {
    pub fn is_enabled(&self) -> bool {
        self.input.is_some()
    }

    /// Whether the input is read from stdin
    pub fn is_stdin(&self) -> bool {
        self.input.as_deref() == Some("-")
    }

    fn validate(&self) -> Result<()> {
        if self.input.as_deref().is_some_and(|input| input.trim().is_empty()) {
            return Err(AppError::Config("Audio input path is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PublishConfig {
        let mut config = PublishConfig::default();
        config.whip.endpoint = "https://ingest.example.com/whip".to_string();
        config
    }

    #[test]
    fn test_defaults_need_endpoint() {
        assert!(PublishConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_video_input_checks() {
        let mut config = valid();
        config.video.width = 0;
        assert!(config.validate().is_err());

        // IVF carries its own geometry
        config.video.format = InputFormat::Ivf;
        assert!(config.validate().is_ok());

        config.video.input = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_audio_input_checks() {
        let mut config = valid();
        assert!(!config.audio.is_enabled());

        config.audio.input = Some("/tmp/voice.ogg".to_string());
        assert!(config.validate().is_ok());

        // stdin is already taken by the video input
        config.audio.input = Some("-".to_string());
        assert!(config.validate().is_err());

        config.video.input = "/tmp/capture.h264".to_string();
        assert!(config.validate().is_ok());

        config.audio.input = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mtu_bounds() {
        let mut config = valid();
        config.webrtc.mtu = 9000;
        assert!(config.validate().is_err());
    }
}
