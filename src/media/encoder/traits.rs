//! Encoder traits and common types

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::codec::RtpCodec;
use crate::error::Result;
use crate::media::broadcaster::BroadcastReader;
use crate::media::format::MediaProps;

/// One encoded unit (access unit or audio packet)
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Encoded bit stream
    pub data: Bytes,
    /// Whether this chunk starts a decodable picture
    pub key_frame: bool,
}

impl EncodedChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Ask a running encoder for an immediate key frame
pub trait KeyFrameController: Send + Sync {
    fn force_key_frame(&self) -> Result<()>;
}

/// Capabilities an encoder exposes while it runs
#[derive(Clone, Default)]
pub struct EncoderController {
    key_frame: Option<Arc<dyn KeyFrameController>>,
}

impl EncoderController {
    /// Controller without any capability
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_key_frame(controller: Arc<dyn KeyFrameController>) -> Self {
        Self {
            key_frame: Some(controller),
        }
    }

    /// Key-frame capability, if the encoder has one
    pub fn key_frame(&self) -> Option<Arc<dyn KeyFrameController>> {
        self.key_frame.clone()
    }
}

impl std::fmt::Debug for EncoderController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderController")
            .field("key_frame", &self.key_frame.is_some())
            .finish()
    }
}

/// Running encoder pulling raw frames and yielding encoded chunks
#[async_trait]
pub trait EncodedReader: Send {
    /// Wait for the next encoded chunk
    async fn read(&mut self) -> Result<EncodedChunk>;

    fn controller(&self) -> EncoderController;

    /// Release encoder resources. Called at most once per reader.
    fn close(&mut self) -> Result<()>;
}

/// Encoder candidate bound to one wire codec
pub trait EncoderBuilder: Send + Sync {
    /// Human readable name used in negotiation errors
    fn name(&self) -> &str;

    /// Wire codec produced by encoders built here
    fn codec(&self) -> &RtpCodec;

    /// Start an encoder reading from `reader`, whose frames have `props`
    fn build(&self, reader: BroadcastReader, props: &MediaProps) -> Result<Box<dyn EncodedReader>>;
}
