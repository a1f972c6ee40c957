//! Raw media frame data structures

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::format::{MediaProps, PixelFormat, Resolution};

/// Hook invoked when the producer may reuse a frame buffer
pub type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Shared frame payload.
///
/// The release hook runs when the last clone of the owning frame is dropped.
struct FrameBuffer {
    data: Bytes,
    release: Option<ReleaseFn>,
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A raw (or pre-encoded) media frame with metadata
///
/// Cloning is cheap and shares the underlying buffer.
#[derive(Clone)]
pub struct MediaFrame {
    buffer: Arc<FrameBuffer>,
    /// Format of the payload
    pub props: MediaProps,
    /// Frame sequence number assigned by the source
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl MediaFrame {
    /// Create a new frame
    pub fn new(data: Bytes, props: MediaProps, sequence: u64) -> Self {
        Self {
            buffer: Arc::new(FrameBuffer {
                data,
                release: None,
            }),
            props,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Create a video frame
    pub fn video(data: Bytes, resolution: Resolution, format: PixelFormat, sequence: u64) -> Self {
        Self::new(data, MediaProps::Video { resolution, format }, sequence)
    }

    /// Attach a release hook, fired once every holder has dropped the frame
    pub fn with_release(data: Bytes, props: MediaProps, sequence: u64, release: ReleaseFn) -> Self {
        Self {
            buffer: Arc::new(FrameBuffer {
                data,
                release: Some(release),
            }),
            props,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.buffer.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.buffer.data.clone()
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.buffer.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.data.is_empty()
    }

    /// Independent copy of this frame.
    ///
    /// The copy owns its own buffer and carries no release hook, so the
    /// producer's buffer is not held by whoever keeps the copy.
    pub fn deep_copy(&self) -> Self {
        Self {
            buffer: Arc::new(FrameBuffer {
                data: Bytes::copy_from_slice(&self.buffer.data),
                release: None,
            }),
            props: self.props,
            sequence: self.sequence,
            capture_ts: self.capture_ts,
        }
    }

    /// Get age of this frame (time since capture)
    pub fn age(&self) -> std::time::Duration {
        self.capture_ts.elapsed()
    }
}

impl fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaFrame")
            .field("props", &self.props)
            .field("sequence", &self.sequence)
            .field("len", &self.len())
            .finish()
    }
}
