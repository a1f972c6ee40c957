//! Single-slot frame fan-out
//!
//! One pull loop reads the upstream [`FrameSource`] and publishes each frame
//! into a `watch` slot. Every [`BroadcastReader`] waits on that slot
//! independently, so a slow reader skips frames instead of holding up the
//! source or other readers.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::format::MediaProps;
use super::frame::MediaFrame;
use super::source::FrameSource;
use crate::error::{AppError, Result};

/// Content of the shared slot
#[derive(Clone)]
enum Slot {
    /// Nothing produced yet
    Empty,
    /// Latest frame
    Frame(MediaFrame),
    /// Upstream failed; terminal
    Failed(Arc<str>),
}

/// Fan-out of one frame source to any number of readers
pub struct Broadcaster {
    rx: watch::Receiver<Slot>,
    task: JoinHandle<()>,
}

impl Broadcaster {
    /// Take ownership of `source` and start pulling from it
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        let (tx, rx) = watch::channel(Slot::Empty);
        let task = tokio::spawn(pull_loop(source, tx));
        Self { rx, task }
    }

    /// Create an independent reader.
    ///
    /// With `copy_frames` every read returns a deep copy the caller may keep
    /// without pinning the producer's buffer.
    pub fn new_reader(&self, copy_frames: bool) -> BroadcastReader {
        BroadcastReader {
            rx: self.rx.clone(),
            first: true,
            copy_frames,
        }
    }

    /// Read one frame through a fresh reader and report its format
    pub async fn current_props(&self) -> Result<MediaProps> {
        let frame = self.new_reader(false).read().await?;
        Ok(frame.props)
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pull_loop(mut source: Box<dyn FrameSource>, tx: watch::Sender<Slot>) {
    info!("Broadcaster pull loop started");
    let mut produced: u64 = 0;

    loop {
        match source.read().await {
            Ok(frame) => {
                produced += 1;
                trace!(
                    "Publishing frame {} ({} bytes, {:?} since capture)",
                    frame.sequence,
                    frame.len(),
                    frame.age()
                );
                tx.send_replace(Slot::Frame(frame));
            }
            Err(e) => {
                warn!("Frame source failed after {} frames: {}", produced, e);
                tx.send_replace(Slot::Failed(Arc::from(e.to_string())));
                break;
            }
        }
    }

    debug!("Broadcaster pull loop stopped");
}

/// One consumer's view of a [`Broadcaster`]
pub struct BroadcastReader {
    rx: watch::Receiver<Slot>,
    first: bool,
    copy_frames: bool,
}

impl BroadcastReader {
    /// Wait for a frame this reader has not seen yet.
    ///
    /// The first call returns the frame already buffered, if any.
    pub async fn read(&mut self) -> Result<MediaFrame> {
        if self.first {
            self.first = false;
            let slot = self.rx.borrow_and_update().clone();
            if let Some(result) = self.resolve(slot) {
                return result;
            }
        }

        loop {
            if self.rx.changed().await.is_err() {
                // Producer gone; a stored failure still wins over "closed"
                let slot = self.rx.borrow().clone();
                return match slot {
                    Slot::Failed(reason) => Err(AppError::SourceError(reason.to_string())),
                    _ => Err(AppError::BroadcasterClosed),
                };
            }

            let slot = self.rx.borrow_and_update().clone();
            if let Some(result) = self.resolve(slot) {
                return result;
            }
        }
    }

    fn resolve(&self, slot: Slot) -> Option<Result<MediaFrame>> {
        match slot {
            Slot::Empty => None,
            Slot::Frame(frame) if self.copy_frames => Some(Ok(frame.deep_copy())),
            Slot::Frame(frame) => Some(Ok(frame)),
            Slot::Failed(reason) => Some(Err(AppError::SourceError(reason.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::format::{PixelFormat, Resolution};
    use crate::media::source::ChannelSource;
    use bytes::Bytes;

    fn frame(sequence: u64) -> MediaFrame {
        MediaFrame::video(
            Bytes::from(vec![sequence as u8; 8]),
            Resolution::new(16, 16),
            PixelFormat::Yuv420,
            sequence,
        )
    }

    #[tokio::test]
    async fn test_readers_see_every_frame_in_order() {
        let (tx, source) = ChannelSource::new(1);
        let broadcaster = Broadcaster::new(Box::new(source));
        let mut readers: Vec<_> = (0..4).map(|_| broadcaster.new_reader(false)).collect();

        for sequence in 1..=5 {
            tx.send(Ok(frame(sequence))).await.unwrap();
            for reader in readers.iter_mut() {
                let got = reader.read().await.unwrap();
                assert_eq!(got.sequence, sequence);
            }
        }
    }

    #[tokio::test]
    async fn test_late_reader_gets_buffered_frame() {
        let (tx, source) = ChannelSource::new(1);
        let broadcaster = Broadcaster::new(Box::new(source));

        let mut early = broadcaster.new_reader(false);
        tx.send(Ok(frame(1))).await.unwrap();
        assert_eq!(early.read().await.unwrap().sequence, 1);

        let mut late = broadcaster.new_reader(false);
        assert_eq!(late.read().await.unwrap().sequence, 1);

        tx.send(Ok(frame(2))).await.unwrap();
        assert_eq!(late.read().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_slow_reader_skips_but_never_repeats() {
        let (tx, source) = ChannelSource::new(4);
        let broadcaster = Broadcaster::new(Box::new(source));
        let mut reader = broadcaster.new_reader(false);
        let mut watcher = broadcaster.new_reader(false);

        for sequence in 1..=3 {
            tx.send(Ok(frame(sequence))).await.unwrap();
        }
        // Wait until the last frame has landed in the slot
        loop {
            if watcher.read().await.unwrap().sequence == 3 {
                break;
            }
        }

        assert_eq!(reader.read().await.unwrap().sequence, 3);

        tx.send(Ok(frame(4))).await.unwrap();
        assert_eq!(reader.read().await.unwrap().sequence, 4);
    }

    #[tokio::test]
    async fn test_source_error_reaches_all_readers() {
        let (tx, source) = ChannelSource::new(1);
        let broadcaster = Broadcaster::new(Box::new(source));
        let mut before = broadcaster.new_reader(false);

        tx.send(Err(AppError::SourceError("camera unplugged".to_string())))
            .await
            .unwrap();

        let err = before.read().await.unwrap_err();
        assert!(err.to_string().contains("camera unplugged"));

        let mut after = broadcaster.new_reader(false);
        let err = after.read().await.unwrap_err();
        assert!(matches!(err, AppError::SourceError(_)));
        // Stays failed
        assert!(after.read().await.is_err());
    }

    #[tokio::test]
    async fn test_copy_reader_and_props() {
        let (tx, source) = ChannelSource::new(1);
        let broadcaster = Broadcaster::new(Box::new(source));
        tx.send(Ok(frame(1))).await.unwrap();

        let props = broadcaster.current_props().await.unwrap();
        assert_eq!(
            props,
            MediaProps::Video {
                resolution: Resolution::new(16, 16),
                format: PixelFormat::Yuv420
            }
        );

        let mut copying = broadcaster.new_reader(true);
        let copy = copying.read().await.unwrap();
        assert_eq!(copy.data(), &[1u8; 8]);
    }
}
