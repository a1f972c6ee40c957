//! Frame sources
//!
//! A [`FrameSource`] is the pull-based upstream of a broadcaster. Provided
//! implementations:
//! - [`RawPipeSource`]: fixed-geometry raw frames from any async byte stream
//! - [`AnnexBSource`]: pre-encoded H.264 access units
//! - [`IvfSource`]: pre-encoded VP8/VP9 frames from an IVF container
//! - [`OggSource`]: pre-encoded Opus pages from an Ogg container
//! - [`TestPatternSource`]: synthetic moving gradient
//! - [`ChannelSource`]: frames pushed by the application

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::io::ogg_reader::OggReader;

use super::format::{MediaProps, PixelFormat, Resolution, SampleFormat};
use super::frame::MediaFrame;
use crate::error::{AppError, Result};

/// Annex B start code prepended to every NAL unit we emit
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Buffer capacity handed to the H.264 NAL reader
const H264_READER_CAPACITY: usize = 1024 * 1024;

/// Frames buffered between a blocking reader thread and the async side
const READER_QUEUE: usize = 4;

/// Opus granule positions always count 48 kHz samples
const OPUS_CLOCK_RATE: u32 = 48000;

/// Pull-based producer of frames
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for and return the next frame
    async fn read(&mut self) -> Result<MediaFrame>;
}

/// Optional fixed-rate pacing for sources that can produce faster than real time
struct Pacer {
    interval: Option<Interval>,
}

impl Pacer {
    fn new(fps: Option<u32>) -> Self {
        let interval = fps.filter(|fps| *fps > 0).map(|fps| {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / fps as f64));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    async fn wait(&mut self) {
        if let Some(interval) = self.interval.as_mut() {
            interval.tick().await;
        }
    }
}

/// Reads fixed-size raw frames from a byte stream (stdin, named pipe, file).
///
/// The stream carries no framing, so geometry and pixel format must be
/// supplied by the caller.
pub struct RawPipeSource<R> {
    reader: R,
    resolution: Resolution,
    format: PixelFormat,
    frame_size: usize,
    sequence: u64,
    pacer: Pacer,
}

impl<R: AsyncRead + Unpin + Send> RawPipeSource<R> {
    pub fn new(reader: R, resolution: Resolution, format: PixelFormat, fps: Option<u32>) -> Result<Self> {
        if !resolution.is_valid() {
            return Err(AppError::Config(format!("Invalid resolution: {}", resolution)));
        }
        let frame_size = format.frame_size(resolution).ok_or_else(|| {
            AppError::Config(format!("{} is not a raw pixel format", format))
        })?;

        info!(
            "Raw pipe source: {} {} ({} bytes per frame)",
            format, resolution, frame_size
        );

        Ok(Self {
            reader,
            resolution,
            format,
            frame_size,
            sequence: 0,
            pacer: Pacer::new(fps),
        })
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for RawPipeSource<R> {
    async fn read(&mut self) -> Result<MediaFrame> {
        self.pacer.wait().await;

        let mut buf = vec![0u8; self.frame_size];
        self.reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AppError::SourceError("input stream ended".to_string())
            } else {
                AppError::Io(e)
            }
        })?;

        self.sequence += 1;
        Ok(MediaFrame::video(
            Bytes::from(buf),
            self.resolution,
            self.format,
            self.sequence,
        ))
    }
}

/// Receives items produced by a blocking reader thread
struct ThreadedReader<T = MediaFrame> {
    rx: mpsc::Receiver<Result<T>>,
    pacer: Pacer,
}

impl<T: Send + 'static> ThreadedReader<T> {
    fn spawn<F>(fps: Option<u32>, produce: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<T>>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(READER_QUEUE);
        tokio::task::spawn_blocking(move || produce(tx));
        Self {
            rx,
            pacer: Pacer::new(fps),
        }
    }

    async fn read(&mut self) -> Result<T> {
        self.pacer.wait().await;
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(AppError::SourceError("input stream ended".to_string())),
        }
    }
}

/// Frames pushed by the application through a channel
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<MediaFrame>>,
}

impl ChannelSource {
    /// Create the source together with its sending half
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<MediaFrame>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn read(&mut self) -> Result<MediaFrame> {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| Err(AppError::SourceError("frame channel closed".to_string())))
    }
}

/// Pre-encoded H.264 (Annex B) input, one access unit per frame
pub struct AnnexBSource {
    inner: ThreadedReader,
}

impl AnnexBSource {
    /// `resolution` is informational; the bit stream is passed through untouched
    pub fn new<R: Read + Send + 'static>(reader: R, resolution: Resolution, fps: Option<u32>) -> Self {
        let inner = ThreadedReader::spawn(fps, move |tx| {
            read_access_units(reader, resolution, tx);
        });
        Self { inner }
    }
}

#[async_trait]
impl FrameSource for AnnexBSource {
    async fn read(&mut self) -> Result<MediaFrame> {
        self.inner.read().await
    }
}

fn is_vcl(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}

/// Group NAL units into access units and forward them until the stream ends
fn read_access_units<R: Read>(
    reader: R,
    resolution: Resolution,
    tx: mpsc::Sender<Result<MediaFrame>>,
) {
    let mut h264_reader = H264Reader::new(reader, H264_READER_CAPACITY);
    let mut access_unit = BytesMut::new();
    let mut has_vcl = false;
    let mut sequence = 0u64;

    let flush = |access_unit: &mut BytesMut, sequence: &mut u64| -> bool {
        if access_unit.is_empty() {
            return true;
        }
        *sequence += 1;
        let frame = MediaFrame::video(
            access_unit.split().freeze(),
            resolution,
            PixelFormat::H264,
            *sequence,
        );
        tx.blocking_send(Ok(frame)).is_ok()
    };

    loop {
        let nal = match h264_reader.next_nal() {
            Ok(nal) => nal,
            Err(e) => {
                flush(&mut access_unit, &mut sequence);
                debug!("H.264 reader stopped: {}", e);
                let _ = tx.blocking_send(Err(AppError::SourceError(format!(
                    "H.264 input ended: {}",
                    e
                ))));
                return;
            }
        };

        let Some(&header) = nal.data.first() else {
            continue;
        };
        let nal_type = header & 0x1F;

        // A new access unit starts with a non-VCL prefix NAL or with the
        // first slice (first_mb_in_slice == 0) of the next picture.
        let first_slice = is_vcl(nal_type) && nal.data.get(1).is_some_and(|b| b & 0x80 != 0);
        let starts_unit = matches!(nal_type, 6..=9) || first_slice;
        if has_vcl && starts_unit {
            if !flush(&mut access_unit, &mut sequence) {
                return;
            }
            has_vcl = false;
        }

        access_unit.put_slice(&START_CODE);
        access_unit.put_slice(&nal.data);
        has_vcl |= is_vcl(nal_type);
    }
}

/// Pre-encoded VP8/VP9 input from an IVF container
pub struct IvfSource {
    inner: ThreadedReader,
}

impl IvfSource {
    pub fn new<R: Read + Send + 'static>(reader: R, fps: Option<u32>) -> Self {
        let inner = ThreadedReader::spawn(fps, move |tx| read_ivf_frames(reader, tx));
        Self { inner }
    }
}

#[async_trait]
impl FrameSource for IvfSource {
    async fn read(&mut self) -> Result<MediaFrame> {
        self.inner.read().await
    }
}

fn read_ivf_frames<R: Read>(reader: R, tx: mpsc::Sender<Result<MediaFrame>>) {
    let (mut ivf, header) = match IVFReader::new(reader) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = tx.blocking_send(Err(AppError::SourceError(format!(
                "Invalid IVF header: {}",
                e
            ))));
            return;
        }
    };

    let format = match &header.four_cc {
        b"VP80" => PixelFormat::Vp8,
        b"VP90" => PixelFormat::Vp9,
        other => {
            let _ = tx.blocking_send(Err(AppError::SourceError(format!(
                "Unsupported IVF codec: {}",
                String::from_utf8_lossy(other)
            ))));
            return;
        }
    };
    let resolution = Resolution::new(header.width as u32, header.height as u32);
    info!("IVF source: {} {}", format, resolution);

    let mut sequence = 0u64;
    loop {
        match ivf.parse_next_frame() {
            Ok((data, _frame_header)) => {
                sequence += 1;
                let frame = MediaFrame::video(data.freeze(), resolution, format, sequence);
                if tx.blocking_send(Ok(frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(AppError::SourceError(format!(
                    "IVF input ended: {}",
                    e
                ))));
                return;
            }
        }
    }
}

/// Pre-encoded Opus input from an Ogg container, one page per frame.
///
/// With `realtime` set, pages are released on the schedule given by their
/// granule positions.
pub struct OggSource {
    inner: ThreadedReader<(MediaFrame, u64)>,
    realtime: bool,
    started: Option<Instant>,
    last_granule: u64,
}

impl OggSource {
    pub fn new<R: Read + Send + 'static>(reader: R, realtime: bool) -> Self {
        let inner = ThreadedReader::spawn(None, move |tx| read_ogg_pages(reader, tx));
        Self {
            inner,
            realtime,
            started: None,
            last_granule: 0,
        }
    }
}

#[async_trait]
impl FrameSource for OggSource {
    async fn read(&mut self) -> Result<MediaFrame> {
        let (frame, granule) = self.inner.read().await?;
        if self.realtime {
            // A page plays from the end of the previous one
            let started = *self.started.get_or_insert_with(Instant::now);
            let offset = Duration::from_secs_f64(self.last_granule as f64 / OPUS_CLOCK_RATE as f64);
            tokio::time::sleep_until(started + offset).await;
        }
        self.last_granule = granule;
        Ok(frame)
    }
}

fn read_ogg_pages<R: Read>(reader: R, tx: mpsc::Sender<Result<(MediaFrame, u64)>>) {
    let (mut ogg, header) = match OggReader::new(reader, true) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = tx.blocking_send(Err(AppError::SourceError(format!(
                "Invalid Ogg/Opus header: {}",
                e
            ))));
            return;
        }
    };

    let props = MediaProps::Audio {
        sample_rate: OPUS_CLOCK_RATE,
        channels: header.channels as u16,
        format: SampleFormat::Opus,
    };
    info!(
        "Ogg source: Opus {}ch (input rate {} Hz)",
        header.channels, header.sample_rate
    );

    let mut sequence = 0u64;
    loop {
        match ogg.parse_next_page() {
            Ok((data, page_header)) => {
                // Comment header carries no audio
                if data.starts_with(b"OpusTags") {
                    continue;
                }
                sequence += 1;
                let frame = MediaFrame::new(data.freeze(), props, sequence);
                if tx
                    .blocking_send(Ok((frame, page_header.granule_position)))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(AppError::SourceError(format!(
                    "Ogg input ended: {}",
                    e
                ))));
                return;
            }
        }
    }
}

/// Synthetic I420 frames with a moving luma gradient
pub struct TestPatternSource {
    resolution: Resolution,
    sequence: u64,
    pacer: Pacer,
}

impl TestPatternSource {
    pub fn new(resolution: Resolution, fps: u32) -> Self {
        Self {
            resolution,
            sequence: 0,
            pacer: Pacer::new(Some(fps)),
        }
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn read(&mut self) -> Result<MediaFrame> {
        self.pacer.wait().await;

        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let luma_size = width * height;
        let mut buf = BytesMut::with_capacity(luma_size * 3 / 2);

        let offset = self.sequence as usize;
        for y in 0..height {
            for x in 0..width {
                buf.put_u8(((x + y + offset) & 0xFF) as u8);
            }
        }
        // Neutral chroma
        buf.put_bytes(128, luma_size / 2);

        self.sequence += 1;
        Ok(MediaFrame::video(
            buf.freeze(),
            self.resolution,
            PixelFormat::Yuv420,
            self.sequence,
        ))
    }
}
