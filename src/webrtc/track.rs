//! Media track with per-peer bindings
//!
//! A [`Track`] owns one [`Broadcaster`] and serves any number of bindings.
//! Each binding runs its own encoder, packetizer and forwarding task, so a
//! slow or failing peer never affects the others.
//!
//! Binding lifecycle:
//! ```text
//! bind ──> register control channel ──> negotiate codec ──> spawn forwarder
//!                                                               │
//!   unbind ── send ack channel ──> forwarder stops ─────────────┤
//!   encoder/write failure ──────> forwarder stops ──────────────┤
//!                                                               v
//!                      cleanup: stop feedback, close encoder, drop entry, ack
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use super::binding::{BindingContext, FeedbackReader, PacketWriter};
use super::config::DEFAULT_MTU;
use super::packetizer::{ErrorSink, RtpPacketReader};
use crate::error::{AppError, Result};
use crate::media::broadcaster::Broadcaster;
use crate::media::encoder::{CodecSelector, KeyFrameController};
use crate::media::format::MediaKind;
use crate::media::source::FrameSource;

/// Acknowledgement a waiting unbind receives once cleanup is done
type Ack = oneshot::Sender<()>;

/// Callback fired once when the track ends with an error
type EndedHandler = Box<dyn FnOnce(Arc<AppError>) + Send>;

/// Track configuration
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Track ID
    pub track_id: String,
    /// Stream ID
    pub stream_id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Maximum RTP packet size
    pub mtu: usize,
    /// Give every binding its own copy of each frame
    pub copy_frames: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            track_id: "video0".to_string(),
            stream_id: "whip-ingest".to_string(),
            kind: MediaKind::Video,
            mtu: DEFAULT_MTU,
            copy_frames: false,
        }
    }
}

/// Track statistics
#[derive(Debug, Clone, Default)]
pub struct TrackStats {
    /// RTP packets written
    pub packets_sent: u64,
    /// RTP payload bytes written
    pub bytes_sent: u64,
    /// Encoded key frames sent
    pub key_frames_sent: u64,
    /// Key frames forced on receiver request
    pub key_frames_requested: u64,
    /// Bindings currently served
    pub active_bindings: usize,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    key_frames_sent: AtomicU64,
    key_frames_requested: AtomicU64,
}

/// Registered binding
struct BindingEntry {
    /// Distinguishes successive bindings that reuse an id
    generation: u64,
    control: oneshot::Sender<Ack>,
}

/// Everything guarded by the track lock
#[derive(Default)]
struct TrackState {
    bindings: HashMap<String, BindingEntry>,
    next_generation: u64,
    error: Option<Arc<AppError>>,
    handler: Option<EndedHandler>,
    fired: bool,
}

struct TrackShared {
    config: TrackConfig,
    broadcaster: Broadcaster,
    selector: Arc<CodecSelector>,
    state: Mutex<TrackState>,
    counters: Counters,
}

/// Media track shared by all peer bindings. Cloning is cheap.
#[derive(Clone)]
pub struct Track {
    shared: Arc<TrackShared>,
}

impl Track {
    /// Create a track pulling from `source`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: TrackConfig, source: Box<dyn FrameSource>, selector: Arc<CodecSelector>) -> Self {
        info!(
            "Creating {} track {} (stream {})",
            config.kind, config.track_id, config.stream_id
        );
        Self {
            shared: Arc::new(TrackShared {
                config,
                broadcaster: Broadcaster::new(source),
                selector,
                state: Mutex::new(TrackState::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.config.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.shared.config.stream_id
    }

    pub fn kind(&self) -> MediaKind {
        self.shared.config.kind
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.shared.broadcaster
    }

    /// Last error reported by any binding
    pub fn error(&self) -> Option<Arc<AppError>> {
        self.shared.state.lock().error.clone()
    }

    pub fn stats(&self) -> TrackStats {
        let counters = &self.shared.counters;
        TrackStats {
            packets_sent: counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            key_frames_sent: counters.key_frames_sent.load(Ordering::Relaxed),
            key_frames_requested: counters.key_frames_requested.load(Ordering::Relaxed),
            active_bindings: self.shared.state.lock().bindings.len(),
        }
    }

    /// Register the handler fired when the track ends with an error.
    ///
    /// Fires immediately if an error is already stored. The handler runs at
    /// most once over the lifetime of the track; a later registration
    /// replaces one that has not fired yet.
    pub fn on_ended<F>(&self, handler: F)
    where
        F: FnOnce(Arc<AppError>) + Send + 'static,
    {
        let err = {
            let mut state = self.shared.state.lock();
            if state.fired {
                return;
            }
            match state.error.clone() {
                Some(err) => {
                    state.fired = true;
                    err
                }
                None => {
                    state.handler = Some(Box::new(handler));
                    return;
                }
            }
        };

        handler(err);
    }

    /// Attach a new peer binding and return the codec chosen for it
    pub async fn bind(&self, ctx: &dyn BindingContext) -> Result<RTCRtpCodecParameters> {
        let binding_id = ctx.binding_id();
        let (control_tx, control_rx) = oneshot::channel();

        let generation = {
            let mut state = self.shared.state.lock();
            if state.bindings.contains_key(&binding_id) {
                return Err(AppError::BindingError(format!(
                    "binding {} already exists on track {}",
                    binding_id,
                    self.id()
                )));
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.bindings.insert(
                binding_id.clone(),
                BindingEntry {
                    generation,
                    control: control_tx,
                },
            );
            generation
        };

        match self.negotiate(ctx).await {
            Ok((reader, writer, params)) => {
                let controller = reader.controller();
                let token = CancellationToken::new();
                let feedback = match (controller.key_frame(), ctx.feedback_reader()) {
                    (Some(key_frame), Some(feedback)) => Some(tokio::spawn(listen_feedback(
                        self.shared.clone(),
                        binding_id.clone(),
                        feedback,
                        key_frame,
                        token.clone(),
                    ))),
                    _ => None,
                };

                info!(
                    "Bound {} to track {} with {} (pt {})",
                    binding_id,
                    self.id(),
                    params.capability.mime_type,
                    params.payload_type
                );

                tokio::spawn(forward(
                    self.shared.clone(),
                    binding_id,
                    generation,
                    reader,
                    writer,
                    control_rx,
                    feedback,
                    token,
                ));
                Ok(params)
            }
            Err(e) => {
                self.shared.remove_binding(&binding_id, generation);
                warn!("Failed to bind {} to track {}: {}", binding_id, self.id(), e);
                Err(e)
            }
        }
    }

    /// Pick the first remote codec one of our encoders can produce
    async fn negotiate(
        &self,
        ctx: &dyn BindingContext,
    ) -> Result<(RtpPacketReader, Arc<dyn PacketWriter>, RTCRtpCodecParameters)> {
        let writer = ctx
            .packet_writer()
            .ok_or_else(|| AppError::BindingError("transport provided no packet writer".to_string()))?;
        let props = self.shared.broadcaster.current_props().await?;
        let kind = self.kind();
        let mut reasons = Vec::new();

        for params in ctx.codec_parameters() {
            let name = params.capability.mime_type.clone();
            let selected = self.shared.selector.select_by_names(
                kind,
                &[name.as_str()],
                &self.shared.broadcaster,
                &props,
                self.shared.config.copy_frames,
            );

            match selected {
                Ok((encoder, codec)) => {
                    let reader = RtpPacketReader::new(
                        encoder,
                        codec,
                        params.payload_type,
                        ctx.ssrc(),
                        self.shared.config.mtu,
                        self.error_sink(),
                    )?;
                    return Ok((reader, writer, params));
                }
                Err(AppError::Negotiation(mut more)) => reasons.append(&mut more),
                Err(e) => reasons.push(format!("{}: {}", name, e)),
            }
        }

        if reasons.is_empty() {
            reasons.push(format!("remote offered no {} codecs", kind));
        }
        Err(AppError::Negotiation(reasons))
    }

    fn error_sink(&self) -> ErrorSink {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |err| {
            if let Some(shared) = shared.upgrade() {
                shared.report_error(err);
            }
        })
    }

    /// Detach a binding and wait until its resources are released.
    ///
    /// Unknown ids succeed without doing anything.
    pub async fn unbind(&self, binding_id: &str) -> Result<()> {
        let entry = self.shared.state.lock().bindings.remove(binding_id);
        let Some(entry) = entry else {
            debug!("Unbind of unknown binding {} on track {}", binding_id, self.id());
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if entry.control.send(ack_tx).is_err() {
            // Forwarder already finished its cleanup
            return Ok(());
        }

        // A dropped ack also means cleanup completed
        let _ = ack_rx.await;
        info!("Unbound {} from track {}", binding_id, self.id());
        Ok(())
    }
}

impl TrackShared {
    /// Remove a map entry, but only the one registered under `generation`
    fn remove_binding(&self, binding_id: &str, generation: u64) {
        let mut state = self.state.lock();
        if state
            .bindings
            .get(binding_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.bindings.remove(binding_id);
        }
    }

    fn report_error(&self, err: AppError) {
        let err = Arc::new(err);
        let handler = {
            let mut state = self.state.lock();
            state.error = Some(err.clone());
            if state.fired {
                None
            } else {
                let handler = state.handler.take();
                if handler.is_some() {
                    state.fired = true;
                }
                handler
            }
        };

        if let Some(handler) = handler {
            handler(err);
        }
    }
}

/// Forward packets of one binding until stopped, then clean up
#[allow(clippy::too_many_arguments)]
async fn forward(
    shared: Arc<TrackShared>,
    binding_id: String,
    generation: u64,
    mut reader: RtpPacketReader,
    writer: Arc<dyn PacketWriter>,
    mut control_rx: oneshot::Receiver<Ack>,
    feedback: Option<JoinHandle<()>>,
    token: CancellationToken,
) {
    let mut stopped: Option<Ack> = None;

    'forward: loop {
        tokio::select! {
            biased;

            control = &mut control_rx => {
                stopped = control.ok();
                break 'forward;
            }

            batch = reader.read() => {
                // The reader has already reported its own failure
                let Ok(batch) = batch else {
                    break 'forward;
                };

                for packet in &batch.packets {
                    if let Err(e) = writer.write_rtp(packet).await {
                        warn!("RTP write failed for binding {}: {}", binding_id, e);
                        let err = match e {
                            AppError::Transport(_) => e,
                            other => AppError::Transport(other.to_string()),
                        };
                        shared.report_error(err);
                        break 'forward;
                    }
                    shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    shared
                        .counters
                        .bytes_sent
                        .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                }
                if batch.key_frame {
                    shared.counters.key_frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    token.cancel();
    if let Some(feedback) = feedback {
        let _ = feedback.await;
    }
    if let Err(e) = reader.close() {
        debug!("Closing encoder for binding {} failed: {}", binding_id, e);
    }
    shared.remove_binding(&binding_id, generation);

    // An unbind may have raced with a self-initiated stop
    if let Some(ack) = stopped.or_else(|| control_rx.try_recv().ok()) {
        let _ = ack.send(());
    }
    drop(control_rx);

    debug!("Binding {} ({}) released", binding_id, reader.codec());
}

/// Turn receiver picture-loss feedback into forced key frames
async fn listen_feedback(
    shared: Arc<TrackShared>,
    binding_id: String,
    mut feedback: Box<dyn FeedbackReader>,
    key_frame: Arc<dyn KeyFrameController>,
    token: CancellationToken,
) {
    loop {
        let reports = tokio::select! {
            _ = token.cancelled() => break,
            reports = feedback.read() => reports,
        };

        match reports {
            Ok(Some(reports)) => {
                if !reports.iter().any(|r| r.wants_key_frame()) {
                    continue;
                }
                match key_frame.force_key_frame() {
                    Ok(()) => {
                        debug!("Key frame requested by receiver of {}", binding_id);
                        shared
                            .counters
                            .key_frames_requested
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("Failed to force key frame for {}: {}", binding_id, e),
                }
            }
            Ok(None) => break,
            Err(e) => debug!("Feedback read error on {}: {}", binding_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::encoder::{
        EncodedChunk, EncodedReader, EncoderBuilder, EncoderController, PassthroughEncoder, RtpCodec,
    };
    use crate::media::format::{MediaProps, PixelFormat, Resolution, SampleFormat};
    use crate::media::frame::MediaFrame;
    use crate::media::source::ChannelSource;
    use crate::media::BroadcastReader;
    use crate::webrtc::binding::FeedbackReport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rtp::packet::Packet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records written packets; optionally fails every write
    struct RecordingWriter {
        packets: mpsc::UnboundedSender<Packet>,
        fail: bool,
    }

    #[async_trait]
    impl PacketWriter for RecordingWriter {
        async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
            if self.fail {
                return Err(AppError::Transport("connection closed".to_string()));
            }
            let _ = self.packets.send(packet.clone());
            Ok(packet.payload.len())
        }
    }

    struct ChannelFeedback {
        rx: mpsc::UnboundedReceiver<Vec<FeedbackReport>>,
    }

    #[async_trait]
    impl FeedbackReader for ChannelFeedback {
        async fn read(&mut self) -> Result<Option<Vec<FeedbackReport>>> {
            Ok(self.rx.recv().await)
        }
    }

    struct TestContext {
        id: String,
        codecs: Vec<RTCRtpCodecParameters>,
        writer: Arc<RecordingWriter>,
        feedback: Mutex<Option<ChannelFeedback>>,
    }

    impl BindingContext for TestContext {
        fn binding_id(&self) -> String {
            self.id.clone()
        }

        fn codec_parameters(&self) -> Vec<RTCRtpCodecParameters> {
            self.codecs.clone()
        }

        fn ssrc(&self) -> u32 {
            0xCAFE
        }

        fn packet_writer(&self) -> Option<Arc<dyn PacketWriter>> {
            Some(self.writer.clone() as Arc<dyn PacketWriter>)
        }

        fn feedback_reader(&self) -> Option<Box<dyn FeedbackReader>> {
            self.feedback
                .lock()
                .take()
                .map(|f| Box::new(f) as Box<dyn FeedbackReader>)
        }
    }

    fn context(
        id: &str,
        codecs: Vec<RtpCodec>,
        fail: bool,
    ) -> (TestContext, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TestContext {
            id: id.to_string(),
            codecs: codecs.iter().map(|c| c.to_codec_parameters()).collect(),
            writer: Arc::new(RecordingWriter { packets: tx, fail }),
            feedback: Mutex::new(None),
        };
        (ctx, rx)
    }

    fn h264_frame(sequence: u64) -> MediaFrame {
        MediaFrame::video(
            Bytes::from(vec![0, 0, 0, 1, 0x65, 0x88, sequence as u8]),
            Resolution::VGA,
            PixelFormat::H264,
            sequence,
        )
    }

    /// Track fed by a channel, with one frame already buffered
    async fn h264_track(
        selector: CodecSelector,
    ) -> (Track, mpsc::Sender<Result<MediaFrame>>) {
        let (tx, source) = ChannelSource::new(4);
        let track = Track::new(TrackConfig::default(), Box::new(source), Arc::new(selector));
        tx.send(Ok(h264_frame(1))).await.unwrap();
        (track, tx)
    }

    /// Encoder counting forced key frames
    struct KeyFrameEncoder {
        forced: Arc<AtomicUsize>,
    }

    struct Forcer(Arc<AtomicUsize>);

    impl KeyFrameController for Forcer {
        fn force_key_frame(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct KeyFrameReader {
        reader: BroadcastReader,
        forced: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EncodedReader for KeyFrameReader {
        async fn read(&mut self) -> Result<EncodedChunk> {
            let frame = self.reader.read().await?;
            Ok(EncodedChunk {
                data: frame.data_bytes(),
                key_frame: false,
            })
        }

        fn controller(&self) -> EncoderController {
            EncoderController::with_key_frame(Arc::new(Forcer(self.forced.clone())))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl EncoderBuilder for KeyFrameEncoder {
        fn name(&self) -> &str {
            "test-h264"
        }

        fn codec(&self) -> &RtpCodec {
            static CODEC: std::sync::OnceLock<RtpCodec> = std::sync::OnceLock::new();
            CODEC.get_or_init(RtpCodec::h264)
        }

        fn build(&self, reader: BroadcastReader, _props: &MediaProps) -> Result<Box<dyn EncodedReader>> {
            Ok(Box::new(KeyFrameReader {
                reader,
                forced: self.forced.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_bind_forwards_and_unbind_releases() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let (track, tx) = h264_track(selector).await;
        let (ctx, mut packets) = context("peer-1", vec![RtpCodec::vp8(), RtpCodec::h264()], false);

        let params = track.bind(&ctx).await.unwrap();
        assert_eq!(params.capability.mime_type, RtpCodec::h264().mime_type);
        assert_eq!(track.stats().active_bindings, 1);

        let packet = packets.recv().await.unwrap();
        assert_eq!(packet.header.ssrc, 0xCAFE);

        tx.send(Ok(h264_frame(2))).await.unwrap();
        packets.recv().await.unwrap();

        track.unbind("peer-1").await.unwrap();
        assert_eq!(track.stats().active_bindings, 0);
        assert!(track.stats().packets_sent >= 2);

        // Second unbind is a no-op
        track.unbind("peer-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_unbind_unknown_is_ok() {
        let (track, _tx) = h264_track(CodecSelector::new()).await;
        track.unbind("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_binding_rejected() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let (track, _tx) = h264_track(selector).await;
        let (ctx, _packets) = context("peer-1", vec![RtpCodec::h264()], false);

        track.bind(&ctx).await.unwrap();
        let err = track.bind(&ctx).await.unwrap_err();
        assert!(matches!(err, AppError::BindingError(_)));
        assert_eq!(track.stats().active_bindings, 1);

        track.unbind("peer-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_unbind_of_many_bindings() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let (track, _tx) = h264_track(selector).await;

        let mut receivers = Vec::new();
        for i in 0..4 {
            let (ctx, packets) = context(&format!("peer-{}", i), vec![RtpCodec::h264()], false);
            track.bind(&ctx).await.unwrap();
            receivers.push(packets);
        }
        assert_eq!(track.stats().active_bindings, 4);

        // Each binding and a duplicate request for it
        let unbinds = (0..4).flat_map(|i| {
            let id = format!("peer-{}", i);
            let a = track.clone();
            let b = track.clone();
            let id2 = id.clone();
            [
                tokio::spawn(async move { a.unbind(&id).await }),
                tokio::spawn(async move { b.unbind(&id2).await }),
            ]
        });
        for result in futures::future::join_all(unbinds).await {
            result.unwrap().unwrap();
        }
        assert_eq!(track.stats().active_bindings, 0);
    }

    #[tokio::test]
    async fn test_failed_negotiation_unregisters() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let (track, _tx) = h264_track(selector).await;
        let (ctx, _packets) = context("peer-1", vec![RtpCodec::vp8()], false);

        let err = track.bind(&ctx).await.unwrap_err();
        assert!(matches!(err, AppError::Negotiation(_)));
        assert!(err.to_string().contains("VP8"));
        assert_eq!(track.stats().active_bindings, 0);
    }

    #[tokio::test]
    async fn test_write_failure_fires_handler_once() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let (track, tx) = h264_track(selector).await;

        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        track.on_ended(move |err| {
            let _ = fired_tx.send(err.to_string());
        });

        let (ctx, _packets) = context("peer-1", vec![RtpCodec::h264()], true);
        track.bind(&ctx).await.unwrap();

        let message = fired_rx.recv().await.unwrap();
        assert!(message.contains("connection closed"));

        // The failed binding removes itself
        tokio::time::timeout(Duration::from_secs(5), async {
            while track.stats().active_bindings > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Second failing binding only stores the error
        let (ctx, _packets) = context("peer-2", vec![RtpCodec::h264()], true);
        track.bind(&ctx).await.unwrap();
        tx.send(Ok(h264_frame(2))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired_rx.try_recv().is_err());
        assert!(track.error().is_some());
    }

    #[tokio::test]
    async fn test_handler_registered_after_error_fires_immediately() {
        let (tx, source) = ChannelSource::new(1);
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let track = Track::new(TrackConfig::default(), Box::new(source), Arc::new(selector));
        tx.send(Ok(h264_frame(1))).await.unwrap();

        let (ctx, _packets) = context("peer-1", vec![RtpCodec::h264()], true);
        track.bind(&ctx).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while track.error().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        track.on_ended(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let counter = fired.clone();
        track.on_ended(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_failure_ends_binding() {
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let (track, tx) = h264_track(selector).await;
        let (ctx, mut packets) = context("peer-1", vec![RtpCodec::h264()], false);
        track.bind(&ctx).await.unwrap();
        packets.recv().await.unwrap();

        tx.send(Err(AppError::SourceError("unplugged".to_string())))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while track.stats().active_bindings > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(track.error().unwrap().to_string().contains("unplugged"));

        // Unbind after self-termination is still fine
        track.unbind("peer-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_picture_loss_forces_key_frame() {
        let forced = Arc::new(AtomicUsize::new(0));
        let selector = CodecSelector::new().with(Arc::new(KeyFrameEncoder {
            forced: forced.clone(),
        }));
        let (track, _tx) = h264_track(selector).await;

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (ctx, mut packets) = context("peer-1", vec![RtpCodec::h264()], false);
        *ctx.feedback.lock() = Some(ChannelFeedback { rx: feedback_rx });

        track.bind(&ctx).await.unwrap();
        packets.recv().await.unwrap();

        feedback_tx.send(vec![FeedbackReport::Other]).unwrap();
        feedback_tx
            .send(vec![FeedbackReport::PictureLoss, FeedbackReport::Other])
            .unwrap();
        feedback_tx.send(vec![FeedbackReport::FullIntraRequest]).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while forced.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(track.stats().key_frames_requested, 2);

        // Feedback reader still open; unbind must stop the listener
        track.unbind("peer-1").await.unwrap();
        assert_eq!(track.stats().active_bindings, 0);
    }

    /// Passes frames through, reporting where each frame's bytes live and
    /// taking a while to close
    struct InspectingEncoder {
        addresses: mpsc::UnboundedSender<usize>,
        closed: Arc<AtomicUsize>,
    }

    struct InspectingReader {
        reader: BroadcastReader,
        addresses: mpsc::UnboundedSender<usize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EncodedReader for InspectingReader {
        async fn read(&mut self) -> Result<EncodedChunk> {
            let frame = self.reader.read().await?;
            let _ = self.addresses.send(frame.data().as_ptr() as usize);
            Ok(EncodedChunk {
                data: frame.data_bytes(),
                key_frame: true,
            })
        }

        fn controller(&self) -> EncoderController {
            EncoderController::none()
        }

        fn close(&mut self) -> Result<()> {
            std::thread::sleep(Duration::from_millis(20));
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl EncoderBuilder for InspectingEncoder {
        fn name(&self) -> &str {
            "inspecting-h264"
        }

        fn codec(&self) -> &RtpCodec {
            static CODEC: std::sync::OnceLock<RtpCodec> = std::sync::OnceLock::new();
            CODEC.get_or_init(RtpCodec::h264)
        }

        fn build(&self, reader: BroadcastReader, _props: &MediaProps) -> Result<Box<dyn EncodedReader>> {
            Ok(Box::new(InspectingReader {
                reader,
                addresses: self.addresses.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn inspecting_selector() -> (CodecSelector, mpsc::UnboundedReceiver<usize>, Arc<AtomicUsize>) {
        let (addresses, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicUsize::new(0));
        let selector = CodecSelector::new().with(Arc::new(InspectingEncoder {
            addresses,
            closed: closed.clone(),
        }));
        (selector, rx, closed)
    }

    #[tokio::test]
    async fn test_unbind_returns_after_encoder_closed() {
        let (selector, _addresses, closed) = inspecting_selector();
        let (track, _tx) = h264_track(selector).await;

        for round in 1..=5 {
            let (ctx, mut packets) = context("peer-1", vec![RtpCodec::h264()], false);
            track.bind(&ctx).await.unwrap();
            packets.recv().await.unwrap();

            track.unbind("peer-1").await.unwrap();
            assert_eq!(closed.load(Ordering::SeqCst), round);
        }
    }

    #[tokio::test]
    async fn test_copy_frames_gives_binding_its_own_buffer() {
        for copy_frames in [false, true] {
            let (selector, mut addresses, _closed) = inspecting_selector();
            let (tx, source) = ChannelSource::new(4);
            let config = TrackConfig {
                copy_frames,
                ..Default::default()
            };
            let track = Track::new(config, Box::new(source), Arc::new(selector));

            let frame = h264_frame(1);
            let original = frame.data().as_ptr() as usize;
            tx.send(Ok(frame)).await.unwrap();

            let (ctx, mut packets) = context("peer-1", vec![RtpCodec::h264()], false);
            track.bind(&ctx).await.unwrap();
            packets.recv().await.unwrap();

            let seen = addresses.recv().await.unwrap();
            assert_eq!(seen != original, copy_frames);

            track.unbind("peer-1").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_audio_track_negotiates_opus() {
        let selector = CodecSelector::new()
            .with(Arc::new(PassthroughEncoder::h264()))
            .with(Arc::new(PassthroughEncoder::opus()));
        let (tx, source) = ChannelSource::new(2);
        let config = TrackConfig {
            track_id: "audio0".to_string(),
            kind: MediaKind::Audio,
            ..Default::default()
        };
        let track = Track::new(config, Box::new(source), Arc::new(selector));
        let props = MediaProps::Audio {
            sample_rate: 48000,
            channels: 2,
            format: SampleFormat::Opus,
        };
        tx.send(Ok(MediaFrame::new(Bytes::from_static(&[0xFC, 0x01]), props, 1)))
            .await
            .unwrap();

        // Video codecs offered on an audio sender are skipped
        let (ctx, mut packets) = context("peer-1", vec![RtpCodec::h264(), RtpCodec::opus()], false);
        let params = track.bind(&ctx).await.unwrap();
        assert_eq!(params.capability.mime_type, RtpCodec::opus().mime_type);

        let packet = packets.recv().await.unwrap();
        assert_eq!(packet.header.payload_type, RtpCodec::opus().payload_type);

        track.unbind("peer-1").await.unwrap();
    }
}
