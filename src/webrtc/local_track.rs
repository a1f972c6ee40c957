//! [`Track`] as a `webrtc` local track
//!
//! The peer connection calls `bind` once per negotiated sender and `unbind`
//! when the sender stops. RTCP arriving on the sender is drained into a
//! broadcast channel so bindings can watch for picture-loss requests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rtp::packet::Packet;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::{TrackLocal, TrackLocalContext, TrackLocalWriter};

use super::binding::{BindingContext, FeedbackReader, FeedbackReport, PacketWriter};
use super::track::Track;
use crate::error::{AppError, Result};

/// Feedback batches buffered per subscriber
const FEEDBACK_QUEUE: usize = 32;

/// Adapter registering a [`Track`] with an `RTCPeerConnection`
pub struct RtcTrack {
    track: Track,
    sender: OnceLock<Arc<RTCRtpSender>>,
    feedback_tx: broadcast::Sender<Vec<FeedbackReport>>,
    feedback_ended: CancellationToken,
}

impl RtcTrack {
    pub fn new(track: Track) -> Arc<Self> {
        let (feedback_tx, _) = broadcast::channel(FEEDBACK_QUEUE);
        Arc::new(Self {
            track,
            sender: OnceLock::new(),
            feedback_tx,
            feedback_ended: CancellationToken::new(),
        })
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Start draining RTCP from the sender created by `add_track`.
    ///
    /// Only the first sender is used.
    pub fn attach_sender(&self, sender: Arc<RTCRtpSender>) {
        if self.sender.set(sender.clone()).is_err() {
            debug!("Track {} already has an RTP sender", self.track.id());
            return;
        }

        let feedback_tx = self.feedback_tx.clone();
        let ended = self.feedback_ended.clone();
        let track_id = self.track.id().to_string();

        tokio::spawn(async move {
            loop {
                match sender.read_rtcp().await {
                    Ok((packets, _attributes)) => {
                        let reports: Vec<FeedbackReport> = packets
                            .iter()
                            .map(|p| FeedbackReport::classify(p.as_ref()))
                            .collect();
                        // No subscribers is fine
                        let _ = feedback_tx.send(reports);
                    }
                    Err(e) => {
                        debug!("RTCP reader for track {} stopped: {}", track_id, e);
                        break;
                    }
                }
            }
            ended.cancel();
        });
    }

    fn feedback_reader(&self) -> Option<Box<dyn FeedbackReader>> {
        self.sender.get()?;
        Some(Box::new(RtcpFeedbackReader {
            rx: self.feedback_tx.subscribe(),
            ended: self.feedback_ended.clone(),
        }))
    }
}

#[async_trait]
impl TrackLocal for RtcTrack {
    async fn bind(&self, t: &TrackLocalContext) -> webrtc::error::Result<RTCRtpCodecParameters> {
        let ctx = RtcBindingContext {
            id: t.id(),
            codecs: t.codec_parameters().to_vec(),
            ssrc: t.ssrc(),
            writer: Arc::new(TransportWriter {
                writer: t.write_stream(),
            }),
            feedback: Mutex::new(self.feedback_reader()),
        };

        self.track
            .bind(&ctx)
            .await
            .map_err(|e| webrtc::Error::new(e.to_string()))
    }

    async fn unbind(&self, t: &TrackLocalContext) -> webrtc::error::Result<()> {
        self.track
            .unbind(&t.id())
            .await
            .map_err(|e| webrtc::Error::new(e.to_string()))
    }

    fn id(&self) -> &str {
        self.track.id()
    }

    fn rid(&self) -> Option<&str> {
        None
    }

    fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    fn kind(&self) -> RTPCodecType {
        self.track.kind().codec_type()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Snapshot of a `TrackLocalContext`
struct RtcBindingContext {
    id: String,
    codecs: Vec<RTCRtpCodecParameters>,
    ssrc: u32,
    writer: Arc<dyn PacketWriter>,
    feedback: Mutex<Option<Box<dyn FeedbackReader>>>,
}

impl BindingContext for RtcBindingContext {
    fn binding_id(&self) -> String {
        self.id.clone()
    }

    fn codec_parameters(&self) -> Vec<RTCRtpCodecParameters> {
        self.codecs.clone()
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn packet_writer(&self) -> Option<Arc<dyn PacketWriter>> {
        Some(self.writer.clone())
    }

    fn feedback_reader(&self) -> Option<Box<dyn FeedbackReader>> {
        self.feedback.lock().take()
    }
}

struct TransportWriter {
    writer: Arc<dyn TrackLocalWriter + Send + Sync>,
}

#[async_trait]
impl PacketWriter for TransportWriter {
    async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
        self.writer
            .write_rtp(packet)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }
}

struct RtcpFeedbackReader {
    rx: broadcast::Receiver<Vec<FeedbackReport>>,
    ended: CancellationToken,
}

#[async_trait]
impl FeedbackReader for RtcpFeedbackReader {
    async fn read(&mut self) -> Result<Option<Vec<FeedbackReport>>> {
        tokio::select! {
            _ = self.ended.cancelled() => Ok(None),
            received = self.rx.recv() => match received {
                Ok(reports) => Ok(Some(reports)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    info!("Dropped {} RTCP feedback batches", n);
                    Err(AppError::Transport(format!("feedback lagged by {}", n)))
                }
                Err(broadcast::error::RecvError::Closed) => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::encoder::{CodecSelector, PassthroughEncoder, RtpCodec};
    use crate::media::format::{PixelFormat, Resolution};
    use crate::media::frame::MediaFrame;
    use crate::media::source::ChannelSource;
    use crate::webrtc::track::TrackConfig;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct ForwardingWriter(mpsc::UnboundedSender<Packet>);

    #[async_trait]
    impl PacketWriter for ForwardingWriter {
        async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
            let _ = self.0.send(packet.clone());
            Ok(packet.payload.len())
        }
    }

    #[tokio::test]
    async fn test_track_local_identity() {
        let (_tx, source) = ChannelSource::new(1);
        let config = TrackConfig {
            track_id: "cam".to_string(),
            stream_id: "live".to_string(),
            ..Default::default()
        };
        let track = Track::new(config, Box::new(source), Arc::new(CodecSelector::new()));
        let rtc = RtcTrack::new(track);

        assert_eq!(TrackLocal::id(rtc.as_ref()), "cam");
        assert_eq!(rtc.stream_id(), "live");
        assert_eq!(rtc.kind(), RTPCodecType::Video);
        assert!(rtc.rid().is_none());
        // No sender yet, so no feedback
        assert!(rtc.feedback_reader().is_none());
    }

    #[tokio::test]
    async fn test_feedback_reader_ends_with_rtcp() {
        let (tx, _) = broadcast::channel(4);
        let ended = CancellationToken::new();
        let mut reader = RtcpFeedbackReader {
            rx: tx.subscribe(),
            ended: ended.clone(),
        };

        tx.send(vec![FeedbackReport::PictureLoss]).unwrap();
        assert_eq!(
            reader.read().await.unwrap(),
            Some(vec![FeedbackReport::PictureLoss])
        );

        ended.cancel();
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_binding_context_feeds_track() {
        let (frames, source) = ChannelSource::new(2);
        let selector = CodecSelector::new().with(Arc::new(PassthroughEncoder::h264()));
        let track = Track::new(TrackConfig::default(), Box::new(source), Arc::new(selector));
        frames
            .send(Ok(MediaFrame::video(
                Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88, 0x80]),
                Resolution::VGA,
                PixelFormat::H264,
                1,
            )))
            .await
            .unwrap();

        let (tx, mut packets) = mpsc::unbounded_channel();
        let ctx = RtcBindingContext {
            id: "sender-1".to_string(),
            codecs: vec![RtpCodec::h264().to_codec_parameters()],
            ssrc: 7,
            writer: Arc::new(ForwardingWriter(tx)),
            feedback: Mutex::new(None),
        };
        assert!(ctx.packet_writer().is_some());
        assert!(ctx.feedback_reader().is_none());

        track.bind(&ctx).await.unwrap();
        let packet = packets.recv().await.unwrap();
        assert_eq!(packet.header.ssrc, 7);

        track.unbind("sender-1").await.unwrap();
    }
}
