//! Transport-side view of a single track binding
//!
//! When the peer connection negotiates a sender for a [`Track`](super::track::Track)
//! it hands over a [`BindingContext`]: the negotiated codecs, the SSRC, a
//! sink for RTP packets and optionally a source of RTCP feedback.

use async_trait::async_trait;
use rtp::packet::Packet;
use std::sync::Arc;
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::error::Result;

/// Destination of outgoing RTP packets
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<usize>;
}

/// Receiver feedback relevant to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackReport {
    /// RTCP PLI
    PictureLoss,
    /// RTCP FIR
    FullIntraRequest,
    /// Anything else (receiver reports, REMB, NACK, ...)
    Other,
}

impl FeedbackReport {
    /// True for reports asking the sender to restart the picture
    pub fn wants_key_frame(&self) -> bool {
        matches!(
            self,
            FeedbackReport::PictureLoss | FeedbackReport::FullIntraRequest
        )
    }

    pub fn classify(packet: &(dyn rtcp::packet::Packet + Send + Sync)) -> Self {
        let any = packet.as_any();
        if any.downcast_ref::<PictureLossIndication>().is_some() {
            FeedbackReport::PictureLoss
        } else if any.downcast_ref::<FullIntraRequest>().is_some() {
            FeedbackReport::FullIntraRequest
        } else {
            FeedbackReport::Other
        }
    }
}

/// Source of RTCP feedback for one binding
#[async_trait]
pub trait FeedbackReader: Send {
    /// Next batch of reports.
    ///
    /// `Ok(None)` means the feedback stream has ended. Errors are transient.
    async fn read(&mut self) -> Result<Option<Vec<FeedbackReport>>>;
}

/// Everything a track needs to serve one negotiated sender
pub trait BindingContext: Send + Sync {
    /// Unique id of this binding within the track
    fn binding_id(&self) -> String;

    /// Codecs offered by the remote side, in preference order
    fn codec_parameters(&self) -> Vec<RTCRtpCodecParameters>;

    fn ssrc(&self) -> u32;

    fn packet_writer(&self) -> Option<Arc<dyn PacketWriter>>;

    fn feedback_reader(&self) -> Option<Box<dyn FeedbackReader>>;
}
