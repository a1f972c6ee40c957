//! Encoded chunks to RTP packets
//!
//! [`RtpPacketReader`] pulls from an [`EncodedReader`], stamps each chunk
//! with the elapsed RTP clock and splits it with the codec's payloader.

use rtp::packet::Packet;
use rtp::packetizer::{new_packetizer, Packetizer, Payloader};
use rtp::sequence::new_random_sequencer;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::media::encoder::{EncodedReader, EncoderController, RtpCodec};
use crate::media::sampler::Sampler;

/// Fixed RTP header size the packetizer reserves from the MTU
const RTP_HEADER_LEN: usize = 12;

/// Receives the error that ended a packet reader
pub type ErrorSink = Arc<dyn Fn(AppError) + Send + Sync>;

/// Packets produced from one encoded chunk
#[derive(Debug)]
pub struct PacketBatch {
    pub packets: Vec<Packet>,
    pub key_frame: bool,
    /// Encoded payload size before packetization
    pub payload_len: usize,
}

/// Per-binding packet source
pub struct RtpPacketReader {
    encoder: Box<dyn EncodedReader>,
    packetizer: Box<dyn Packetizer + Send + Sync>,
    sampler: Sampler,
    codec: RtpCodec,
    on_error: ErrorSink,
    closed: bool,
}

impl RtpPacketReader {
    /// `payload_type` and `ssrc` come from the negotiated transceiver
    ///
    /// The encoder is closed when the reader cannot be built.
    pub fn new(
        mut encoder: Box<dyn EncodedReader>,
        codec: RtpCodec,
        payload_type: u8,
        ssrc: u32,
        mtu: usize,
        on_error: ErrorSink,
    ) -> Result<Self> {
        let payloader = if mtu <= RTP_HEADER_LEN {
            Err(AppError::Config(format!(
                "MTU {} leaves no room for RTP payload",
                mtu
            )))
        } else {
            codec.payloader()
        };
        match payloader {
            Ok(payloader) => Ok(Self::with_payloader(
                encoder,
                codec,
                payloader,
                payload_type,
                ssrc,
                mtu,
                on_error,
            )),
            Err(e) => {
                if let Err(close_err) = encoder.close() {
                    debug!("Encoder close failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn with_payloader(
        encoder: Box<dyn EncodedReader>,
        codec: RtpCodec,
        payloader: Box<dyn Payloader + Send + Sync>,
        payload_type: u8,
        ssrc: u32,
        mtu: usize,
        on_error: ErrorSink,
    ) -> Self {
        let packetizer = new_packetizer(
            mtu,
            payload_type,
            ssrc,
            payloader,
            Box::new(new_random_sequencer()),
            codec.clock_rate,
        );

        debug!(
            "RTP packetizer for {}: pt={} ssrc={} mtu={}",
            codec, payload_type, ssrc, mtu
        );

        Self {
            encoder,
            packetizer: Box::new(packetizer),
            sampler: Sampler::new(codec.clock_rate),
            codec,
            on_error,
            closed: false,
        }
    }

    pub fn codec(&self) -> &RtpCodec {
        &self.codec
    }

    pub fn controller(&self) -> EncoderController {
        self.encoder.controller()
    }

    /// Read the next non-empty batch.
    ///
    /// A failed read closes the encoder and reports the error once through
    /// the error sink before returning it.
    pub async fn read(&mut self) -> Result<PacketBatch> {
        if self.closed {
            return Err(AppError::EncoderError("packet reader closed".to_string()));
        }

        loop {
            let chunk = match self.encoder.read().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Encoder for {} stopped: {}", self.codec, e);
                    return Err(self.fail(e));
                }
            };

            let samples = self.sampler.sample();
            if chunk.is_empty() {
                continue;
            }

            let packets = match self.packetizer.packetize(&chunk.data, samples) {
                Ok(packets) => packets,
                Err(e) => {
                    warn!("Packetizing {} failed: {}", self.codec, e);
                    let err = AppError::EncoderError(format!("RTP packetization failed: {}", e));
                    return Err(self.fail(err));
                }
            };
            if packets.is_empty() {
                continue;
            }

            return Ok(PacketBatch {
                packets,
                key_frame: chunk.key_frame,
                payload_len: chunk.len(),
            });
        }
    }

    /// Close the encoder and report `err` through the sink
    fn fail(&mut self, err: AppError) -> AppError {
        if let Err(close_err) = self.close() {
            debug!("Encoder close failed: {}", close_err);
        }
        let reported = match &err {
            AppError::EncoderError(msg) => AppError::EncoderError(msg.clone()),
            other => AppError::EncoderError(other.to_string()),
        };
        (self.on_error)(reported);
        err
    }

    /// Close the encoder chain; later calls are no-ops
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.encoder.close()
    }
}
