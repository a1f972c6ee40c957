//! Publishing peer connection
//!
//! Builds an `RTCPeerConnection` whose media engine advertises exactly the
//! codecs the [`CodecSelector`] can produce, attaches tracks as send-only
//! transceivers and drives the offer side of the WHIP exchange.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::local_track::RtcTrack;
use super::track::Track;
use super::whip::SignalingPeer;
use crate::error::{AppError, Result};
use crate::media::encoder::CodecSelector;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Send-only peer connection feeding one or more tracks
pub struct PublisherPeer {
    pc: Arc<RTCPeerConnection>,
    tracks: Vec<Arc<RtcTrack>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl PublisherPeer {
    /// Create the connection; tracks are added with [`add_track`](Self::add_track)
    pub async fn new(config: &WebRtcConfig, selector: &CodecSelector) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        selector.register_codecs(&mut media_engine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();

            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!("Peer connection state: {}", new_state);
                let _ = state_tx.send(new_state);
            })
        }));

        Ok(Self {
            pc,
            tracks: Vec::new(),
            state_rx,
        })
    }

    /// Attach a track as a send-only transceiver
    pub async fn add_track(&mut self, track: Track) -> Result<()> {
        let rtc_track = RtcTrack::new(track);

        let sender = self
            .pc
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add track: {}", e)))?;
        rtc_track.attach_sender(sender.clone());

        for transceiver in self.pc.get_transceivers().await {
            if Arc::ptr_eq(&transceiver.sender().await, &sender) {
                transceiver
                    .set_direction(RTCRtpTransceiverDirection::Sendonly)
                    .await;
            }
        }

        info!(
            "Added {} track {} to peer connection",
            rtc_track.track().kind(),
            rtc_track.track().id()
        );
        self.tracks.push(rtc_track);
        Ok(())
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().map(|t| t.track())
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

#[async_trait]
impl SignalingPeer for PublisherPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        // Non-trickle: the offer must carry every candidate
        let _ = gather_complete.recv().await;
        debug!("ICE gathering complete");

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description".to_string()))?;
        Ok(local.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP answer: {}", e)))?;

        self.pc.set_remote_description(answer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection closed");
        Ok(())
    }
}
