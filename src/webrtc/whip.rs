//! WHIP ingest session
//!
//! ```text
//! Idle ──create offer──> Offered ──POST 201 + answer──> Established ──close──> Closed
//! ```
//!
//! The offer is sent only after ICE gathering completes (no trickle). The
//! resource URL returned in `Location` is remembered and deleted on close.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::config::WhipConfig;
use crate::error::{AppError, Result};

/// MIME type of WHIP offers and answers
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Peer connection operations the session drives
#[async_trait]
pub trait SignalingPeer: Send + Sync {
    /// Create the offer, apply it locally and return it once ICE gathering
    /// has completed
    async fn create_offer(&self) -> Result<String>;

    /// Apply the remote answer
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Close the connection, unbinding every track
    async fn close(&self) -> Result<()>;
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offered,
    Established,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Offered => write!(f, "offered"),
            SessionState::Established => write!(f, "established"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// One publisher session against a WHIP endpoint
pub struct WhipSession {
    endpoint: Url,
    token: Option<String>,
    http: reqwest::Client,
    peer: Box<dyn SignalingPeer>,
    resource_url: Option<Url>,
    state: SessionState,
}

impl WhipSession {
    pub fn new(config: &WhipConfig, peer: Box<dyn SignalingPeer>) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "WHIP endpoint must be http(s): {}",
                endpoint
            )));
        }
        if config.insecure {
            warn!("TLS certificate verification disabled for {}", endpoint);
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint,
            token: config.token.clone().filter(|t| !t.is_empty()),
            http,
            peer,
            resource_url: None,
            state: SessionState::Idle,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session resource returned by the endpoint, once established
    pub fn resource_url(&self) -> Option<&Url> {
        self.resource_url.as_ref()
    }

    /// Offer/answer exchange with the endpoint
    pub async fn publish(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(AppError::Protocol(format!(
                "cannot publish from {} state",
                self.state
            )));
        }

        let offer = self.peer.create_offer().await?;
        self.state = SessionState::Offered;
        debug!("Local offer ready ({} bytes)", offer.len());

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Protocol(format!(
                "endpoint answered {} instead of 201 Created: {}",
                status,
                body.trim()
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| AppError::Protocol("201 response without Location header".to_string()))?
            .to_str()
            .map_err(|e| AppError::Protocol(format!("invalid Location header: {}", e)))?;
        let resource_url = self.endpoint.join(location)?;
        info!("WHIP session resource: {}", resource_url);
        // Known from here on so close() can release it even if the answer is rejected
        self.resource_url = Some(resource_url);

        let answer = response.text().await?;
        self.peer.apply_answer(answer).await?;
        self.state = SessionState::Established;
        info!("WHIP session established with {}", self.endpoint);

        Ok(())
    }

    /// Close the peer connection, then delete the session resource.
    ///
    /// Without a resource URL no request is made.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        let peer_result = if self.state == SessionState::Idle {
            Ok(())
        } else {
            self.peer.close().await
        };
        self.state = SessionState::Closed;

        if let Some(resource_url) = self.resource_url.take() {
            let mut request = self.http.delete(resource_url.clone());
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(AppError::Protocol(format!(
                    "teardown of {} answered {}",
                    resource_url, status
                )));
            }
            info!("WHIP session {} deleted", resource_url);
        }

        peer_result
    }
}
