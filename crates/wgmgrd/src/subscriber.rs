//! Peer event subscription over the message queue.
//!
//! The subscriber holds one WebSocket connection to
//! `{base_url}/channel/{channel}` and forwards every peer event it receives.
//! Whenever the connection is lost it waits [`RECONNECT_BACKOFF`] and dials
//! again, indefinitely, until cancelled.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmgr_common::defaults::MESSAGE_QUEUE_PROTOCOL;
use wgmgr_common::{WgMgrError, WgMgrResult};
use wgmgr_types::PeerEvent;

use crate::config::BasicAuth;

/// Delay between a lost connection and the next attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the close handshake of a finished connection.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Not started, or stopped
    Disconnected,
    Connected,
    /// Waiting to dial again after a failure
    Reconnecting,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberState::Disconnected => f.write_str("disconnected"),
            SubscriberState::Connected => f.write_str("connected"),
            SubscriberState::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// Why a connection stopped delivering events.
enum ReadOutcome {
    Cancelled,
    SinkClosed,
    Lost(WgMgrError),
}

pub struct Subscriber {
    base_url: String,
    credentials: Option<BasicAuth>,
    backoff: Duration,
    state: watch::Sender<SubscriberState>,
}

impl Subscriber {
    pub fn new(base_url: impl Into<String>, credentials: Option<BasicAuth>) -> Self {
        let (state, _) = watch::channel(SubscriberState::Disconnected);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            backoff: RECONNECT_BACKOFF,
            state,
        }
    }

    /// Overrides the reconnect delay.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns a receiver tracking the connection state.
    pub fn state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn channel_url(&self, channel: &str) -> String {
        format!("{}/channel/{}", self.base_url, channel)
    }

    fn set_state(&self, state: SubscriberState) {
        debug!(state = %state, "Subscriber state changed");
        self.state.send_replace(state);
    }

    /// Builds the handshake request, with credentials, for one attempt.
    fn request(&self, channel: &str) -> WgMgrResult<Request> {
        let url = self.channel_url(channel);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| WgMgrError::invalid_config("mq_url", format!("{}: {}", url, e)))?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(MESSAGE_QUEUE_PROTOCOL),
        );

        if let Some(auth) = &self.credentials {
            let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
            let value = HeaderValue::from_str(&format!("Basic {}", token)).map_err(|_| {
                WgMgrError::invalid_config("mq_username", "credentials are not a valid header")
            })?;
            headers.insert("Authorization", value);
        }

        Ok(request)
    }

    /// Streams peer events from `channel` into `sink` until cancelled.
    ///
    /// Connection failures never end the subscription. Returns `Ok(())` once
    /// `cancel` fires or the receiving side of `sink` is dropped, and an
    /// error only if the URL or credentials cannot form a request.
    pub async fn subscribe(
        &self,
        channel: &str,
        sink: mpsc::Sender<PeerEvent>,
        cancel: CancellationToken,
    ) -> WgMgrResult<()> {
        self.request(channel)?;
        let url = self.channel_url(channel);
        self.set_state(SubscriberState::Disconnected);

        let mut attempt: u64 = 0;
        loop {
            if attempt > 0 {
                self.set_state(SubscriberState::Reconnecting);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
            attempt += 1;

            let request = self.request(channel)?;
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(request) => result,
            };

            let mut stream = match connected {
                Ok((stream, _)) => stream,
                Err(e) => {
                    let e = WgMgrError::Transport(e.to_string());
                    warn!(url = %url, attempt, "Error connecting to message queue: {}", e);
                    continue;
                }
            };

            self.set_state(SubscriberState::Connected);
            if attempt > 1 {
                info!(url = %url, "Reconnected to message queue");
            } else {
                info!(url = %url, "Connected to message queue");
            }
            attempt = 1;

            let outcome = read_events(&mut stream, &sink, &cancel).await;
            close_stream(&mut stream, &cancel, CLOSE_TIMEOUT).await;

            match outcome {
                ReadOutcome::Cancelled => break,
                ReadOutcome::SinkClosed => {
                    debug!("Event receiver dropped, stopping subscription");
                    break;
                }
                ReadOutcome::Lost(reason) => {
                    warn!(url = %url, "Error reading from message queue, reconnecting: {}", reason);
                }
            }
        }

        self.set_state(SubscriberState::Disconnected);
        Ok(())
    }
}

/// Sends a close frame, giving up once `cancel` fires or `limit` passes.
async fn close_stream<S>(stream: &mut S, cancel: &CancellationToken, limit: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    tokio::select! {
        _ = cancel.cancelled() => {}
        closed = tokio::time::timeout(limit, stream.close()) => match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing message queue connection: {}", e),
            Err(_) => debug!("Timed out closing message queue connection"),
        },
    }
}

async fn read_events(
    stream: &mut WsStream,
    sink: &mpsc::Sender<PeerEvent>,
    cancel: &CancellationToken,
) -> ReadOutcome {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            message = stream.next() => message,
        };

        let payload = match message {
            None => return ReadOutcome::Lost(WgMgrError::Transport("connection closed".to_string())),
            Some(Err(e)) => return ReadOutcome::Lost(WgMgrError::Transport(e.to_string())),
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                return ReadOutcome::Lost(WgMgrError::Transport(format!(
                    "closed by server: {:?}",
                    frame
                )))
            }
            Some(Ok(_)) => continue,
        };

        let event: PeerEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => return ReadOutcome::Lost(WgMgrError::Decode(format!("invalid event: {}", e))),
        };
        debug!(action = %event.action, peer = %event.peer.pubkey, "Received peer event");

        tokio::select! {
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            sent = sink.send(event) => {
                if sent.is_err() {
                    return ReadOutcome::SinkClosed;
                }
            }
        }
    }
}
