//! The realtime channel to the chat server.
//!
//! A [`TransportConnector`] turns an auth token into a live [`TransportLink`]:
//! an outbound queue of [`ClientRequest`]s and an inbound stream of decoded
//! [`ServerEvent`]s. The inbound stream ends when the connection is gone;
//! dropping the outbound sender closes the connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Error as WsError, Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ConnectionError;

pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientRequest>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, auth_token: &str) -> Result<TransportLink, ConnectionError>;
}

/// Websocket transport; the token travels as a bearer header on the upgrade request.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, auth_token: &str) -> Result<TransportLink, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectionError::InvalidUrl(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|_| ConnectionError::AuthRejected("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request).await.map_err(map_handshake_error)?;
        info!(url = %self.url, "conn: websocket established");

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        let Some(request) = outbound else {
                            let _ = writer.send(Message::Close(None)).await;
                            break;
                        };
                        let frame = match request.to_frame() {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(event = request.name(), "conn: failed to encode frame: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = writer.send(Message::Text(frame)).await {
                            warn!("conn: websocket send failed: {err}");
                            break;
                        }
                    }
                    inbound = reader.next() => match inbound {
                        Some(Ok(Message::Text(text))) => match ServerEvent::from_frame(&text) {
                            Ok(event) => {
                                if inbound_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!("conn: skipping unrecognised frame: {err}"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "conn: server closed websocket");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("conn: websocket receive failed: {err}");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn map_handshake_error(err: WsError) -> ConnectionError {
    match err {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            ConnectionError::AuthRejected(format!("handshake returned {}", response.status()))
        }
        WsError::Url(err) => ConnectionError::InvalidUrl(err.to_string()),
        other => ConnectionError::Network(other.to_string()),
    }
}
