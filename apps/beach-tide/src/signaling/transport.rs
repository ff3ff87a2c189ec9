use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError, Message, client::IntoClientRequest, error::ProtocolError,
        http::HeaderValue,
    },
};
use url::Url;

use super::SignalingError;

pub const SIGNALING_SUBPROTOCOL: &str = "janus-protocol";

/// Raw text link to the gateway.
///
/// The session only sees two channels; the tasks pumping them (websocket
/// reader/writer) travel with the link and are aborted when the session
/// closes. An inbound channel that ends means the transport is gone.
pub struct SignalLink {
    pub(crate) outbound: mpsc::UnboundedSender<String>,
    pub(crate) inbound: mpsc::UnboundedReceiver<String>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl SignalLink {
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Connects to a websocket gateway speaking the janus signaling subprotocol.
    pub async fn connect(gateway_url: &str) -> Result<Self, SignalingError> {
        let url = derive_websocket_url(gateway_url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| SignalingError::Transport(format!("invalid gateway request: {err}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SIGNALING_SUBPROTOCOL),
        );
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %url, "gateway websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                tracing::trace!(target = "signaling", event = "ws_out", len = text.len());
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    tracing::warn!(
                        target = "signaling",
                        error = %err,
                        "gateway websocket write failed",
                    );
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "signaling",
                                error = %err,
                                "dropping non-utf8 frame",
                            );
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "gateway websocket closed: {err}",
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "gateway websocket error: {err}",
                                );
                            }
                        }
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }
}

/// In-memory link: the returned [`GatewayEnd`] sees exactly what the session
/// writes and can inject arbitrary inbound text.
pub fn memory_link() -> (SignalLink, GatewayEnd) {
    let (to_gateway_tx, to_gateway_rx) = mpsc::unbounded_channel();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    (
        SignalLink::from_channels(to_gateway_tx, to_client_rx),
        GatewayEnd {
            incoming: to_gateway_rx,
            outgoing: to_client_tx,
        },
    )
}

pub struct GatewayEnd {
    pub incoming: mpsc::UnboundedReceiver<String>,
    pub outgoing: mpsc::UnboundedSender<String>,
}

fn derive_websocket_url(gateway_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(gateway_url).map_err(|err| {
        SignalingError::Transport(format!("invalid gateway url {gateway_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported gateway scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Transport("invalid websocket scheme".into()))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_map_to_websocket_schemes() {
        assert_eq!(
            derive_websocket_url("https://sfu.example.com/janus").unwrap().as_str(),
            "wss://sfu.example.com/janus"
        );
        assert_eq!(
            derive_websocket_url("http://localhost:8188/").unwrap().as_str(),
            "ws://localhost:8188/"
        );
        assert_eq!(
            derive_websocket_url("ws://localhost:8188/").unwrap().as_str(),
            "ws://localhost:8188/"
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            derive_websocket_url("ftp://example.com"),
            Err(SignalingError::Transport(_))
        ));
    }
}
