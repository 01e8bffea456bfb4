//! WebSocket transport built on `tokio-tungstenite`.
//!
//! tungstenite answers peer pings on its own, so the source half never
//! surfaces them. Pongs are passed up for the tunnel's liveness check.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Connection, Dialer, FrameSink, FrameSource, WireMessage};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Install the ring provider as the process-wide rustls default.
///
/// A provider installed earlier by the embedding program wins.
fn install_crypto_provider() {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Dials the relay over ws:// or wss://.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: Url,
    connect_timeout: Duration,
}

impl WsDialer {
    /// Create a dialer for the given tunnel URL.
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }

    /// The URL this dialer connects to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Connection> {
        install_crypto_provider();

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    Error::transport(format!(
                        "connect timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))
                })?
                .map_err(|e| Error::transport(format!("websocket dial failed: {}", e)))?;

        let (sink, source) = stream.split();
        Ok(Connection {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, msg: WireMessage) -> Result<()> {
        let msg = match msg {
            WireMessage::Binary(data) => Message::Binary(data),
            WireMessage::Ping(data) => Message::Ping(data),
            WireMessage::Pong(data) => Message::Pong(data),
        };
        self.inner
            .send(msg)
            .await
            .map_err(|e| Error::transport(format!("websocket write failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::transport(format!("websocket close failed: {}", e)))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<WireMessage>> {
        loop {
            let msg = match self.inner.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Err(Error::transport(format!("websocket read failed: {}", e)))
                }
                None => return Ok(None),
            };

            match inbound(msg) {
                Inbound::Deliver(msg) => return Ok(Some(msg)),
                Inbound::Closed => return Ok(None),
                Inbound::Skip => continue,
            }
        }
    }
}

enum Inbound {
    Deliver(WireMessage),
    Skip,
    Closed,
}

fn inbound(msg: Message) -> Inbound {
    match msg {
        Message::Binary(data) => Inbound::Deliver(WireMessage::Binary(data)),
        Message::Pong(data) => Inbound::Deliver(WireMessage::Pong(data)),
        // Already answered by tungstenite
        Message::Ping(_) => Inbound::Skip,
        Message::Close(_) => Inbound::Closed,
        Message::Text(_) | Message::Frame(_) => Inbound::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[test]
    fn test_inbound_mapping() {
        let data = Bytes::from_static(b"frame");
        assert!(matches!(
            inbound(Message::Binary(data.clone())),
            Inbound::Deliver(WireMessage::Binary(d)) if d == data
        ));
        assert!(matches!(
            inbound(Message::Pong(data.clone())),
            Inbound::Deliver(WireMessage::Pong(d)) if d == data
        ));
        assert!(matches!(inbound(Message::Ping(data)), Inbound::Skip));
        assert!(matches!(inbound(Message::Text(String::from("hello").into())), Inbound::Skip));
        assert!(matches!(inbound(Message::Close(None)), Inbound::Closed));
    }

    #[tokio::test]
    async fn test_tls_dial_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let url = Url::parse(&format!("wss://127.0.0.1:{}/tunnel", port)).unwrap();
        let dialer = WsDialer::new(url, Duration::from_secs(5));

        // Run in a task so a panic shows up as a join error.
        let result = tokio::spawn(async move { dialer.dial().await.map(|_| ()) }).await;
        let dial = result.expect("dial task panicked");
        assert!(matches!(dial, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_plain_dial_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("ws://127.0.0.1:{}/tunnel", port)).unwrap();
        let dialer = WsDialer::new(url, Duration::from_secs(5));
        assert!(dialer.dial().await.is_err());
    }
}
