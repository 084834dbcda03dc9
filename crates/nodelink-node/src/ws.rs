//! Dialing the broker over tokio-tungstenite.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nodelink_core::transport::{BoxSink, BoxStream, FrameSink, FrameStream, TransportError};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::connector::{DialTarget, Dialer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://` and `wss://` brokers.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteDialer;

/// Write half of a dialled socket.
pub struct TungsteniteSink(SplitSink<Socket, Message>);

/// Read half of a dialled socket.
pub struct TungsteniteStream(SplitStream<Socket>);

fn io(error: impl std::fmt::Display) -> TransportError {
    TransportError::Io(error.to_string())
}

/// `Authorization` value for basic auth.
pub fn basic_auth(user: &str, credential: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{credential}")))
}

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, target: &DialTarget) -> Result<(BoxSink, BoxStream), TransportError> {
        let mut request = target.url.as_str().into_client_request().map_err(io)?;
        if let (Some(user), Some(credential)) = (&target.user, &target.credential) {
            let value = HeaderValue::from_str(&basic_auth(user, credential)).map_err(io)?;
            let _ = request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (socket, response) = tokio_tungstenite::connect_async(request).await.map_err(io)?;
        debug!(url = %target.url, status = %response.status(), "websocket established");
        let (tx, rx) = socket.split();
        Ok((Box::new(TungsteniteSink(tx)), Box::new(TungsteniteStream(rx))))
    }
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0.send(Message::Text(text.into())).await.map_err(io)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.close().await.map_err(io)
    }
}

#[async_trait]
impl FrameStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(Ok(text.to_owned())),
                    Err(_) => debug!(len = data.len(), "skipping non-UTF8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(error) => return Some(Err(io(error))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header() {
        assert_eq!(basic_auth("trader", "x"), "Basic dHJhZGVyOng=");
    }

    #[tokio::test]
    async fn bad_url_fails_without_io() {
        let target = DialTarget {
            url: "not a url".into(),
            user: None,
            credential: None,
        };
        assert!(TungsteniteDialer.dial(&target).await.is_err());
    }
}
