//! Frame transport over an axum WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nodelink_core::transport::{FrameSink, FrameStream, TransportError};
use tracing::debug;

/// Write half of an accepted WebSocket.
pub struct AxumSink(SplitSink<WebSocket, Message>);

/// Read half of an accepted WebSocket.
pub struct AxumStream(SplitStream<WebSocket>);

/// Split an upgraded socket into the two frame halves.
pub fn split(socket: WebSocket) -> (AxumSink, AxumStream) {
    let (tx, rx) = socket.split();
    (AxumSink(tx), AxumStream(rx))
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.0.send(Message::Close(None)).await;
        self.0.close().await.map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl FrameStream for AxumStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(Ok(text.to_owned())),
                    Err(_) => debug!(len = data.len(), "skipping non-UTF8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }
}

/// Peer address from proxy headers, first hop of `X-Forwarded-For` first.
pub fn remote_addr_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let _ = headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(remote_addr_from(&headers).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn real_ip_fallback() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(remote_addr_from(&headers).as_deref(), Some("10.9.9.9"));
    }

    #[test]
    fn no_headers_no_addr() {
        assert_eq!(remote_addr_from(&HeaderMap::new()), None);
    }
}
