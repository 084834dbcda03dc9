//! The broker behind a real socket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nodelink_broker::{Broker, BrokerConfig, BrokerServer};
use nodelink_core::{Envelope, MsgType};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

async fn next_envelope<S>(ws: &mut S) -> Envelope
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return Envelope::parse(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn handshake_over_websocket() {
    let broker = Broker::builder(BrokerConfig::default()).build();
    let server = BrokerServer::new(broker.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let serving = tokio::spawn(async move { server.serve(listener, stop).await });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws/node"))
        .await
        .unwrap();

    let Value::Object(fields) = json!({"nodeConsistentId": "ws-node"}) else {
        unreachable!()
    };
    let init = Envelope::new_request(MsgType::InitReq, fields);
    ws.send(Message::Text(init.to_json().unwrap().into())).await.unwrap();

    let resp = next_envelope(&mut ws).await;
    assert_eq!(resp.msg_type(), MsgType::InitResp);
    assert_eq!(resp.req_id(), init.id());
    assert!(broker.session("ws-node").is_some());

    let ping = Envelope::new_request(MsgType::PingReq, serde_json::Map::new());
    ws.send(Message::Text(ping.to_json().unwrap().into())).await.unwrap();
    assert_eq!(next_envelope(&mut ws).await.msg_type(), MsgType::PingResp);

    cancel.cancel();
    drop(ws);
    serving.await.unwrap().unwrap();
    assert_eq!(broker.session_count(), 0);
}
