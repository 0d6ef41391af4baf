//! End-to-end gateway tests over a real socket: admission, the frame
//! codec, the handler chain, and displacement, exercised through a live
//! axum server with a tokio-tungstenite client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use devicehub_core::{Channel, ChannelHash, FieldType, Message, MessageKind};
use devicehub_server::pipeline::{Handler, Middleware, MiddlewareRegistry};
use devicehub_server::{
    ChannelRegistry, Connection, GatewayConfig, GatewayModule, MemoryChannelStore, SharedConfig,
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const SALT: &str = "integration-test-salt";
const TOKEN: &str = "good-token";

/// Answers every request with a response carrying the same id and payload.
struct EchoMiddleware;

impl Middleware for EchoMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |conn, msg| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                if msg.kind == MessageKind::Request {
                    let reply = Message::response(msg.id.clone(), msg.payload.clone());
                    let _ = conn.send(reply, false).await;
                }
                next(conn, msg).await;
            })
        })
    }
}

struct Gateway {
    port: u16,
    channel_hash: String,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Gateway {
    fn url(&self, device: &str) -> String {
        format!(
            "ws://127.0.0.1:{}/channels/{}/devices/{}/ws",
            self.port, self.channel_hash, device
        )
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_gateway() -> Gateway {
    let config = Arc::new(SharedConfig::new(GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..GatewayConfig::default()
    }));
    let registry = Arc::new(ChannelRegistry::new(Arc::clone(&config)));
    let hash_codec = Arc::new(ChannelHash::new(SALT).unwrap());
    let store = Arc::new(MemoryChannelStore::new(
        Arc::clone(&registry),
        Arc::clone(&hash_codec),
    ));

    let channel = store
        .create(Channel {
            id: 0,
            name: "sensors".to_string(),
            description: "Integration sensors".to_string(),
            tags: vec![],
            fields: BTreeMap::from([("v".to_string(), FieldType::Float)]),
            message_handlers: vec!["echo".to_string()],
            access_tokens: vec![TOKEN.to_string()],
        })
        .unwrap();
    let channel_hash = hash_codec.encode(channel.id);

    let mut handlers = MiddlewareRegistry::new();
    handlers.register("echo", Arc::new(EchoMiddleware));

    let mut module = GatewayModule::new(
        config,
        registry,
        store,
        Arc::new(handlers),
        hash_codec,
    );
    let port = module.start().await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        module
            .serve(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });

    Gateway {
        port,
        channel_hash,
        stop: Some(stop_tx),
    }
}

fn authorized(url: &str) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("AccessToken", HeaderValue::from_static(TOKEN));
    request
}

#[tokio::test]
async fn request_response_roundtrip_over_the_wire() {
    let gateway = start_gateway().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(authorized(&gateway.url("d1")))
        .await
        .expect("handshake succeeds");

    let request = Message::request(&b"req-7"[..], &b"{\"v\": 1.5}"[..]);
    socket
        .send(WsMessage::Binary(request.encode().unwrap()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("reply in time")
        .expect("stream open")
        .expect("no transport error");
    let WsMessage::Binary(frame) = reply else {
        panic!("expected a binary frame, got {reply:?}");
    };
    let decoded = Message::decode(&frame).unwrap();
    assert_eq!(decoded.kind, MessageKind::Response);
    assert_eq!(decoded.id, request.id);
    assert_eq!(decoded.payload, request.payload);

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let gateway = start_gateway().await;
    let mut request = gateway.url("d1").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("AccessToken", HeaderValue::from_static("wrong"));

    let err = tokio_tungstenite::connect_async(request)
        .await
        .expect_err("handshake must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let gateway = start_gateway().await;
    let err = tokio_tungstenite::connect_async(gateway.url("d1"))
        .await
        .expect_err("handshake must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_channel_is_not_found() {
    let gateway = start_gateway().await;
    let url = format!(
        "ws://127.0.0.1:{}/channels/not-a-real-hash/devices/d1/ws",
        gateway.port
    );
    let err = tokio_tungstenite::connect_async(authorized(&url))
        .await
        .expect_err("handshake must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn second_connection_displaces_the_first() {
    let gateway = start_gateway().await;
    let (mut first, _) = tokio_tungstenite::connect_async(authorized(&gateway.url("d1")))
        .await
        .expect("first handshake succeeds");
    let (mut second, _) = tokio_tungstenite::connect_async(authorized(&gateway.url("d1")))
        .await
        .expect("second handshake succeeds");

    // The displaced socket ends (close frame or EOF) within the write
    // timeout; the new one keeps serving.
    let displaced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(displaced.is_ok(), "displaced socket must be closed");

    let request = Message::request(&b"1"[..], &b"{\"v\": 2.0}"[..]);
    second
        .send(WsMessage::Binary(request.encode().unwrap()))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("reply in time")
        .expect("stream open")
        .expect("no transport error");
    assert!(matches!(reply, WsMessage::Binary(_)));

    second.close(None).await.unwrap();
}
