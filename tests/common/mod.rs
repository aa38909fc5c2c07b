#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use deckterm::{
    api::{self, auth::Credentials},
    config::EngineConfig,
    deck::{Deck, StaticDecks},
    gateway::Gateway,
    pty::PtySpawner,
    rate_limit::RateLimiter,
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
    store::MemoryStore,
};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const DECK: &str = "deck-1";
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A real server on an ephemeral port, spawning `/bin/sh`.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
    pub store: Arc<MemoryStore>,
    pub credentials: Option<Credentials>,
    _root: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(EngineConfig::default(), None).await
    }

    pub async fn start_with(engine: EngineConfig, credentials: Option<Credentials>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let decks = Arc::new(StaticDecks::from_decks([Deck {
            id: DECK.to_string(),
            root: root.path().to_path_buf(),
        }]));
        let store = Arc::new(MemoryStore::new());
        let engine = EngineConfig {
            shell: engine.shell.clone().or_else(|| Some("/bin/sh".to_string())),
            ..engine
        };
        let registry = SessionRegistry::new(engine, decks, Arc::new(PtySpawner), store.clone());
        let shutdown = ShutdownCoordinator::new();
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
        let state = api::AppState {
            registry: registry.clone(),
            gateway: Gateway::new(registry.clone(), limiter),
            shutdown: shutdown.clone(),
            credentials: credentials.clone().map(Arc::new),
        };
        let app = api::router(state, api::RouterConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            registry,
            shutdown,
            store,
            credentials,
            _root: root,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => req.basic_auth(&c.user, Some(&c.password)),
            None => req,
        }
    }

    /// Create a terminal through the REST API and return its id.
    pub async fn create_terminal(&self) -> String {
        let resp = self
            .authorize(reqwest::Client::new().post(self.url("/api/terminals")))
            .json(&serde_json::json!({ "deckId": DECK }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn list_terminals(&self) -> Vec<serde_json::Value> {
        let resp = self
            .authorize(reqwest::Client::new().get(self.url(&format!("/api/terminals?deckId={DECK}"))))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    /// Open a viewer connection, sending credentials when configured.
    pub async fn connect(&self, id: &str) -> WsStream {
        self.connect_path(&format!("/api/terminals/{id}"), self.credentials.as_ref())
            .await
    }

    pub async fn connect_path(&self, path: &str, credentials: Option<&Credentials>) -> WsStream {
        let mut req = self.ws_url(path).into_client_request().unwrap();
        if let Some(c) = credentials {
            let value = format!("Basic {}", STANDARD.encode(format!("{}:{}", c.user, c.password)));
            req.headers_mut().insert("authorization", value.parse().unwrap());
        }
        let (ws, _) = connect_async(req).await.unwrap();
        ws
    }
}

pub async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Read binary output until the accumulated text contains `needle`.
/// Returns everything read.
pub async fn read_until(ws: &mut WsStream, needle: &str) -> String {
    let mut seen = String::new();
    let collect = async {
        while let Some(msg) = ws.next().await {
            match msg.unwrap() {
                Message::Binary(data) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(needle) {
                        return;
                    }
                }
                Message::Close(frame) => panic!("closed while waiting for {needle:?}: {frame:?}"),
                _ => {}
            }
        }
        panic!("stream ended while waiting for {needle:?}");
    };
    tokio::time::timeout(TIMEOUT, collect)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"));
    seen
}

/// The next binary frame.
pub async fn next_binary(ws: &mut WsStream) -> Vec<u8> {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Binary(data) => return data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}

/// The next text frame, skipping any output in between.
pub async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Close(frame) => panic!("closed while waiting for text: {frame:?}"),
            _ => continue,
        }
    }
}

/// Skip output until the close frame; return its code and reason.
pub async fn expect_close(ws: &mut WsStream) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended before close frame")
            .expect("ws error");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame without code");
            return (u16::from(frame.code), frame.reason.as_str().to_string());
        }
    }
}

/// Poll until `cond` holds or the timeout passes.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll).await.is_ok()
}
