//! Common test utilities for E2E tests
//!
//! `TestServer` runs the real router on an ephemeral port. `RemotePeer` is a
//! second instance on another port that serves actor and note documents and
//! records whatever is delivered to its inboxes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri},
    routing::{get, post},
};
use lagoon::data::Actor;
use lagoon::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

static METRICS: Once = Once::new();

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after letting `customize` adjust the configuration
    pub async fn with_config(customize: impl FnOnce(&mut config::AppConfig)) -> Self {
        METRICS.call_once(lagoon::metrics::init_metrics);

        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so the public domain carries the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                blocked_origins: Vec::new(),
                bridge: config::BridgeConfig::default(),
                delivery: config::DeliveryConfig {
                    max_concurrency: 4,
                    timeout_seconds: 5,
                    max_attempts: 2,
                    base_backoff_millis: 10,
                },
                allow_private_addresses: true,
            },
            logging: config::LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
            accounts: Vec::new(),
        };
        customize(&mut config);

        let state = AppState::new(config).await.unwrap();
        let app = lagoon::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{addr}"),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local actor
    pub async fn create_actor(&self, username: &str, locked: bool) -> Actor {
        self.state
            .accounts
            .create_local_actor(username, None, locked)
            .await
            .unwrap()
    }

    pub fn actor_uri(&self, actor: &Actor) -> String {
        self.state.ctx.actor_uri(actor)
    }

    pub fn inbox_url(&self, actor: &Actor) -> String {
        self.url(&format!("/users/{}/inbox", actor.id))
    }

    /// POST `body` to `inbox_url`, signed by `signer`
    pub async fn post_signed(
        &self,
        signer: &RemoteActor,
        inbox_url: &str,
        body: &Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(body).unwrap();
        self.post_signed_raw(signer, inbox_url, &body, &body).await
    }

    /// POST `sent` while signing the digest of `signed`
    pub async fn post_signed_raw(
        &self,
        signer: &RemoteActor,
        inbox_url: &str,
        signed: &[u8],
        sent: &[u8],
    ) -> reqwest::Response {
        let headers = lagoon::federation::sign_request(
            "POST",
            inbox_url,
            Some(signed),
            &signer.private_key_pem,
            &signer.key_id(),
        )
        .unwrap();

        let mut request = self
            .client
            .post(inbox_url)
            .header("Content-Type", lagoon::federation::FEDERATION_MEDIA_TYPE)
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }
        request.body(sent.to_vec()).send().await.unwrap()
    }

    /// Stored copy of a remote actor
    pub async fn stored(&self, remote: &RemoteActor) -> Option<Actor> {
        self.state.db.get_actor_by_uri(&remote.uri).await.unwrap()
    }
}

// =============================================================================
// Remote peer
// =============================================================================

/// Actor hosted by a [`RemotePeer`]
#[derive(Debug, Clone)]
pub struct RemoteActor {
    pub username: String,
    pub uri: String,
    pub inbox: String,
    pub shared_inbox: String,
    pub display_name: Option<String>,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteActor {
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    fn document(&self) -> Value {
        json!({
            "type": "User",
            "id": self.username,
            "uri": self.uri,
            "username": self.username,
            "display_name": self.display_name,
            "public_key": {
                "actor": self.uri,
                "public_key": self.public_key_pem,
            },
            "manually_approves_followers": false,
            "inbox": self.inbox,
            "shared_inbox": self.shared_inbox,
        })
    }
}

/// A request received by a peer inbox
#[derive(Debug, Clone)]
pub struct Delivered {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Delivered {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    /// Whether the request carries a valid signature by `public_key_pem`
    pub fn verifies_with(&self, public_key_pem: &str) -> bool {
        lagoon::federation::verify_signature(
            "POST",
            &self.path,
            &self.headers,
            Some(&self.body),
            public_key_pem,
        )
        .is_ok()
    }
}

#[derive(Clone, Default)]
struct PeerState {
    actors: Arc<Mutex<HashMap<String, RemoteActor>>>,
    notes: Arc<Mutex<HashMap<String, Value>>>,
    delivered: Arc<Mutex<Vec<Delivered>>>,
}

/// Another instance on its own port
pub struct RemotePeer {
    pub base_url: String,
    state: PeerState,
}

impl RemotePeer {
    pub async fn spawn() -> Self {
        let state = PeerState::default();
        let app = Router::new()
            .route("/users/:name", get(peer_actor))
            .route("/users/:name/inbox", post(peer_inbox))
            .route("/inbox", post(peer_inbox))
            .route("/notes/:id", get(peer_note))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, state }
    }

    /// `host:port` of the peer
    pub fn authority(&self) -> String {
        self.base_url.trim_start_matches("http://").to_string()
    }

    /// Host a new actor with a fresh key pair
    pub fn add_actor(&self, username: &str) -> RemoteActor {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let uri = format!("{}/users/{username}", self.base_url);

        let actor = RemoteActor {
            username: username.to_string(),
            inbox: format!("{uri}/inbox"),
            shared_inbox: format!("{}/inbox", self.base_url),
            display_name: None,
            uri,
            private_key_pem: private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_key_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        };
        self.state
            .actors
            .lock()
            .unwrap()
            .insert(username.to_string(), actor.clone());
        actor
    }

    /// Change the display name served for `actor`
    pub fn set_display_name(&self, actor: &RemoteActor, display_name: &str) {
        if let Some(hosted) = self.state.actors.lock().unwrap().get_mut(&actor.username) {
            hosted.display_name = Some(display_name.to_string());
        }
    }

    /// Serve a note document at `/notes/{id}`; returns its uri
    pub fn put_note(&self, id: &str, author: &RemoteActor, html: &str, fields: Value) -> String {
        let uri = self.note_uri(id);
        let mut document = json!({
            "type": "Note",
            "id": id,
            "uri": uri,
            "author": author.uri,
            "created_at": "2026-01-01T00:00:00Z",
            "content": { "text/html": { "content": html } },
        });
        if let (Some(document), Some(fields)) = (document.as_object_mut(), fields.as_object()) {
            for (key, value) in fields {
                document.insert(key.clone(), value.clone());
            }
        }
        self.state
            .notes
            .lock()
            .unwrap()
            .insert(id.to_string(), document);
        uri
    }

    pub fn note_uri(&self, id: &str) -> String {
        format!("{}/notes/{id}", self.base_url)
    }

    pub fn note_document(&self, id: &str) -> Value {
        self.state.notes.lock().unwrap()[id].clone()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.state.delivered.lock().unwrap().clone()
    }

    /// Wait until at least `count` deliveries arrived
    pub async fn wait_for_deliveries(&self, count: usize) -> Vec<Delivered> {
        for _ in 0..100 {
            let delivered = self.delivered();
            if delivered.len() >= count {
                return delivered;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "expected {count} deliveries, got {}",
            self.delivered().len()
        );
    }
}

async fn peer_actor(
    State(state): State<PeerState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let actors = state.actors.lock().unwrap();
    let actor = actors.get(&name).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(actor.document()))
}

async fn peer_note(
    State(state): State<PeerState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let notes = state.notes.lock().unwrap();
    notes.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn peer_inbox(
    State(state): State<PeerState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.delivered.lock().unwrap().push(Delivered {
        path: uri.path().to_string(),
        headers,
        body,
    });
    StatusCode::ACCEPTED
}

/// Follow activity from `follower` to `followee_uri`
pub fn follow(follower: &RemoteActor, followee_uri: &str, id: &str) -> Value {
    json!({
        "type": "Follow",
        "id": id,
        "uri": format!("{}/follows/{id}", follower.uri),
        "author": follower.uri,
        "followee": followee_uri,
        "created_at": "2026-01-01T00:00:00Z",
    })
}

/// Undo activity by `author` targeting `object`
pub fn undo(author: &RemoteActor, object: &str, id: &str) -> Value {
    json!({
        "type": "Undo",
        "id": id,
        "uri": format!("{}/undos/{id}", author.uri),
        "author": author.uri,
        "object": object,
        "created_at": "2026-01-01T00:00:00Z",
    })
}
