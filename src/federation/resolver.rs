//! Remote entity resolution
//!
//! Fetches actor and note documents from their origin, validates them
//! against the wire schema, and upserts them together with their nested
//! dependencies. Resolution is idempotent: resolving the same uri twice
//! updates one row in place.
//!
//! Dependency failures are split in two classes:
//! - hard: author, reply target, quote target (the whole resolution fails)
//! - soft: mentions, custom emoji, attachments (logged and skipped)

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use url::Url;

use super::context::{FederationContext, UriKind, authority_of};
use super::local_ref::{LocalIndex, Lookup};
use super::schema::{ActorObject, NoteObject};
use crate::data::{
    Actor, Attachment, Database, Emoji, EntityId, Note, NoteAssociations, Notification,
    NotificationKind,
};
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, REMOTE_FETCHES_TOTAL};

/// Nested note hops followed before giving up
pub const MAX_RESOLVE_DEPTH: usize = 32;

/// Media type requested when fetching documents
pub const FEDERATION_MEDIA_TYPE: &str = "application/json";

/// Whether a stored copy may be returned as is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    IfMissing,
    /// Re-fetch and upsert even when a row exists
    Force,
}

/// What a note is resolved from
#[derive(Debug, Clone)]
pub enum NoteSource {
    Uri(String),
    /// Inbound payload; always upserted
    Payload(Box<NoteObject>),
}

/// Hook for registering newly created entities with a search backend
///
/// Called once per created row, never on updates.
#[cfg_attr(test, mockall::automock)]
pub trait SearchIndex: Send + Sync {
    fn index_actor(&self, actor: &Actor);
    fn index_note(&self, note: &Note);
}

/// Search index that only logs
pub struct NoopSearchIndex;

impl SearchIndex for NoopSearchIndex {
    fn index_actor(&self, actor: &Actor) {
        tracing::debug!(actor_id = %actor.id, "Search index registration skipped");
    }

    fn index_note(&self, note: &Note) {
        tracing::debug!(note_id = %note.id, "Search index registration skipped");
    }
}

/// Recursion bookkeeping for one top-level resolution
#[derive(Debug, Default)]
struct ResolveScope {
    visited: HashSet<String>,
    depth: usize,
}

pub struct RemoteResolver {
    ctx: Arc<FederationContext>,
    db: Arc<Database>,
    http_client: reqwest::Client,
    local: LocalIndex,
    search_index: Arc<dyn SearchIndex>,
}

impl RemoteResolver {
    pub fn new(
        ctx: Arc<FederationContext>,
        db: Arc<Database>,
        http_client: reqwest::Client,
        search_index: Arc<dyn SearchIndex>,
    ) -> Self {
        let local = LocalIndex::new(ctx.clone(), db.clone());
        Self {
            ctx,
            db,
            http_client,
            local,
            search_index,
        }
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Resolve an actor uri into a stored row
    ///
    /// Local uris are answered from the store. Remote uris already stored
    /// are returned unless `refresh` is [`Refresh::Force`].
    pub async fn resolve_actor(&self, uri: &str, refresh: Refresh) -> Result<Actor, AppError> {
        let url = match self.local.actor(uri).await? {
            Lookup::Local(actor) => return Ok(actor),
            Lookup::Stored(actor, _) if refresh == Refresh::IfMissing => return Ok(actor),
            Lookup::Stored(_, url) | Lookup::Missing(url) => url,
        };

        let document = self.fetch_document(&url, "User").await?;
        let object: ActorObject = serde_json::from_value(document)
            .map_err(|e| AppError::RemoteSchema(format!("invalid actor {uri}: {e}")))?;
        object
            .validate()
            .map_err(|e| AppError::RemoteSchema(format!("invalid actor {uri}: {e}")))?;
        RsaPublicKey::from_public_key_pem(&object.public_key.public_key)
            .map_err(|e| AppError::RemoteSchema(format!("invalid public key for {uri}: {e}")))?;

        self.upsert_actor(&url, object).await
    }

    async fn upsert_actor(&self, url: &Url, object: ActorObject) -> Result<Actor, AppError> {
        let instance_id = self.register_instance(url).await?;
        let now = Utc::now();
        let candidate = Actor {
            id: EntityId::new().0,
            uri: Some(object.uri.clone()),
            username: object.username,
            display_name: object.display_name,
            summary: object.bio.as_ref().and_then(render_remote_content),
            avatar_url: object.avatar,
            header_url: object.header,
            public_key_pem: object.public_key.public_key,
            private_key_pem: None,
            inbox_uri: Some(object.inbox),
            shared_inbox_uri: object.shared_inbox,
            outbox_uri: object.outbox,
            followers_uri: object.followers,
            following_uri: object.following,
            locked: object.manually_approves_followers,
            instance_id: Some(instance_id),
            created_at: object.created_at.unwrap_or(now),
            updated_at: now,
        };

        let upserted = self.db.upsert_remote_actor(&candidate).await?;
        let actor = self
            .db
            .get_actor(&upserted.id)
            .await?
            .ok_or(AppError::NotFound)?;

        if upserted.created {
            tracing::info!(actor_id = %actor.id, uri = %object.uri, "Remote actor created");
            self.search_index.index_actor(&actor);
        } else {
            tracing::debug!(actor_id = %actor.id, uri = %object.uri, "Remote actor refreshed");
        }

        Ok(actor)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Resolve a note from a uri or an inbound payload
    pub async fn resolve_note(&self, source: NoteSource, refresh: Refresh) -> Result<Note, AppError> {
        let mut scope = ResolveScope::default();
        self.resolve_note_scoped(source, refresh, &mut scope).await
    }

    fn resolve_note_scoped<'a>(
        &'a self,
        source: NoteSource,
        refresh: Refresh,
        scope: &'a mut ResolveScope,
    ) -> BoxFuture<'a, Result<Note, AppError>> {
        async move {
            let object = match source {
                NoteSource::Payload(object) => {
                    object.validate().map_err(AppError::SchemaValidation)?;
                    if let UriKind::Local(_) = self.ctx.classify(&object.uri)? {
                        return Err(AppError::Authorization(format!(
                            "{} is owned by this instance",
                            object.uri
                        )));
                    }
                    scope.visited.insert(object.uri.clone());
                    *object
                }
                NoteSource::Uri(uri) => {
                    let url = match self.local.note(&uri).await? {
                        Lookup::Local(note) => return Ok(note),
                        Lookup::Stored(note, _) if refresh == Refresh::IfMissing => {
                            return Ok(note);
                        }
                        Lookup::Stored(_, url) | Lookup::Missing(url) => url,
                    };
                    if !scope.visited.insert(uri.clone()) {
                        return Err(AppError::RemoteSchema(format!("reply cycle through {uri}")));
                    }
                    let document = self.fetch_document(&url, "Note").await?;
                    let object: NoteObject = serde_json::from_value(document)
                        .map_err(|e| AppError::RemoteSchema(format!("invalid note {uri}: {e}")))?;
                    object
                        .validate()
                        .map_err(|e| AppError::RemoteSchema(format!("invalid note {uri}: {e}")))?;
                    object
                }
            };

            self.materialize_note(object, scope).await
        }
        .boxed()
    }

    async fn materialize_note(
        &self,
        object: NoteObject,
        scope: &mut ResolveScope,
    ) -> Result<Note, AppError> {
        let author = self.resolve_actor(&object.author, Refresh::IfMissing).await?;
        if same_origin(&object.uri, &object.author) != Some(true) {
            return Err(AppError::Authorization(format!(
                "{} is not hosted by its author's origin",
                object.uri
            )));
        }
        if let Some(existing) = self.db.get_note_by_uri(&object.uri).await? {
            if existing.author_id != author.id {
                return Err(AppError::Authorization(format!(
                    "{} belongs to another author",
                    object.uri
                )));
            }
        }

        let reply_id = match object.replies_to.as_deref() {
            Some(target) => Some(self.resolve_nested_note(target, scope).await?.id),
            None => None,
        };
        let quote_id = match object.quotes.as_deref() {
            Some(target) => Some(self.resolve_nested_note(target, scope).await?.id),
            None => None,
        };

        let mut mentioned = Vec::with_capacity(object.mentions.len());
        for mention in &object.mentions {
            match self.resolve_actor(mention, Refresh::IfMissing).await {
                Ok(actor) => {
                    if !mentioned.iter().any(|m: &Actor| m.id == actor.id) {
                        mentioned.push(actor);
                    }
                }
                Err(error) => {
                    tracing::warn!(note = %object.uri, mention = %mention, %error, "Skipping unresolvable mention");
                }
            }
        }

        let mut emoji_ids = Vec::with_capacity(object.emojis.len());
        for emoji in &object.emojis {
            if Url::parse(&emoji.url).is_err() {
                tracing::warn!(note = %object.uri, shortcode = %emoji.name, "Skipping emoji with invalid url");
                continue;
            }
            let row = Emoji {
                id: EntityId::new().0,
                shortcode: emoji.name.trim_matches(':').to_string(),
                image_url: emoji.url.clone(),
                content_type: emoji.media_type.clone(),
                instance_id: author.instance_id.clone(),
                created_at: Utc::now(),
            };
            match self.db.upsert_emoji(&row).await {
                Ok(id) => emoji_ids.push(id),
                Err(error) => {
                    tracing::warn!(note = %object.uri, shortcode = %emoji.name, %error, "Skipping emoji");
                }
            }
        }

        let mut attachment_ids = Vec::with_capacity(object.attachments.len());
        for attachment in &object.attachments {
            if Url::parse(&attachment.url).is_err() {
                tracing::warn!(note = %object.uri, url = %attachment.url, "Skipping attachment with invalid url");
                continue;
            }
            let row = Attachment {
                id: EntityId::new().0,
                note_id: None,
                remote_url: attachment.url.clone(),
                media_type: attachment.media_type.clone(),
                description: attachment.description.clone(),
                blurhash: attachment.blurhash.clone(),
                width: attachment.width,
                height: attachment.height,
                created_at: Utc::now(),
            };
            match self.db.upsert_attachment(&row).await {
                Ok(id) => attachment_ids.push(id),
                Err(error) => {
                    tracing::warn!(note = %object.uri, url = %attachment.url, %error, "Skipping attachment");
                }
            }
        }

        let now = Utc::now();
        let candidate = Note {
            id: EntityId::new().0,
            author_id: author.id.clone(),
            uri: Some(object.uri.clone()),
            content: render_remote_content(&object.content).unwrap_or_default(),
            source: object.content.plain().map(str::to_string),
            visibility: object.visibility,
            sensitive: object.is_sensitive,
            spoiler_text: object.subject.clone().filter(|s| !s.trim().is_empty()),
            reply_id,
            quote_id,
            created_at: object.created_at,
            updated_at: now,
        };
        let associations = NoteAssociations {
            mention_ids: mentioned.iter().map(|actor| actor.id.clone()).collect(),
            emoji_ids,
            attachment_ids,
        };

        let upserted = self.db.upsert_remote_note(&candidate, &associations).await?;
        let note = self
            .db
            .get_note(&upserted.id)
            .await?
            .ok_or(AppError::NotFound)?;

        if upserted.created {
            tracing::info!(note_id = %note.id, uri = %object.uri, "Remote note created");
            self.search_index.index_note(&note);
            for actor in mentioned.iter().filter(|actor| actor.is_local()) {
                let notification = Notification::new(
                    &actor.id,
                    &author.id,
                    NotificationKind::Mention,
                    Some(&note.id),
                );
                self.db.insert_notification(&notification).await?;
            }
        } else {
            tracing::debug!(note_id = %note.id, uri = %object.uri, "Remote note updated");
        }

        Ok(note)
    }

    async fn resolve_nested_note(
        &self,
        uri: &str,
        scope: &mut ResolveScope,
    ) -> Result<Note, AppError> {
        if scope.depth >= MAX_RESOLVE_DEPTH {
            return Err(AppError::RemoteSchema(format!(
                "thread deeper than {MAX_RESOLVE_DEPTH} notes at {uri}"
            )));
        }
        scope.depth += 1;
        let result = self
            .resolve_note_scoped(NoteSource::Uri(uri.to_string()), Refresh::IfMissing, scope)
            .await;
        scope.depth -= 1;
        result
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    async fn register_instance(&self, url: &Url) -> Result<String, AppError> {
        let authority = authority_of(url)
            .ok_or_else(|| AppError::MalformedUri(url.to_string()))?;
        let base_url = url.origin().ascii_serialization();
        let (instance, created) = self.db.ensure_instance(&authority, &base_url).await?;
        if created {
            tracing::info!(domain = %authority, "Registered new instance");
        }
        Ok(instance.id)
    }

    /// GET a document and check it describes `url` with the expected type
    async fn fetch_document(
        &self,
        url: &Url,
        expected_type: &'static str,
    ) -> Result<serde_json::Value, AppError> {
        self.ctx.ensure_reachable(url).await?;

        let started = Instant::now();
        let result = self
            .http_client
            .get(url.as_str())
            .header(reqwest::header::ACCEPT, FEDERATION_MEDIA_TYPE)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            REMOTE_FETCHES_TOTAL
                .with_label_values(&[expected_type, "network_error"])
                .inc();
            AppError::RemoteFetch(format!("GET {url} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            REMOTE_FETCHES_TOTAL
                .with_label_values(&[expected_type, status.as_str()])
                .inc();
            return Err(AppError::RemoteFetch(format!("GET {url} returned {status}")));
        }

        let document: serde_json::Value = response.json().await.map_err(|e| {
            REMOTE_FETCHES_TOTAL
                .with_label_values(&[expected_type, "invalid_body"])
                .inc();
            AppError::RemoteSchema(format!("{url} did not return JSON: {e}"))
        })?;
        REMOTE_FETCHES_TOTAL
            .with_label_values(&[expected_type, "success"])
            .inc();

        let document_type = document.get("type").and_then(|t| t.as_str());
        if document_type != Some(expected_type) {
            return Err(AppError::RemoteSchema(format!(
                "{url} is a {:?}, expected {expected_type}",
                document_type
            )));
        }
        let document_uri = document.get("uri").and_then(|u| u.as_str());
        if document_uri != Some(url.as_str()) {
            return Err(AppError::RemoteSchema(format!(
                "{url} describes {:?}",
                document_uri
            )));
        }

        Ok(document)
    }
}

/// Sanitized HTML for remote content, falling back to escaped plain text
fn render_remote_content(content: &super::schema::ContentFormat) -> Option<String> {
    if let Some(html) = content.html() {
        return Some(ammonia::clean(html));
    }
    content
        .plain()
        .map(|plain| format!("<p>{}</p>", html_escape::encode_text(plain)))
}

fn same_origin(a: &str, b: &str) -> Option<bool> {
    let a = Url::parse(a).ok()?;
    let b = Url::parse(b).ok()?;
    Some(a.origin() == b.origin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Visibility;
    use crate::federation::context::test_support::test_config;
    use crate::federation::signature::test_support::generate_test_keypair;
    use axum::{Json, Router, extract::State, http::StatusCode};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-process origin serving canned documents by path
    #[derive(Clone, Default)]
    struct MockOrigin {
        documents: Arc<Mutex<HashMap<String, Value>>>,
        hits: Arc<AtomicUsize>,
    }

    impl MockOrigin {
        fn put(&self, path: &str, document: Value) {
            self.documents
                .lock()
                .unwrap()
                .insert(path.to_string(), document);
        }
    }

    async fn serve_document(
        State(origin): State<MockOrigin>,
        uri: axum::http::Uri,
    ) -> Result<Json<Value>, StatusCode> {
        origin.hits.fetch_add(1, Ordering::SeqCst);
        origin
            .documents
            .lock()
            .unwrap()
            .get(uri.path())
            .cloned()
            .map(Json)
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn spawn_origin() -> (MockOrigin, String) {
        let origin = MockOrigin::default();
        let app = Router::new()
            .fallback(serve_document)
            .with_state(origin.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (origin, base)
    }

    fn actor_document(base: &str, name: &str) -> Value {
        let uri = format!("{base}/users/{name}");
        let (_, public_key) = generate_test_keypair();
        json!({
            "type": "User",
            "id": name,
            "uri": uri,
            "username": name,
            "display_name": name.to_uppercase(),
            "bio": {"text/html": {"content": "<p>hi<script>alert(1)</script></p>"}},
            "public_key": {"actor": uri, "public_key": public_key},
            "inbox": format!("{uri}/inbox"),
            "shared_inbox": format!("{base}/inbox"),
        })
    }

    fn note_document(base: &str, id: &str, author: &str, replies_to: Option<String>) -> Value {
        json!({
            "type": "Note",
            "id": id,
            "uri": format!("{base}/notes/{id}"),
            "author": format!("{base}/users/{author}"),
            "created_at": "2026-01-01T00:00:00Z",
            "content": {"text/plain": {"content": format!("note {id}")}},
            "replies_to": replies_to,
            "visibility": "public",
        })
    }

    struct Harness {
        resolver: RemoteResolver,
        db: Arc<Database>,
        _temp_dir: TempDir,
    }

    async fn harness(search_index: Arc<dyn SearchIndex>) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let ctx = Arc::new(FederationContext::from_config(&test_config("local.test")).unwrap());
        let resolver = RemoteResolver::new(ctx, db.clone(), reqwest::Client::new(), search_index);
        Harness {
            resolver,
            db,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn resolving_actor_sanitizes_and_registers_instance() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let actor = h
            .resolver
            .resolve_actor(&format!("{base}/users/bob"), Refresh::IfMissing)
            .await
            .unwrap();

        assert_eq!(actor.username, "bob");
        assert_eq!(actor.summary.as_deref(), Some("<p>hi</p>"));
        assert_eq!(actor.delivery_inbox(), Some(format!("{base}/inbox").as_str()));
        let authority = base.trim_start_matches("http://");
        assert!(h.db.get_instance_by_domain(authority).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_actor_is_not_refetched_unless_forced() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        let h = harness(Arc::new(NoopSearchIndex)).await;
        let uri = format!("{base}/users/bob");

        let first = h.resolver.resolve_actor(&uri, Refresh::IfMissing).await.unwrap();
        let second = h.resolver.resolve_actor(&uri, Refresh::IfMissing).await.unwrap();
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
        assert_eq!(first.id, second.id);

        let mut renamed = actor_document(&base, "bob");
        renamed["display_name"] = json!("Robert");
        origin.put("/users/bob", renamed);
        let forced = h.resolver.resolve_actor(&uri, Refresh::Force).await.unwrap();
        assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
        assert_eq!(forced.id, first.id);
        assert_eq!(forced.display_name.as_deref(), Some("Robert"));
    }

    #[tokio::test]
    async fn document_uri_mismatch_fails_and_stores_nothing() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "mallory"));
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let result = h
            .resolver
            .resolve_actor(&format!("{base}/users/bob"), Refresh::IfMissing)
            .await;

        assert!(matches!(result, Err(AppError::RemoteSchema(_))));
        assert!(
            h.db.get_actor_by_uri(&format!("{base}/users/mallory"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            h.db.get_actor_by_uri(&format!("{base}/users/bob"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn non_success_status_is_remote_fetch_error() {
        let (_origin, base) = spawn_origin().await;
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let result = h
            .resolver
            .resolve_actor(&format!("{base}/users/ghost"), Refresh::IfMissing)
            .await;
        assert!(matches!(result, Err(AppError::RemoteFetch(_))));
    }

    #[tokio::test]
    async fn resolving_same_note_twice_keeps_one_row() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put("/notes/n1", note_document(&base, "n1", "bob", None));
        let h = harness(Arc::new(NoopSearchIndex)).await;
        let uri = format!("{base}/notes/n1");

        let first = h
            .resolver
            .resolve_note(NoteSource::Uri(uri.clone()), Refresh::Force)
            .await
            .unwrap();
        let second = h
            .resolver
            .resolve_note(NoteSource::Uri(uri.clone()), Refresh::Force)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "<p>note n1</p>");
        assert_eq!(second.visibility, Visibility::Public);
    }

    #[tokio::test]
    async fn search_index_fires_on_creation_only() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put("/notes/n1", note_document(&base, "n1", "bob", None));

        let mut index = MockSearchIndex::new();
        index.expect_index_actor().times(1).return_const(());
        index.expect_index_note().times(1).return_const(());
        let h = harness(Arc::new(index)).await;
        let uri = format!("{base}/notes/n1");

        for _ in 0..3 {
            h.resolver
                .resolve_note(NoteSource::Uri(uri.clone()), Refresh::Force)
                .await
                .unwrap();
        }
        h.resolver
            .resolve_actor(&format!("{base}/users/bob"), Refresh::Force)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reply_chain_is_materialized_eagerly() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put("/notes/a", note_document(&base, "a", "bob", None));
        origin.put(
            "/notes/b",
            note_document(&base, "b", "bob", Some(format!("{base}/notes/a"))),
        );
        origin.put(
            "/notes/c",
            note_document(&base, "c", "bob", Some(format!("{base}/notes/b"))),
        );
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let c = h
            .resolver
            .resolve_note(NoteSource::Uri(format!("{base}/notes/c")), Refresh::IfMissing)
            .await
            .unwrap();

        let b = h.db.get_note(c.reply_id.as_deref().unwrap()).await.unwrap().unwrap();
        let a = h.db.get_note(b.reply_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(a.uri.as_deref(), Some(format!("{base}/notes/a").as_str()));
        assert!(a.reply_id.is_none());
    }

    #[tokio::test]
    async fn quoted_note_is_materialized() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put("/users/carol", actor_document(&base, "carol"));
        origin.put("/notes/q", note_document(&base, "q", "carol", None));
        let mut quoting = note_document(&base, "r", "bob", None);
        quoting["quotes"] = json!(format!("{base}/notes/q"));
        origin.put("/notes/r", quoting);
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let note = h
            .resolver
            .resolve_note(NoteSource::Uri(format!("{base}/notes/r")), Refresh::IfMissing)
            .await
            .unwrap();

        let quoted = h.db.get_note(note.quote_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(quoted.uri.as_deref(), Some(format!("{base}/notes/q").as_str()));
        let carol = h
            .db
            .get_actor_by_uri(&format!("{base}/users/carol"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quoted.author_id, carol.id);
    }

    #[tokio::test]
    async fn refetched_note_with_another_author_is_unauthorized() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put("/users/carol", actor_document(&base, "carol"));
        origin.put("/notes/n1", note_document(&base, "n1", "carol", None));
        let h = harness(Arc::new(NoopSearchIndex)).await;
        let uri = format!("{base}/notes/n1");
        let original = h
            .resolver
            .resolve_note(NoteSource::Uri(uri.clone()), Refresh::IfMissing)
            .await
            .unwrap();

        let mut hijacked = note_document(&base, "n1", "bob", None);
        hijacked["content"] = json!({"text/plain": {"content": "hijacked"}});
        origin.put("/notes/n1", hijacked);
        let result = h
            .resolver
            .resolve_note(NoteSource::Uri(uri), Refresh::Force)
            .await;

        assert!(matches!(result, Err(AppError::Authorization(_))));
        let stored = h.db.get_note(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.author_id, original.author_id);
        assert_eq!(stored.content, "<p>note n1</p>");
    }

    #[tokio::test]
    async fn reply_cycle_is_rejected() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put(
            "/notes/x",
            note_document(&base, "x", "bob", Some(format!("{base}/notes/y"))),
        );
        origin.put(
            "/notes/y",
            note_document(&base, "y", "bob", Some(format!("{base}/notes/x"))),
        );
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let result = h
            .resolver
            .resolve_note(NoteSource::Uri(format!("{base}/notes/x")), Refresh::IfMissing)
            .await;

        assert!(matches!(result, Err(AppError::RemoteSchema(_))));
        assert!(
            h.db.get_note_by_uri(&format!("{base}/notes/x"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unresolvable_mention_is_skipped() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put("/users/carol", actor_document(&base, "carol"));
        let mut note = note_document(&base, "m", "bob", None);
        note["mentions"] = json!([
            format!("{base}/users/carol"),
            format!("{base}/users/nobody"),
        ]);
        note["attachments"] = json!([
            {"url": format!("{base}/media/1.png"), "media_type": "image/png"},
            {"url": "not a url", "media_type": "image/png"},
        ]);
        origin.put("/notes/m", note);
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let stored = h
            .resolver
            .resolve_note(NoteSource::Uri(format!("{base}/notes/m")), Refresh::IfMissing)
            .await
            .unwrap();

        let mentioned = h.db.get_mentioned_actors(&stored.id).await.unwrap();
        assert_eq!(mentioned.len(), 1);
        assert_eq!(mentioned[0].username, "carol");
        assert_eq!(h.db.get_note_attachments(&stored.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_reply_target_fails_the_note() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        origin.put(
            "/notes/orphan",
            note_document(&base, "orphan", "bob", Some(format!("{base}/notes/missing"))),
        );
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let result = h
            .resolver
            .resolve_note(
                NoteSource::Uri(format!("{base}/notes/orphan")),
                Refresh::IfMissing,
            )
            .await;

        assert!(matches!(result, Err(AppError::RemoteFetch(_))));
        assert!(
            h.db.get_note_by_uri(&format!("{base}/notes/orphan"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn deep_reply_chain_stops_at_ceiling() {
        let (origin, base) = spawn_origin().await;
        origin.put("/users/bob", actor_document(&base, "bob"));
        let chain = MAX_RESOLVE_DEPTH + 2;
        for i in 0..chain {
            let parent = (i > 0).then(|| format!("{base}/notes/d{}", i - 1));
            origin.put(
                &format!("/notes/d{i}"),
                note_document(&base, &format!("d{i}"), "bob", parent),
            );
        }
        let h = harness(Arc::new(NoopSearchIndex)).await;

        let result = h
            .resolver
            .resolve_note(
                NoteSource::Uri(format!("{base}/notes/d{}", chain - 1)),
                Refresh::IfMissing,
            )
            .await;
        assert!(matches!(result, Err(AppError::RemoteSchema(_))));
    }
}
