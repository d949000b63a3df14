//! Local reference resolution
//!
//! Decides whether a URI names something on this instance. Local URIs are
//! answered from the store by id and never touch the network; remote URIs
//! are answered from the store by exact uri, or handed to the
//! [`RemoteResolver`] on a miss.

use std::sync::Arc;

use url::Url;

use super::context::{FederationContext, LocalEntity, UriKind};
use super::resolver::{NoteSource, Refresh, RemoteResolver};
use crate::data::{Actor, Database, Note};
use crate::error::AppError;

/// Result of a store-only lookup
#[derive(Debug, Clone)]
pub enum Lookup<T> {
    /// Entity owned by this instance
    Local(T),
    /// Remote entity already materialized
    Stored(T, Url),
    /// Remote entity not known yet
    Missing(Url),
}

impl<T> Lookup<T> {
    /// The row, if the store had one
    pub fn found(self) -> Option<T> {
        match self {
            Self::Local(row) | Self::Stored(row, _) => Some(row),
            Self::Missing(_) => None,
        }
    }
}

/// Store-only lookups keyed by URI
#[derive(Clone)]
pub struct LocalIndex {
    ctx: Arc<FederationContext>,
    db: Arc<Database>,
}

impl LocalIndex {
    pub fn new(ctx: Arc<FederationContext>, db: Arc<Database>) -> Self {
        Self { ctx, db }
    }

    /// Look up an actor by uri without network access
    ///
    /// # Errors
    /// - `MalformedUri` for unparsable uris and local uris without a valid id
    /// - `NotFound` for local uris naming no local actor
    pub async fn actor(&self, uri: &str) -> Result<Lookup<Actor>, AppError> {
        match self.ctx.classify(uri)? {
            UriKind::Local(url) => {
                let id = self.ctx.local_id(&url, LocalEntity::Actor)?;
                let actor = self
                    .db
                    .get_actor(&id.0)
                    .await?
                    .filter(Actor::is_local)
                    .ok_or(AppError::NotFound)?;
                Ok(Lookup::Local(actor))
            }
            UriKind::Remote(url) => Ok(match self.db.get_actor_by_uri(uri).await? {
                Some(actor) => Lookup::Stored(actor, url),
                None => Lookup::Missing(url),
            }),
        }
    }

    /// Look up a note by uri without network access
    ///
    /// Same error contract as [`LocalIndex::actor`].
    pub async fn note(&self, uri: &str) -> Result<Lookup<Note>, AppError> {
        match self.ctx.classify(uri)? {
            UriKind::Local(url) => {
                let id = self.ctx.local_id(&url, LocalEntity::Note)?;
                let note = self
                    .db
                    .get_note(&id.0)
                    .await?
                    .filter(|note| note.uri.is_none())
                    .ok_or(AppError::NotFound)?;
                Ok(Lookup::Local(note))
            }
            UriKind::Remote(url) => Ok(match self.db.get_note_by_uri(uri).await? {
                Some(note) => Lookup::Stored(note, url),
                None => Lookup::Missing(url),
            }),
        }
    }
}

/// Entry point for turning any actor/note URI into a stored row
#[derive(Clone)]
pub struct LocalReferenceResolver {
    index: LocalIndex,
    remote: Arc<RemoteResolver>,
}

impl LocalReferenceResolver {
    pub fn new(index: LocalIndex, remote: Arc<RemoteResolver>) -> Self {
        Self { index, remote }
    }

    pub fn index(&self) -> &LocalIndex {
        &self.index
    }

    pub fn remote(&self) -> &RemoteResolver {
        &self.remote
    }

    /// Resolve an actor, fetching it only when it is remote and unknown
    pub async fn resolve_actor(&self, uri: &str) -> Result<Actor, AppError> {
        match self.index.actor(uri).await? {
            Lookup::Local(actor) | Lookup::Stored(actor, _) => Ok(actor),
            Lookup::Missing(_) => self.remote.resolve_actor(uri, Refresh::IfMissing).await,
        }
    }

    /// Resolve a note, fetching it only when it is remote and unknown
    pub async fn resolve_note(&self, uri: &str) -> Result<Note, AppError> {
        match self.index.note(uri).await? {
            Lookup::Local(note) | Lookup::Stored(note, _) => Ok(note),
            Lookup::Missing(_) => {
                self.remote
                    .resolve_note(NoteSource::Uri(uri.to_string()), Refresh::IfMissing)
                    .await
            }
        }
    }
}
