//! Note service
//!
//! Local note creation and deletion. Both publish to remote inboxes through
//! the outbound federator once the store is updated.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Actor, Database, EntityId, Note, Notification, NotificationKind, Visibility};
use crate::error::AppError;
use crate::federation::{DeliveryBatch, LocalReferenceResolver, OutboundFederator};

/// Render plain text as escaped HTML paragraphs
///
/// Blank lines separate paragraphs, single newlines become `<br>`.
pub fn render_plain_text(text: &str) -> String {
    text.trim()
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| {
            let lines: Vec<_> = paragraph
                .lines()
                .map(|line| html_escape::encode_text(line.trim_end()).into_owned())
                .collect();
            format!("<p>{}</p>", lines.join("<br>"))
        })
        .collect()
}

/// Input for a new local note
#[derive(Debug, Clone)]
pub struct NewNote {
    /// Plain text
    pub text: String,
    pub visibility: Visibility,
    pub spoiler_text: Option<String>,
    pub sensitive: bool,
    /// Uri of the note being replied to
    pub in_reply_to: Option<String>,
    /// Uri of the quoted note
    pub quote: Option<String>,
    /// Actor uris to mention
    pub mentions: Vec<String>,
}

impl NewNote {
    pub fn public(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            visibility: Visibility::Public,
            spoiler_text: None,
            sensitive: false,
            in_reply_to: None,
            quote: None,
            mentions: Vec::new(),
        }
    }
}

/// Note service
pub struct NoteService {
    db: Arc<Database>,
    resolver: LocalReferenceResolver,
    outbound: Arc<OutboundFederator>,
}

impl NoteService {
    pub fn new(
        db: Arc<Database>,
        resolver: LocalReferenceResolver,
        outbound: Arc<OutboundFederator>,
    ) -> Self {
        Self {
            db,
            resolver,
            outbound,
        }
    }

    /// Get a note by id
    pub async fn get(&self, id: &str) -> Result<Note, AppError> {
        self.db.get_note(id).await?.ok_or(AppError::NotFound)
    }

    /// Create a note authored by a local actor
    ///
    /// # Side Effects
    /// - Resolves reply/quote targets and mentions, fetching remote ones
    /// - Notifies mentioned local actors
    /// - Enqueues deliveries to mentioned and following remote actors
    pub async fn create_local_note(
        &self,
        author_id: &str,
        input: NewNote,
    ) -> Result<(Note, DeliveryBatch), AppError> {
        let author = self
            .db
            .get_actor(author_id)
            .await?
            .filter(Actor::is_local)
            .ok_or(AppError::NotFound)?;

        let text = input.text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::Validation("note text is required".to_string()));
        }

        let reply_id = match input.in_reply_to.as_deref() {
            Some(uri) => Some(self.resolver.resolve_note(uri).await?.id),
            None => None,
        };
        let quote_id = match input.quote.as_deref() {
            Some(uri) => Some(self.resolver.resolve_note(uri).await?.id),
            None => None,
        };

        let mut mentioned: Vec<Actor> = Vec::with_capacity(input.mentions.len());
        for uri in &input.mentions {
            let actor = self.resolver.resolve_actor(uri).await?;
            if actor.id != author.id && !mentioned.iter().any(|m| m.id == actor.id) {
                mentioned.push(actor);
            }
        }

        let now = Utc::now();
        let note = Note {
            id: EntityId::new().0,
            author_id: author.id.clone(),
            uri: None,
            content: render_plain_text(&text),
            source: Some(text),
            visibility: input.visibility,
            sensitive: input.sensitive,
            spoiler_text: input.spoiler_text.filter(|s| !s.trim().is_empty()),
            reply_id,
            quote_id,
            created_at: now,
            updated_at: now,
        };
        let mention_ids: Vec<String> = mentioned.iter().map(|actor| actor.id.clone()).collect();
        self.db.insert_local_note(&note, &mention_ids).await?;

        for actor in mentioned.iter().filter(|actor| actor.is_local()) {
            let notification = Notification::new(
                &actor.id,
                &author.id,
                NotificationKind::Mention,
                Some(&note.id),
            );
            self.db.insert_notification(&notification).await?;
        }

        tracing::info!(note_id = %note.id, author = %author.id, "Local note created");
        let batch = self.outbound.note_created(&note).await?;
        Ok((note, batch))
    }

    /// Delete a local note on behalf of its author
    ///
    /// # Errors
    /// - `NotFound` if the note does not exist
    /// - `Authorization` if `author_id` did not write it
    pub async fn delete_note(
        &self,
        author_id: &str,
        note_id: &str,
    ) -> Result<DeliveryBatch, AppError> {
        let note = self.get(note_id).await?;
        let author = self
            .db
            .get_actor(&note.author_id)
            .await?
            .filter(Actor::is_local)
            .ok_or_else(|| AppError::Authorization("remote notes cannot be deleted locally".to_string()))?;
        if author.id != author_id {
            return Err(AppError::Authorization(format!(
                "{author_id} is not the author of note {note_id}"
            )));
        }

        // Audience must be read while mentions still exist
        let targets = self.outbound.note_targets(&note).await?;
        self.db.delete_note(&note.id).await?;
        tracing::info!(note_id = %note.id, "Local note deleted");

        self.outbound.note_deleted(&note, &author, targets)
    }
}
