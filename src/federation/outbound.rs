//! Outbound federation
//!
//! Turns local mutations into signed deliveries. Every operation returns
//! once the jobs are enqueued; the returned [`DeliveryBatch`] can be awaited
//! for outcomes or dropped.

use std::sync::Arc;

use super::context::FederationContext;
use super::delivery::{
    ActivityDelivery, DeliveryBatch, DeliveryQueue, builder, unique_inbox_targets,
};
use super::schema::{Activity, NoteObject};
use crate::data::{Actor, Database, Note, Visibility};
use crate::error::AppError;

/// Inboxes for `recipients`, remote actors only, one per shared inbox
pub fn delivery_targets<'a>(recipients: impl IntoIterator<Item = &'a Actor>) -> Vec<String> {
    unique_inbox_targets(
        recipients
            .into_iter()
            .filter(|actor| !actor.is_local())
            .filter_map(|actor| actor.delivery_inbox().map(str::to_string)),
    )
}

pub struct OutboundFederator {
    ctx: Arc<FederationContext>,
    db: Arc<Database>,
    http_client: reqwest::Client,
    queue: DeliveryQueue,
}

impl OutboundFederator {
    pub fn new(
        ctx: Arc<FederationContext>,
        db: Arc<Database>,
        http_client: reqwest::Client,
    ) -> Self {
        let queue = DeliveryQueue::new(ctx.clone());
        Self {
            ctx,
            db,
            http_client,
            queue,
        }
    }

    /// Publish a profile change to the actor's remote followers
    ///
    /// Nothing is sent unless a published field changed.
    pub async fn actor_updated(
        &self,
        before: &Actor,
        after: &Actor,
    ) -> Result<DeliveryBatch, AppError> {
        if !before.differs_materially(after) {
            tracing::debug!(actor_id = %after.id, "No federated field changed");
            return Ok(DeliveryBatch::empty());
        }

        let followers = self.db.get_remote_followers(&after.id).await?;
        let activity = Activity::ActorUpdate(builder::actor(&self.ctx, after));
        self.enqueue(after, &activity, delivery_targets(&followers))
    }

    /// Inboxes a note's create/delete goes to
    ///
    /// Mentioned remote actors, plus remote followers of the author unless
    /// the note is direct.
    pub async fn note_targets(&self, note: &Note) -> Result<Vec<String>, AppError> {
        let mut recipients = self.db.get_mentioned_actors(&note.id).await?;
        if note.visibility != Visibility::Direct {
            recipients.extend(self.db.get_remote_followers(&note.author_id).await?);
        }
        Ok(delivery_targets(&recipients))
    }

    /// Canonical document of a local note, with its author
    pub async fn note_object(&self, note: &Note) -> Result<(Actor, NoteObject), AppError> {
        let author = self.local_author(note).await?;
        let mentions = self.db.get_mentioned_actors(&note.id).await?;
        let emojis = self.db.get_note_emojis(&note.id).await?;
        let attachments = self.db.get_note_attachments(&note.id).await?;
        let replies_to = self.target_uri(note.reply_id.as_deref()).await?;
        let quotes = self.target_uri(note.quote_id.as_deref()).await?;

        let object = builder::note(
            &self.ctx,
            note,
            &author,
            &mentions,
            &emojis,
            &attachments,
            replies_to,
            quotes,
        );
        Ok((author, object))
    }

    /// Publish a freshly created local note
    pub async fn note_created(&self, note: &Note) -> Result<DeliveryBatch, AppError> {
        let (author, object) = self.note_object(note).await?;
        let targets = self.note_targets(note).await?;
        self.enqueue(&author, &Activity::Note(object), targets)
    }

    /// Publish the deletion of a local note as an Undo
    ///
    /// `targets` must be computed with [`Self::note_targets`] before the row
    /// and its mentions are gone.
    pub fn note_deleted(
        &self,
        note: &Note,
        author: &Actor,
        targets: Vec<String>,
    ) -> Result<DeliveryBatch, AppError> {
        let undo = builder::undo(&self.ctx, author, &self.ctx.note_uri(note));
        self.enqueue(author, &Activity::Undo(undo), targets)
    }

    /// Answer a follow request from `follower` to the local `followee`
    pub fn follow_response(
        &self,
        followee: &Actor,
        follower: &Actor,
        accepted: bool,
    ) -> Result<DeliveryBatch, AppError> {
        let body = builder::follow_response(&self.ctx, followee, &self.ctx.actor_uri(follower));
        let activity = if accepted {
            Activity::FollowAccept(body)
        } else {
            Activity::FollowReject(body)
        };
        self.enqueue(followee, &activity, delivery_targets([follower]))
    }

    async fn local_author(&self, note: &Note) -> Result<Actor, AppError> {
        self.db
            .get_actor(&note.author_id)
            .await?
            .filter(Actor::is_local)
            .ok_or_else(|| {
                AppError::Validation(format!("note {} has no local author", note.id))
            })
    }

    async fn target_uri(&self, note_id: Option<&str>) -> Result<Option<String>, AppError> {
        let Some(note_id) = note_id else {
            return Ok(None);
        };
        Ok(self
            .db
            .get_note(note_id)
            .await?
            .map(|note| self.ctx.note_uri(&note)))
    }

    fn enqueue(
        &self,
        sender: &Actor,
        activity: &Activity,
        targets: Vec<String>,
    ) -> Result<DeliveryBatch, AppError> {
        let activity_type = activity.kind().as_str();
        if targets.is_empty() {
            tracing::debug!(activity_type, sender = %sender.id, "No delivery targets");
            return Ok(DeliveryBatch::empty());
        }

        let delivery = ActivityDelivery::for_actor(&self.ctx, self.http_client.clone(), sender)?;
        let body = serde_json::to_vec(activity).map_err(|e| AppError::Internal(e.into()))?;

        tracing::info!(
            activity_type,
            sender = %sender.id,
            targets = targets.len(),
            "Enqueueing deliveries"
        );
        Ok(self.queue.enqueue(delivery, activity_type, body, targets))
    }
}
