//! Thread service
//!
//! Per-viewer visibility and reply-chain assembly over stored notes.

use std::collections::HashSet;
use std::sync::Arc;

use crate::data::{Actor, Database, Note, Visibility};
use crate::error::AppError;

/// Hard ceiling on descendant traversal depth
pub const MAX_DESCENDANT_DEPTH: usize = 20;

/// Ancestor hops followed before giving up
pub const MAX_ANCESTOR_HOPS: usize = 256;

/// Thread service
pub struct ThreadService {
    db: Arc<Database>,
}

impl ThreadService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Whether `viewer` (or an anonymous visitor) may see `note`
    pub async fn is_viewable_by_user(
        &self,
        note: &Note,
        viewer: Option<&Actor>,
    ) -> Result<bool, AppError> {
        if viewer.is_some_and(|viewer| viewer.id == note.author_id) {
            return Ok(true);
        }

        match note.visibility {
            Visibility::Public | Visibility::Unlisted => Ok(true),
            Visibility::Private => match viewer {
                Some(viewer) => self.db.is_following(&viewer.id, &note.author_id).await,
                None => Ok(false),
            },
            Visibility::Direct => match viewer {
                Some(viewer) => self.db.is_mentioned(&note.id, &viewer.id).await,
                None => Ok(false),
            },
        }
    }

    /// Notes `note` replies to, oldest first, filtered for `viewer`
    pub async fn get_ancestors(
        &self,
        note: &Note,
        viewer: Option<&Actor>,
    ) -> Result<Vec<Note>, AppError> {
        let mut visited = HashSet::from([note.id.clone()]);
        let mut chain = Vec::new();
        let mut parent_id = note.reply_id.clone();

        while let Some(id) = parent_id {
            if chain.len() >= MAX_ANCESTOR_HOPS {
                tracing::warn!(note_id = %note.id, "Ancestor chain truncated");
                break;
            }
            if !visited.insert(id.clone()) {
                tracing::warn!(note_id = %note.id, cycle_at = %id, "Reply cycle in ancestors");
                break;
            }
            let Some(parent) = self.db.get_note(&id).await? else {
                break;
            };
            parent_id = parent.reply_id.clone();
            chain.push(parent);
        }

        chain.reverse();
        self.filter_viewable(chain, viewer).await
    }

    /// Replies to `note`, depth-first, filtered for `viewer`
    ///
    /// Traversal stops at `max_depth` hops, capped at [`MAX_DESCENDANT_DEPTH`].
    pub async fn get_descendants(
        &self,
        note: &Note,
        viewer: Option<&Actor>,
        max_depth: usize,
    ) -> Result<Vec<Note>, AppError> {
        let max_depth = max_depth.min(MAX_DESCENDANT_DEPTH);
        let mut visited = HashSet::from([note.id.clone()]);
        let mut descendants = Vec::new();
        let mut stack = vec![(note.clone(), 0usize)];

        while let Some((current, depth)) = stack.pop() {
            if depth < max_depth {
                let replies = self.db.get_replies(&current.id).await?;
                // Reversed so the earliest reply is popped first
                for reply in replies.into_iter().rev() {
                    if visited.insert(reply.id.clone()) {
                        stack.push((reply, depth + 1));
                    }
                }
            }
            if depth > 0 {
                descendants.push(current);
            }
        }

        self.filter_viewable(descendants, viewer).await
    }

    async fn filter_viewable(
        &self,
        notes: Vec<Note>,
        viewer: Option<&Actor>,
    ) -> Result<Vec<Note>, AppError> {
        let mut visible = Vec::with_capacity(notes.len());
        for note in notes {
            if self.is_viewable_by_user(&note, viewer).await? {
                visible.push(note);
            }
        }
        Ok(visible)
    }
}
