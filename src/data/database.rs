//! SQLite database operations
//!
//! All database access goes through this module.
//! Writes keyed by remote URI are single `INSERT ... ON CONFLICT ... RETURNING`
//! statements so concurrent deliveries of the same object converge on one row.

use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to the SQLite file at `path`, creating it if needed, and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Get the registered instance for `host[:port]`
    pub async fn get_instance_by_domain(&self, domain: &str) -> Result<Option<Instance>, AppError> {
        let instance = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;

        Ok(instance)
    }

    /// Register a remote origin on first contact
    ///
    /// # Returns
    /// The instance row and whether it was created by this call.
    pub async fn ensure_instance(
        &self,
        domain: &str,
        base_url: &str,
    ) -> Result<(Instance, bool), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO instances (id, domain, base_url, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(domain) DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(domain)
        .bind(base_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let instance = self
            .get_instance_by_domain(domain)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("instance {domain} vanished")))?;

        Ok((instance, result.rows_affected() > 0))
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Get actor by id
    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get a remote actor by its stored uri
    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get a local actor by username
    pub async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE instance_id IS NULL AND username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Insert a new local actor
    pub async fn insert_local_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, uri, username, display_name, summary, avatar_url, header_url,
                public_key_pem, private_key_pem, inbox_uri, shared_inbox_uri,
                outbox_uri, followers_uri, following_uri, locked, instance_id,
                created_at, updated_at
            ) VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.avatar_url)
        .bind(&actor.header_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.outbox_uri)
        .bind(&actor.followers_uri)
        .bind(&actor.following_uri)
        .bind(actor.locked)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite the mutable profile columns of a local actor
    pub async fn update_local_actor(&self, actor: &Actor) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE actors SET
                username = ?, display_name = ?, summary = ?, avatar_url = ?,
                header_url = ?, public_key_pem = ?, private_key_pem = ?,
                inbox_uri = ?, shared_inbox_uri = ?, outbox_uri = ?,
                followers_uri = ?, following_uri = ?, locked = ?, updated_at = ?
            WHERE id = ? AND instance_id IS NULL
            "#,
        )
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.avatar_url)
        .bind(&actor.header_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.outbox_uri)
        .bind(&actor.followers_uri)
        .bind(&actor.following_uri)
        .bind(actor.locked)
        .bind(actor.updated_at)
        .bind(&actor.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    /// Insert or refresh a remote actor keyed by uri
    ///
    /// The candidate `actor.id` is only used when the row does not exist yet;
    /// `created` reports whether it was.
    pub async fn upsert_remote_actor(&self, actor: &Actor) -> Result<Upserted, AppError> {
        let uri = actor.uri.as_deref().ok_or_else(|| {
            AppError::Validation("remote actor upsert requires a uri".to_string())
        })?;

        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO actors (
                id, uri, username, display_name, summary, avatar_url, header_url,
                public_key_pem, private_key_pem, inbox_uri, shared_inbox_uri,
                outbox_uri, followers_uri, following_uri, locked, instance_id,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                display_name = excluded.display_name,
                summary = excluded.summary,
                avatar_url = excluded.avatar_url,
                header_url = excluded.header_url,
                public_key_pem = excluded.public_key_pem,
                inbox_uri = excluded.inbox_uri,
                shared_inbox_uri = excluded.shared_inbox_uri,
                outbox_uri = excluded.outbox_uri,
                followers_uri = excluded.followers_uri,
                following_uri = excluded.following_uri,
                locked = excluded.locked,
                instance_id = excluded.instance_id,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&actor.id)
        .bind(uri)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.avatar_url)
        .bind(&actor.header_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.outbox_uri)
        .bind(&actor.followers_uri)
        .bind(&actor.following_uri)
        .bind(actor.locked)
        .bind(&actor.instance_id)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let created = id == actor.id;
        Ok(Upserted { id, created })
    }

    /// Remove an actor together with everything it owns, in one transaction
    pub async fn delete_actor(&self, id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM notifications WHERE recipient_id = ? OR origin_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM note_mentions WHERE actor_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relationships WHERE owner_id = ? OR subject_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM notes WHERE author_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM actors WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Get note by id
    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Get a remote note by its stored uri
    pub async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Direct replies to a note, oldest first
    pub async fn get_replies(&self, note_id: &str) -> Result<Vec<Note>, AppError> {
        let notes = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE reply_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(notes)
    }

    /// Insert a local note with its mentions
    pub async fn insert_local_note(
        &self,
        note: &Note,
        mention_ids: &[String],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notes (
                id, author_id, uri, content, source, visibility, sensitive,
                spoiler_text, reply_id, quote_id, created_at, updated_at
            ) VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&note.id)
        .bind(&note.author_id)
        .bind(&note.content)
        .bind(&note.source)
        .bind(note.visibility)
        .bind(note.sensitive)
        .bind(&note.spoiler_text)
        .bind(&note.reply_id)
        .bind(&note.quote_id)
        .bind(note.created_at)
        .bind(note.updated_at)
        .execute(&mut *tx)
        .await?;

        for actor_id in mention_ids {
            sqlx::query("INSERT OR IGNORE INTO note_mentions (note_id, actor_id) VALUES (?, ?)")
                .bind(&note.id)
                .bind(actor_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert or update a remote note and replace its associations atomically
    ///
    /// Mentions and emoji are deleted and reinserted; attachments are re-pointed.
    /// An existing row is only updated when `note.author_id` owns it; otherwise
    /// nothing is written and the call fails with `Authorization`.
    pub async fn upsert_remote_note(
        &self,
        note: &Note,
        associations: &NoteAssociations,
    ) -> Result<Upserted, AppError> {
        let uri = note
            .uri
            .as_deref()
            .ok_or_else(|| AppError::Validation("remote note upsert requires a uri".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let id: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO notes (
                id, author_id, uri, content, source, visibility, sensitive,
                spoiler_text, reply_id, quote_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                content = excluded.content,
                source = excluded.source,
                visibility = excluded.visibility,
                sensitive = excluded.sensitive,
                spoiler_text = excluded.spoiler_text,
                reply_id = excluded.reply_id,
                quote_id = excluded.quote_id,
                updated_at = excluded.updated_at
            WHERE notes.author_id = excluded.author_id
            RETURNING id
            "#,
        )
        .bind(&note.id)
        .bind(&note.author_id)
        .bind(uri)
        .bind(&note.content)
        .bind(&note.source)
        .bind(note.visibility)
        .bind(note.sensitive)
        .bind(&note.spoiler_text)
        .bind(&note.reply_id)
        .bind(&note.quote_id)
        .bind(note.created_at)
        .bind(note.updated_at)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(id) = id else {
            return Err(AppError::Authorization(format!(
                "{uri} belongs to another author"
            )));
        };

        sqlx::query("DELETE FROM note_mentions WHERE note_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        for actor_id in &associations.mention_ids {
            sqlx::query("INSERT OR IGNORE INTO note_mentions (note_id, actor_id) VALUES (?, ?)")
                .bind(&id)
                .bind(actor_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM note_emojis WHERE note_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        for emoji_id in &associations.emoji_ids {
            sqlx::query("INSERT OR IGNORE INTO note_emojis (note_id, emoji_id) VALUES (?, ?)")
                .bind(&id)
                .bind(emoji_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE attachments SET note_id = NULL WHERE note_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        for attachment_id in &associations.attachment_ids {
            sqlx::query("UPDATE attachments SET note_id = ? WHERE id = ?")
                .bind(&id)
                .bind(attachment_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let created = id == note.id;
        Ok(Upserted { id, created })
    }

    /// Delete a note; mentions, emoji links and notifications cascade
    pub async fn delete_note(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Note associations
    // =========================================================================

    /// Actors mentioned by a note
    pub async fn get_mentioned_actors(&self, note_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN note_mentions m ON m.actor_id = a.id
            WHERE m.note_id = ?
            ORDER BY a.id
            "#,
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(actors)
    }

    /// Whether `actor_id` is mentioned by `note_id`
    pub async fn is_mentioned(&self, note_id: &str, actor_id: &str) -> Result<bool, AppError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM note_mentions WHERE note_id = ? AND actor_id = ?",
        )
        .bind(note_id)
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Insert or refresh a custom emoji keyed by image URL
    pub async fn upsert_emoji(&self, emoji: &Emoji) -> Result<String, AppError> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO emojis (id, shortcode, image_url, content_type, instance_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(image_url) DO UPDATE SET
                shortcode = excluded.shortcode,
                content_type = excluded.content_type
            RETURNING id
            "#,
        )
        .bind(&emoji.id)
        .bind(&emoji.shortcode)
        .bind(&emoji.image_url)
        .bind(&emoji.content_type)
        .bind(&emoji.instance_id)
        .bind(emoji.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Custom emoji used by a note
    pub async fn get_note_emojis(&self, note_id: &str) -> Result<Vec<Emoji>, AppError> {
        let emojis = sqlx::query_as::<_, Emoji>(
            r#"
            SELECT e.* FROM emojis e
            JOIN note_emojis ne ON ne.emoji_id = e.id
            WHERE ne.note_id = ?
            ORDER BY e.shortcode
            "#,
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(emojis)
    }

    /// Insert or refresh an attachment keyed by remote URL
    pub async fn upsert_attachment(&self, attachment: &Attachment) -> Result<String, AppError> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO attachments (
                id, note_id, remote_url, media_type, description, blurhash,
                width, height, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(remote_url) DO UPDATE SET
                media_type = excluded.media_type,
                description = excluded.description,
                blurhash = excluded.blurhash,
                width = excluded.width,
                height = excluded.height
            RETURNING id
            "#,
        )
        .bind(&attachment.id)
        .bind(&attachment.note_id)
        .bind(&attachment.remote_url)
        .bind(&attachment.media_type)
        .bind(&attachment.description)
        .bind(&attachment.blurhash)
        .bind(attachment.width)
        .bind(attachment.height)
        .bind(attachment.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Attachments of a note
    pub async fn get_note_attachments(&self, note_id: &str) -> Result<Vec<Attachment>, AppError> {
        let attachments = sqlx::query_as::<_, Attachment>(
            "SELECT * FROM attachments WHERE note_id = ? ORDER BY id",
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attachments)
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Edge from `owner_id` to `subject_id`, if any
    pub async fn get_relationship(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let relationship = sqlx::query_as::<_, Relationship>(
            "SELECT * FROM relationships WHERE owner_id = ? AND subject_id = ?",
        )
        .bind(owner_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relationship)
    }

    /// Edge owned by `owner_id` that was created by the Follow activity `follow_uri`
    pub async fn get_relationship_by_follow_uri(
        &self,
        owner_id: &str,
        follow_uri: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let relationship = sqlx::query_as::<_, Relationship>(
            "SELECT * FROM relationships WHERE owner_id = ? AND follow_uri = ?",
        )
        .bind(owner_id)
        .bind(follow_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relationship)
    }

    /// Record a follow from `owner_id` to `subject_id`
    ///
    /// `following = false` records a pending request instead. Muting and endorsement flags of an existing edge are preserved.
    pub async fn upsert_follow(
        &self,
        owner_id: &str,
        subject_id: &str,
        following: bool,
        follow_uri: Option<&str>,
    ) -> Result<Relationship, AppError> {
        let now = Utc::now();
        let relationship = sqlx::query_as::<_, Relationship>(
            r#"
            INSERT INTO relationships (
                id, owner_id, subject_id, following, requested, muting, endorsed,
                follow_uri, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
            ON CONFLICT(owner_id, subject_id) DO UPDATE SET
                following = excluded.following,
                requested = excluded.requested,
                follow_uri = excluded.follow_uri,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(EntityId::new().0)
        .bind(owner_id)
        .bind(subject_id)
        .bind(following)
        .bind(!following)
        .bind(follow_uri)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(relationship)
    }

    /// Settle a pending follow request
    ///
    /// # Returns
    /// `false` when there was no pending request to settle.
    pub async fn settle_follow_request(
        &self,
        owner_id: &str,
        subject_id: &str,
        accepted: bool,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE relationships
            SET following = ?, requested = 0, updated_at = ?
            WHERE owner_id = ? AND subject_id = ? AND requested = 1
            "#,
        )
        .bind(accepted)
        .bind(Utc::now())
        .bind(owner_id)
        .bind(subject_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an edge by id
    pub async fn delete_relationship(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM relationships WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Whether `owner_id` follows `subject_id` (accepted follows only)
    pub async fn is_following(&self, owner_id: &str, subject_id: &str) -> Result<bool, AppError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM relationships WHERE owner_id = ? AND subject_id = ? AND following = 1",
        )
        .bind(owner_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Remote actors with an accepted follow toward `subject_id`
    pub async fn get_remote_followers(&self, subject_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN relationships r ON r.owner_id = a.id
            WHERE r.subject_id = ? AND r.following = 1 AND a.instance_id IS NOT NULL
            ORDER BY a.id
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(actors)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Insert a notification
    pub async fn insert_notification(&self, notification: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, origin_id, kind, note_id, read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.recipient_id)
        .bind(&notification.origin_id)
        .bind(notification.kind)
        .bind(&notification.note_id)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Notifications for a recipient, newest first
    pub async fn get_notifications(&self, recipient_id: &str) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE recipient_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }
}
