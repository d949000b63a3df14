//! Account service
//!
//! Local actor lifecycle: creation with a fresh key pair, profile edits,
//! and manual handling of follow requests for locked accounts.

use std::sync::Arc;

use chrono::Utc;

use super::note::render_plain_text;
use crate::config::is_valid_username;
use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;
use crate::federation::{DeliveryBatch, FederationContext, OutboundFederator};

#[cfg(test)]
const ACTOR_KEY_BITS: usize = 1024;
#[cfg(not(test))]
const ACTOR_KEY_BITS: usize = 2048;

fn normalize_optional_text(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Profile fields to change; `None` leaves a field alone
///
/// For text fields, `Some("")` clears the value.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    /// Plain text, rendered to HTML on save
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub header_url: Option<String>,
    pub locked: Option<bool>,
}

/// Account service
pub struct AccountService {
    ctx: Arc<FederationContext>,
    db: Arc<Database>,
    outbound: Arc<OutboundFederator>,
}

impl AccountService {
    pub fn new(
        ctx: Arc<FederationContext>,
        db: Arc<Database>,
        outbound: Arc<OutboundFederator>,
    ) -> Self {
        Self { ctx, db, outbound }
    }

    /// Get a local actor by id
    pub async fn get_local_actor(&self, id: &str) -> Result<Actor, AppError> {
        self.db
            .get_actor(id)
            .await?
            .filter(Actor::is_local)
            .ok_or(AppError::NotFound)
    }

    /// Create a local actor
    ///
    /// Generates an RSA key pair for signing deliveries.
    ///
    /// # Errors
    /// `Validation` for an invalid or taken username
    pub async fn create_local_actor(
        &self,
        username: &str,
        display_name: Option<String>,
        locked: bool,
    ) -> Result<Actor, AppError> {
        let username = username.trim();
        if !is_valid_username(username) {
            return Err(AppError::Validation(format!(
                "invalid username {username:?}"
            )));
        }

        // Fast-path guard before expensive key generation.
        if self.db.get_local_actor_by_username(username).await?.is_some() {
            return Err(AppError::Validation(format!(
                "username {username} is already taken"
            )));
        }

        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(|| -> Result<(String, String), anyhow::Error> {
                use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
                use rsa::{RsaPrivateKey, RsaPublicKey};

                let mut rng = rand::thread_rng();
                let private_key = RsaPrivateKey::new(&mut rng, ACTOR_KEY_BITS)?;
                let public_key = RsaPublicKey::from(&private_key);
                let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
                let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
                Ok((private_key_pem, public_key_pem))
            })
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .map_err(AppError::Internal)?;

        let id = EntityId::new().0;
        let actor_uri = self.ctx.local_actor_uri(&id);
        let now = Utc::now();
        let actor = Actor {
            inbox_uri: Some(self.ctx.local_inbox_uri(&id)),
            outbox_uri: Some(format!("{actor_uri}/outbox")),
            followers_uri: Some(format!("{actor_uri}/followers")),
            following_uri: Some(format!("{actor_uri}/following")),
            id,
            uri: None,
            username: username.to_string(),
            display_name: display_name.and_then(normalize_optional_text),
            summary: None,
            avatar_url: None,
            header_url: None,
            public_key_pem,
            private_key_pem: Some(private_key_pem),
            shared_inbox_uri: None,
            locked,
            instance_id: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_local_actor(&actor).await?;
        tracing::info!(actor_id = %actor.id, username = %actor.username, "Local actor created");

        Ok(actor)
    }

    /// Apply a profile update and publish it to remote followers
    pub async fn update_profile(
        &self,
        actor_id: &str,
        update: ProfileUpdate,
    ) -> Result<(Actor, DeliveryBatch), AppError> {
        let before = self.get_local_actor(actor_id).await?;
        let mut after = before.clone();

        if let Some(display_name) = update.display_name {
            after.display_name = normalize_optional_text(display_name);
        }
        if let Some(summary) = update.summary {
            after.summary = normalize_optional_text(summary).map(|text| render_plain_text(&text));
        }
        if let Some(avatar_url) = update.avatar_url {
            after.avatar_url = normalize_optional_text(avatar_url);
        }
        if let Some(header_url) = update.header_url {
            after.header_url = normalize_optional_text(header_url);
        }
        if let Some(locked) = update.locked {
            after.locked = locked;
        }

        if !before.differs_materially(&after) {
            return Ok((before, DeliveryBatch::empty()));
        }

        after.updated_at = Utc::now();
        self.db.update_local_actor(&after).await?;
        let batch = self.outbound.actor_updated(&before, &after).await?;

        Ok((after, batch))
    }

    /// Approve a pending follow request to a local actor
    pub async fn accept_follow_request(
        &self,
        followee_id: &str,
        follower_id: &str,
    ) -> Result<DeliveryBatch, AppError> {
        self.settle_follow_request(followee_id, follower_id, true)
            .await
    }

    /// Decline a pending follow request to a local actor
    pub async fn reject_follow_request(
        &self,
        followee_id: &str,
        follower_id: &str,
    ) -> Result<DeliveryBatch, AppError> {
        self.settle_follow_request(followee_id, follower_id, false)
            .await
    }

    async fn settle_follow_request(
        &self,
        followee_id: &str,
        follower_id: &str,
        accepted: bool,
    ) -> Result<DeliveryBatch, AppError> {
        let followee = self.get_local_actor(followee_id).await?;
        let follower = self
            .db
            .get_actor(follower_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if !self
            .db
            .settle_follow_request(&follower.id, &followee.id, accepted)
            .await?
        {
            return Err(AppError::NotFound);
        }

        tracing::info!(
            follower = %follower.id,
            followee = %followee.id,
            accepted,
            "Follow request settled locally"
        );
        self.outbound.follow_response(&followee, &follower, accepted)
    }
}
