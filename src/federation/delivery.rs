//! Activity delivery
//!
//! Signed POSTs to remote inboxes, run on a bounded in-process queue.
//! Each target is one job: network errors, timeouts, 429 and 5xx answers
//! are retried with exponential backoff; any other non-2xx answer is final.
//! Nothing is persisted, a restart drops jobs in flight.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::context::{DeliverySettings, FederationContext};
use super::resolver::FEDERATION_MEDIA_TYPE;
use super::signature::sign_request;
use crate::data::Actor;
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_ATTEMPTS_TOTAL};

/// Longest pause between two attempts
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Signs and sends requests on behalf of one local actor
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: reqwest::Client,
    /// Key ID for signatures
    key_id: String,
    /// Private key for signing
    private_key_pem: String,
}

/// Result of delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_uri: String,
    pub success: bool,
    pub error: Option<String>,
    pub status_code: Option<u16>,
    pub attempts: u32,
}

enum AttemptOutcome {
    Delivered(StatusCode),
    Retryable(String, Option<StatusCode>),
    Rejected(String, Option<StatusCode>),
}

impl ActivityDelivery {
    /// Delivery service signing as `actor`
    ///
    /// # Errors
    /// `Validation` if `actor` has no private key (i.e. is not local)
    pub fn for_actor(
        ctx: &FederationContext,
        http_client: reqwest::Client,
        actor: &Actor,
    ) -> Result<Self, AppError> {
        let private_key_pem = actor.private_key_pem.clone().ok_or_else(|| {
            AppError::Validation(format!("actor {} cannot sign deliveries", actor.id))
        })?;

        Ok(Self {
            http_client,
            key_id: ctx.key_id(actor),
            private_key_pem,
        })
    }

    /// One signed POST of `body` to `inbox_uri`
    async fn attempt(&self, inbox_uri: &str, body: &[u8]) -> AttemptOutcome {
        let sig_headers = match sign_request(
            "POST",
            inbox_uri,
            Some(body),
            &self.private_key_pem,
            &self.key_id,
        ) {
            Ok(headers) => headers,
            Err(error) => return AttemptOutcome::Rejected(error.to_string(), None),
        };

        let mut request = self
            .http_client
            .post(inbox_uri)
            .header(reqwest::header::CONTENT_TYPE, FEDERATION_MEDIA_TYPE)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);
        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        match request.body(body.to_vec()).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    AttemptOutcome::Delivered(status)
                } else if should_retry_status(status) {
                    AttemptOutcome::Retryable(format!("HTTP {status}"), Some(status))
                } else {
                    AttemptOutcome::Rejected(format!("HTTP {status}"), Some(status))
                }
            }
            Err(e) => AttemptOutcome::Retryable(e.to_string(), None),
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Delay before attempt `attempt + 1`, doubling from `base` with up to 50% jitter
fn next_backoff(base: Duration, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << pow).min(MAX_BACKOFF);
    let jitter_cap = (delay.as_millis() as u64 / 2).max(1);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
    delay + jitter
}

/// Deliveries enqueued together
///
/// Dropping the batch leaves the jobs running.
pub struct DeliveryBatch {
    handles: Vec<JoinHandle<DeliveryResult>>,
}

impl DeliveryBatch {
    pub fn empty() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every job to finish
    pub async fn wait(self) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "Batch delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }
}

/// Bounded-concurrency executor for signed deliveries
#[derive(Clone)]
pub struct DeliveryQueue {
    ctx: Arc<FederationContext>,
    semaphore: Arc<Semaphore>,
}

impl DeliveryQueue {
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        let semaphore = Arc::new(Semaphore::new(ctx.delivery().max_concurrency));
        Self { ctx, semaphore }
    }

    /// Enqueue one job per inbox and return without waiting
    pub fn enqueue(
        &self,
        delivery: ActivityDelivery,
        activity_type: &'static str,
        body: Vec<u8>,
        inbox_uris: Vec<String>,
    ) -> DeliveryBatch {
        let delivery = Arc::new(delivery);
        let body: Arc<[u8]> = body.into();

        let handles = inbox_uris
            .into_iter()
            .map(|inbox_uri| {
                let job = DeliveryJob {
                    ctx: self.ctx.clone(),
                    semaphore: self.semaphore.clone(),
                    delivery: delivery.clone(),
                    body: body.clone(),
                    activity_type,
                    inbox_uri,
                };
                tokio::spawn(job.run())
            })
            .collect();

        DeliveryBatch { handles }
    }
}

struct DeliveryJob {
    ctx: Arc<FederationContext>,
    semaphore: Arc<Semaphore>,
    delivery: Arc<ActivityDelivery>,
    body: Arc<[u8]>,
    activity_type: &'static str,
    inbox_uri: String,
}

impl DeliveryJob {
    async fn run(self) -> DeliveryResult {
        let settings: &DeliverySettings = self.ctx.delivery();
        let mut last_error = None;
        let mut last_status = None;
        let mut attempts = 0;

        let reachable = match url::Url::parse(&self.inbox_uri) {
            Ok(url) => self.ctx.ensure_reachable(&url).await,
            Err(e) => Err(AppError::MalformedUri(format!("{}: {e}", self.inbox_uri))),
        };
        if let Err(error) = reachable {
            return self.finish(false, Some(error.to_string()), None, 0);
        }

        while attempts < settings.max_attempts {
            attempts += 1;

            let outcome = {
                let _permit = match self.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return self.finish(
                            false,
                            Some("delivery queue closed".to_string()),
                            None,
                            attempts,
                        );
                    }
                };
                tokio::time::timeout(
                    settings.attempt_timeout,
                    self.delivery.attempt(&self.inbox_uri, &self.body),
                )
                .await
                .unwrap_or_else(|_| {
                    AttemptOutcome::Retryable(
                        format!("timed out after {:?}", settings.attempt_timeout),
                        None,
                    )
                })
            };

            match outcome {
                AttemptOutcome::Delivered(status) => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                    return self.finish(true, None, Some(status), attempts);
                }
                AttemptOutcome::Rejected(error, status) => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["rejected"]).inc();
                    return self.finish(false, Some(error), status, attempts);
                }
                AttemptOutcome::Retryable(error, status) => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["retryable"]).inc();
                    tracing::debug!(
                        inbox = %self.inbox_uri,
                        attempt = attempts,
                        error = %error,
                        "Delivery attempt failed"
                    );
                    last_error = Some(error);
                    last_status = status;
                }
            }

            if attempts < settings.max_attempts {
                tokio::time::sleep(next_backoff(settings.base_backoff, attempts)).await;
            }
        }

        self.finish(false, last_error, last_status, attempts)
    }

    fn finish(
        &self,
        success: bool,
        error: Option<String>,
        status: Option<StatusCode>,
        attempts: u32,
    ) -> DeliveryResult {
        let label = if success { "success" } else { "failure" };
        DELIVERIES_TOTAL
            .with_label_values(&[self.activity_type, label])
            .inc();

        if success {
            tracing::info!(
                inbox = %self.inbox_uri,
                activity_type = self.activity_type,
                attempts,
                "Delivered activity"
            );
        } else {
            tracing::warn!(
                inbox = %self.inbox_uri,
                activity_type = self.activity_type,
                attempts,
                error = error.as_deref().unwrap_or("unknown"),
                "Giving up on delivery"
            );
        }

        DeliveryResult {
            inbox_uri: self.inbox_uri.clone(),
            success,
            error,
            status_code: status.map(|s| s.as_u16()),
            attempts,
        }
    }
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
pub fn unique_inbox_targets(inbox_uris: impl IntoIterator<Item = String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox_uri| seen.insert(inbox_uri.clone()))
        .collect()
}

/// Wire representations of local entities
pub mod builder {
    use chrono::Utc;

    use crate::data::{Actor, Attachment, EntityId, Emoji, Note};
    use crate::federation::context::FederationContext;
    use crate::federation::schema::{
        ActorObject, AttachmentObject, ContentFormat, CustomEmojiObject, FollowResponseObject,
        NoteObject, PublicKeyObject, UndoObject,
    };

    /// Canonical `User` document of a local actor
    pub fn actor(ctx: &FederationContext, actor: &Actor) -> ActorObject {
        let uri = ctx.actor_uri(actor);
        ActorObject {
            id: actor.id.clone(),
            uri: uri.clone(),
            username: actor.username.clone(),
            display_name: actor.display_name.clone(),
            bio: actor
                .summary
                .as_ref()
                .map(|summary| ContentFormat::new(Some(summary.clone()), None)),
            avatar: actor.avatar_url.clone(),
            header: actor.header_url.clone(),
            public_key: PublicKeyObject {
                actor: uri.clone(),
                public_key: actor.public_key_pem.clone(),
            },
            manually_approves_followers: actor.locked,
            inbox: actor
                .inbox_uri
                .clone()
                .unwrap_or_else(|| ctx.local_inbox_uri(&actor.id)),
            shared_inbox: actor.shared_inbox_uri.clone(),
            outbox: actor.outbox_uri.clone(),
            followers: actor.followers_uri.clone(),
            following: actor.following_uri.clone(),
            created_at: Some(actor.created_at),
        }
    }

    /// Canonical `Note` document
    #[allow(clippy::too_many_arguments)]
    pub fn note(
        ctx: &FederationContext,
        note: &Note,
        author: &Actor,
        mentions: &[Actor],
        emojis: &[Emoji],
        attachments: &[Attachment],
        replies_to: Option<String>,
        quotes: Option<String>,
    ) -> NoteObject {
        NoteObject {
            id: note.id.clone(),
            uri: ctx.note_uri(note),
            author: ctx.actor_uri(author),
            created_at: note.created_at,
            content: ContentFormat::new(Some(note.content.clone()), note.source.clone()),
            attachments: attachments
                .iter()
                .map(|attachment| AttachmentObject {
                    url: attachment.remote_url.clone(),
                    media_type: attachment.media_type.clone(),
                    description: attachment.description.clone(),
                    blurhash: attachment.blurhash.clone(),
                    width: attachment.width,
                    height: attachment.height,
                })
                .collect(),
            mentions: mentions.iter().map(|actor| ctx.actor_uri(actor)).collect(),
            replies_to,
            quotes,
            is_sensitive: note.sensitive,
            subject: note.spoiler_text.clone(),
            visibility: note.visibility,
            emojis: emojis
                .iter()
                .map(|emoji| CustomEmojiObject {
                    name: emoji.shortcode.clone(),
                    url: emoji.image_url.clone(),
                    media_type: emoji.content_type.clone(),
                })
                .collect(),
        }
    }

    /// FollowAccept/FollowReject body sent by `followee` to `follower_uri`
    pub fn follow_response(
        ctx: &FederationContext,
        followee: &Actor,
        follower_uri: &str,
    ) -> FollowResponseObject {
        let id = EntityId::new().0;
        FollowResponseObject {
            uri: format!("{}/activities/{}", ctx.actor_uri(followee), id),
            id,
            author: ctx.actor_uri(followee),
            follower: follower_uri.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Undo of `object_uri` by `author`
    pub fn undo(ctx: &FederationContext, author: &Actor, object_uri: &str) -> UndoObject {
        let id = EntityId::new().0;
        UndoObject {
            uri: format!("{}/activities/{}", ctx.actor_uri(author), id),
            id,
            author: ctx.actor_uri(author),
            object: object_uri.to_string(),
            created_at: Utc::now(),
        }
    }
}
