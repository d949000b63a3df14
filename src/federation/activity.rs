//! Activity processing
//!
//! Applies one authenticated inbound [`Activity`] to local state. The set of
//! kinds is closed; each has exactly one handler.

use std::sync::Arc;

use super::context::{FederationContext, UriKind};
use super::local_ref::LocalReferenceResolver;
use super::outbound::OutboundFederator;
use super::resolver::{NoteSource, Refresh};
use super::schema::{
    Activity, ActorObject, FollowObject, FollowResponseObject, NoteObject, PatchObject, UndoObject,
};
use crate::data::{Actor, Database, Notification, NotificationKind};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// Who an activity is attributed to after authentication
#[derive(Debug, Clone)]
pub enum Sender {
    /// Verified HTTP signature by this actor
    Signed(Actor),
    /// Trusted bridge; the author named in the activity is taken at its word
    Bridged,
}

/// Activity processor
///
/// Processes incoming activities addressed to a local inbox.
pub struct ActivityDispatcher {
    ctx: Arc<FederationContext>,
    db: Arc<Database>,
    resolver: LocalReferenceResolver,
    outbound: Arc<OutboundFederator>,
}

impl ActivityDispatcher {
    pub fn new(
        ctx: Arc<FederationContext>,
        db: Arc<Database>,
        resolver: LocalReferenceResolver,
        outbound: Arc<OutboundFederator>,
    ) -> Self {
        Self {
            ctx,
            db,
            resolver,
            outbound,
        }
    }

    /// Process an incoming activity
    ///
    /// # Arguments
    /// * `activity` - Parsed activity
    /// * `sender` - Authentication outcome
    /// * `inbox_owner` - Local actor whose inbox received the request
    ///
    /// # Errors
    /// - `Authentication` when the activity's author is not the signer
    /// - `Authorization` when the sender acts on something it does not own
    /// - resolution errors from nested fetches
    pub async fn dispatch(
        &self,
        activity: Activity,
        sender: Sender,
        inbox_owner: &Actor,
    ) -> Result<(), AppError> {
        let kind = activity.kind().as_str();
        let result = self.apply(activity, sender, inbox_owner).await;

        let outcome = if result.is_ok() { "accepted" } else { "rejected" };
        ACTIVITIES_RECEIVED.with_label_values(&[kind, outcome]).inc();
        if let Err(error) = &result {
            tracing::info!(activity_type = kind, %error, "Activity rejected");
        }
        result
    }

    async fn apply(
        &self,
        activity: Activity,
        sender: Sender,
        inbox_owner: &Actor,
    ) -> Result<(), AppError> {
        let sender = self.authenticate_author(&activity, sender).await?;
        if sender.is_local() {
            return Err(AppError::Authorization(
                "local actors cannot deliver to local inboxes".to_string(),
            ));
        }

        tracing::debug!(
            activity_type = activity.kind().as_str(),
            uri = %activity.uri(),
            sender = %self.ctx.actor_uri(&sender),
            "Dispatching activity"
        );

        match activity {
            Activity::Note(note) => self.handle_note(note).await,
            Activity::Follow(follow) => self.handle_follow(follow, &sender, inbox_owner).await,
            Activity::FollowAccept(response) => {
                self.handle_follow_response(response, &sender, inbox_owner, true)
                    .await
            }
            Activity::FollowReject(response) => {
                self.handle_follow_response(response, &sender, inbox_owner, false)
                    .await
            }
            Activity::Undo(undo) => self.handle_undo(undo, &sender).await,
            Activity::ActorUpdate(actor) => self.handle_actor_update(actor).await,
            Activity::Patch(patch) => self.handle_patch(patch, &sender).await,
        }
    }

    /// The actor the activity is attributed to
    async fn authenticate_author(
        &self,
        activity: &Activity,
        sender: Sender,
    ) -> Result<Actor, AppError> {
        match sender {
            Sender::Signed(signer) => {
                let signer_uri = self.ctx.actor_uri(&signer);
                if signer_uri != activity.author() {
                    return Err(AppError::Authentication(format!(
                        "activity author {} is not the signer {}",
                        activity.author(),
                        signer_uri
                    )));
                }
                Ok(signer)
            }
            Sender::Bridged => self.resolver.resolve_actor(activity.author()).await,
        }
    }

    /// Create or update a note from the payload
    async fn handle_note(&self, note: NoteObject) -> Result<(), AppError> {
        let note = self
            .resolver
            .remote()
            .resolve_note(NoteSource::Payload(Box::new(note)), Refresh::Force)
            .await?;

        tracing::info!(note_id = %note.id, "Stored note from inbox");
        Ok(())
    }

    /// Handle Follow activity
    async fn handle_follow(
        &self,
        follow: FollowObject,
        follower: &Actor,
        inbox_owner: &Actor,
    ) -> Result<(), AppError> {
        // 1. Target must be the inbox owner; remote targets never are
        let followee = match self.ctx.classify(&follow.followee)? {
            UriKind::Local(_) => self.resolver.resolve_actor(&follow.followee).await?,
            UriKind::Remote(_) => {
                return Err(AppError::Authorization(format!(
                    "follow target {} is not on this instance",
                    follow.followee
                )));
            }
        };
        if followee.id != inbox_owner.id {
            return Err(AppError::Authorization(format!(
                "follow target {} is not the inbox owner",
                follow.followee
            )));
        }

        // 2. Repeat deliveries change nothing
        if let Some(existing) = self.db.get_relationship(&follower.id, &followee.id).await? {
            if existing.following || existing.requested {
                tracing::debug!(
                    follower = %follower.id,
                    followee = %followee.id,
                    "Follow already recorded"
                );
                return Ok(());
            }
        }

        // 3. Record the edge
        let accepted = !followee.locked;
        self.db
            .upsert_follow(&follower.id, &followee.id, accepted, Some(&follow.uri))
            .await?;

        // 4. Notify
        let kind = if accepted {
            NotificationKind::Follow
        } else {
            NotificationKind::FollowRequest
        };
        self.db
            .insert_notification(&Notification::new(&followee.id, &follower.id, kind, None))
            .await?;

        // 5. Answer unlocked follows right away
        if accepted {
            let batch = self.outbound.follow_response(&followee, follower, true)?;
            tracing::info!(
                follower = %follower.id,
                followee = %followee.id,
                deliveries = batch.len(),
                "Follow accepted"
            );
        } else {
            tracing::info!(
                follower = %follower.id,
                followee = %followee.id,
                "Follow request pending approval"
            );
        }

        Ok(())
    }

    /// Handle FollowAccept / FollowReject from the remote followee
    async fn handle_follow_response(
        &self,
        response: FollowResponseObject,
        followee: &Actor,
        inbox_owner: &Actor,
        accepted: bool,
    ) -> Result<(), AppError> {
        let follower = self.resolver.resolve_actor(&response.follower).await?;
        if !follower.is_local() || follower.id != inbox_owner.id {
            return Err(AppError::Authorization(format!(
                "follower {} is not the inbox owner",
                response.follower
            )));
        }

        let settled = self
            .db
            .settle_follow_request(&follower.id, &followee.id, accepted)
            .await?;
        if settled {
            tracing::info!(
                follower = %follower.id,
                followee = %followee.id,
                accepted,
                "Follow request settled"
            );
        } else {
            tracing::debug!(
                follower = %follower.id,
                followee = %followee.id,
                "No pending follow request to settle"
            );
        }

        Ok(())
    }

    /// Handle Undo activity
    ///
    /// First match wins: the sender's note, the sender's follow edge, the
    /// sender itself.
    async fn handle_undo(&self, undo: UndoObject, sender: &Actor) -> Result<(), AppError> {
        if let Some(note) = self.db.get_note_by_uri(&undo.object).await? {
            if note.author_id == sender.id {
                self.db.delete_note(&note.id).await?;
                tracing::info!(note_id = %note.id, "Deleted note via Undo");
                return Ok(());
            }
        }

        if let Some(relationship) = self
            .db
            .get_relationship_by_follow_uri(&sender.id, &undo.object)
            .await?
        {
            self.db.delete_relationship(&relationship.id).await?;
            tracing::info!(
                follower = %sender.id,
                followee = %relationship.subject_id,
                "Removed follow via Undo"
            );
            return Ok(());
        }

        if undo.object == self.ctx.actor_uri(sender) {
            self.db.delete_actor(&sender.id).await?;
            tracing::info!(actor_id = %sender.id, "Deleted actor via Undo");
            return Ok(());
        }

        Err(AppError::Authorization(format!(
            "{} cannot undo {}",
            self.ctx.actor_uri(sender),
            undo.object
        )))
    }

    /// Re-fetch the sender, bypassing the stored copy
    async fn handle_actor_update(&self, actor: ActorObject) -> Result<(), AppError> {
        let actor = self
            .resolver
            .remote()
            .resolve_actor(&actor.uri, Refresh::Force)
            .await?;

        tracing::info!(actor_id = %actor.id, "Refreshed actor");
        Ok(())
    }

    /// Re-fetch a note the sender authored
    async fn handle_patch(&self, patch: PatchObject, sender: &Actor) -> Result<(), AppError> {
        self.db
            .get_note_by_uri(&patch.patched_uri)
            .await?
            .filter(|note| note.author_id == sender.id)
            .ok_or(AppError::NotFound)?;

        let note = self
            .resolver
            .remote()
            .resolve_note(NoteSource::Uri(patch.patched_uri), Refresh::Force)
            .await?;

        tracing::info!(note_id = %note.id, "Refreshed patched note");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EntityId, Note, NoteAssociations, Visibility};
    use crate::federation::context::test_support::test_context;
    use crate::federation::local_ref::LocalIndex;
    use crate::federation::resolver::{NoopSearchIndex, RemoteResolver};
    use crate::federation::schema::ContentFormat;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        dispatcher: ActivityDispatcher,
        db: Arc<Database>,
        ctx: Arc<FederationContext>,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let ctx = Arc::new(test_context());
        // Nothing in these tests may reach the network
        let http_client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all("http://127.0.0.1:9").unwrap())
            .build()
            .unwrap();
        let remote = Arc::new(RemoteResolver::new(
            ctx.clone(),
            db.clone(),
            http_client.clone(),
            Arc::new(NoopSearchIndex),
        ));
        let resolver = LocalReferenceResolver::new(LocalIndex::new(ctx.clone(), db.clone()), remote);
        let outbound = Arc::new(OutboundFederator::new(ctx.clone(), db.clone(), http_client));
        Fixture {
            dispatcher: ActivityDispatcher::new(ctx.clone(), db.clone(), resolver, outbound),
            db,
            ctx,
            _temp_dir: temp_dir,
        }
    }

    fn actor(username: &str) -> Actor {
        let now = Utc::now();
        Actor {
            id: EntityId::new().0,
            uri: None,
            username: username.to_string(),
            display_name: None,
            summary: None,
            avatar_url: None,
            header_url: None,
            public_key_pem: "public".to_string(),
            private_key_pem: Some("private".to_string()),
            inbox_uri: None,
            shared_inbox_uri: None,
            outbox_uri: None,
            followers_uri: None,
            following_uri: None,
            locked: false,
            instance_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn local(fixture: &Fixture, username: &str, locked: bool) -> Actor {
        let mut actor = actor(username);
        actor.locked = locked;
        fixture.db.insert_local_actor(&actor).await.unwrap();
        actor
    }

    /// Stored remote actor without a reachable inbox, so no delivery is attempted
    async fn remote(fixture: &Fixture, username: &str) -> Actor {
        let (instance, _) = fixture
            .db
            .ensure_instance("remote.test", "http://remote.test")
            .await
            .unwrap();
        let mut actor = actor(username);
        actor.uri = Some(format!("http://remote.test/users/{username}"));
        actor.private_key_pem = None;
        actor.instance_id = Some(instance.id);
        let upserted = fixture.db.upsert_remote_actor(&actor).await.unwrap();
        actor.id = upserted.id;
        actor
    }

    fn follow(fixture: &Fixture, follower: &Actor, followee: &Actor, n: u32) -> Activity {
        Activity::Follow(FollowObject {
            id: format!("f{n}"),
            uri: format!("http://remote.test/follows/{n}"),
            author: fixture.ctx.actor_uri(follower),
            followee: fixture.ctx.actor_uri(followee),
            created_at: Utc::now(),
        })
    }

    fn undo(fixture: &Fixture, sender: &Actor, object: &str) -> Activity {
        Activity::Undo(UndoObject {
            id: "u1".to_string(),
            uri: "http://remote.test/undos/1".to_string(),
            author: fixture.ctx.actor_uri(sender),
            object: object.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn stored_note(fixture: &Fixture, author: &Actor, uri: &str) -> Note {
        let now = Utc::now();
        let note = Note {
            id: EntityId::new().0,
            author_id: author.id.clone(),
            uri: Some(uri.to_string()),
            content: "<p>hi</p>".to_string(),
            source: None,
            visibility: Visibility::Public,
            sensitive: false,
            spoiler_text: None,
            reply_id: None,
            quote_id: None,
            created_at: now,
            updated_at: now,
        };
        let upserted = fixture
            .db
            .upsert_remote_note(&note, &NoteAssociations::default())
            .await
            .unwrap();
        Note {
            id: upserted.id,
            ..note
        }
    }

    #[tokio::test]
    async fn repeated_follow_creates_one_edge_and_one_notification() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;

        for n in 0..2 {
            fixture
                .dispatcher
                .dispatch(follow(&fixture, &bob, &alice, n), Sender::Signed(bob.clone()), &alice)
                .await
                .unwrap();
        }

        assert!(fixture.db.is_following(&bob.id, &alice.id).await.unwrap());
        let notifications = fixture.db.get_notifications(&alice.id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::Follow);
    }

    #[tokio::test]
    async fn follow_of_locked_actor_is_pending() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", true).await;
        let bob = remote(&fixture, "bob").await;

        fixture
            .dispatcher
            .dispatch(follow(&fixture, &bob, &alice, 0), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();

        let relationship = fixture
            .db
            .get_relationship(&bob.id, &alice.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!relationship.following);
        assert!(relationship.requested);
        let notifications = fixture.db.get_notifications(&alice.id).await.unwrap();
        assert_eq!(notifications[0].kind, NotificationKind::FollowRequest);
    }

    #[tokio::test]
    async fn follow_for_someone_else_is_rejected() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let dave = local(&fixture, "dave", false).await;
        let bob = remote(&fixture, "bob").await;

        let result = fixture
            .dispatcher
            .dispatch(follow(&fixture, &bob, &dave, 0), Sender::Signed(bob.clone()), &alice)
            .await;
        assert!(matches!(result, Err(AppError::Authorization(_))));
    }

    #[tokio::test]
    async fn author_must_match_signer() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        let mallory = remote(&fixture, "mallory").await;

        let result = fixture
            .dispatcher
            .dispatch(follow(&fixture, &bob, &alice, 0), Sender::Signed(mallory), &alice)
            .await;
        assert!(matches!(result, Err(AppError::Authentication(_))));
        assert!(fixture.db.get_relationship(&bob.id, &alice.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn follow_accept_settles_only_pending_requests() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        let response = |n: u32| {
            Activity::FollowAccept(FollowResponseObject {
                id: format!("a{n}"),
                uri: format!("http://remote.test/accepts/{n}"),
                author: fixture.ctx.actor_uri(&bob),
                follower: fixture.ctx.actor_uri(&alice),
                created_at: Utc::now(),
            })
        };

        // Nothing pending: no-op
        fixture
            .dispatcher
            .dispatch(response(0), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();
        assert!(fixture.db.get_relationship(&alice.id, &bob.id).await.unwrap().is_none());

        fixture
            .db
            .upsert_follow(&alice.id, &bob.id, false, None)
            .await
            .unwrap();
        fixture
            .dispatcher
            .dispatch(response(1), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();

        let relationship = fixture
            .db
            .get_relationship(&alice.id, &bob.id)
            .await
            .unwrap()
            .unwrap();
        assert!(relationship.following);
        assert!(!relationship.requested);
    }

    #[tokio::test]
    async fn follow_reject_clears_pending_request() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        fixture
            .db
            .upsert_follow(&alice.id, &bob.id, false, None)
            .await
            .unwrap();

        let reject = Activity::FollowReject(FollowResponseObject {
            id: "r1".to_string(),
            uri: "http://remote.test/rejects/1".to_string(),
            author: fixture.ctx.actor_uri(&bob),
            follower: fixture.ctx.actor_uri(&alice),
            created_at: Utc::now(),
        });
        fixture
            .dispatcher
            .dispatch(reject, Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();

        let relationship = fixture
            .db
            .get_relationship(&alice.id, &bob.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!relationship.following);
        assert!(!relationship.requested);
    }

    #[tokio::test]
    async fn follow_of_remote_target_is_rejected_without_fetching() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;

        let activity = Activity::Follow(FollowObject {
            id: "f1".to_string(),
            uri: "http://remote.test/follows/1".to_string(),
            author: fixture.ctx.actor_uri(&bob),
            followee: "http://elsewhere.test/users/zed".to_string(),
            created_at: Utc::now(),
        });
        let result = fixture
            .dispatcher
            .dispatch(activity, Sender::Signed(bob.clone()), &alice)
            .await;

        assert!(matches!(result, Err(AppError::Authorization(_))));
        assert!(
            fixture
                .db
                .get_actor_by_uri("http://elsewhere.test/users/zed")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn undo_of_another_actors_note_is_unauthorized() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        let carol = remote(&fixture, "carol").await;
        let note = stored_note(&fixture, &carol, "http://remote.test/notes/1").await;

        let result = fixture
            .dispatcher
            .dispatch(
                undo(&fixture, &bob, note.uri.as_deref().unwrap()),
                Sender::Signed(bob.clone()),
                &alice,
            )
            .await;

        assert!(matches!(result, Err(AppError::Authorization(_))));
        assert!(fixture.db.get_note(&note.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn undo_removes_own_note_then_follow_then_account() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        let note = stored_note(&fixture, &bob, "http://remote.test/notes/2").await;

        fixture
            .dispatcher
            .dispatch(
                undo(&fixture, &bob, "http://remote.test/notes/2"),
                Sender::Signed(bob.clone()),
                &alice,
            )
            .await
            .unwrap();
        assert!(fixture.db.get_note(&note.id).await.unwrap().is_none());

        fixture
            .dispatcher
            .dispatch(follow(&fixture, &bob, &alice, 7), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();
        fixture
            .dispatcher
            .dispatch(
                undo(&fixture, &bob, "http://remote.test/follows/7"),
                Sender::Signed(bob.clone()),
                &alice,
            )
            .await
            .unwrap();
        assert!(fixture.db.get_relationship(&bob.id, &alice.id).await.unwrap().is_none());

        let bob_uri = fixture.ctx.actor_uri(&bob);
        fixture
            .dispatcher
            .dispatch(undo(&fixture, &bob, &bob_uri), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();
        assert!(fixture.db.get_actor(&bob.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patch_of_unknown_note_is_not_found() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;

        let patch = Activity::Patch(PatchObject {
            id: "p1".to_string(),
            uri: "http://remote.test/patches/1".to_string(),
            author: fixture.ctx.actor_uri(&bob),
            patched_uri: "http://remote.test/notes/unknown".to_string(),
            patched_at: Utc::now(),
        });

        let result = fixture
            .dispatcher
            .dispatch(patch, Sender::Signed(bob.clone()), &alice)
            .await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn note_payload_is_upserted_in_place() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        let note = |text: &str| {
            Activity::Note(NoteObject {
                id: "n1".to_string(),
                uri: "http://remote.test/notes/n1".to_string(),
                author: fixture.ctx.actor_uri(&bob),
                created_at: Utc::now(),
                content: ContentFormat::new(None, Some(text.to_string())),
                attachments: Vec::new(),
                mentions: Vec::new(),
                replies_to: None,
                quotes: None,
                is_sensitive: false,
                subject: None,
                visibility: Visibility::Public,
                emojis: Vec::new(),
            })
        };

        fixture
            .dispatcher
            .dispatch(note("first"), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();
        fixture
            .dispatcher
            .dispatch(note("second"), Sender::Signed(bob.clone()), &alice)
            .await
            .unwrap();

        let stored = fixture
            .db
            .get_note_by_uri("http://remote.test/notes/n1")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.content.contains("second"));
    }

    #[tokio::test]
    async fn note_reusing_another_authors_uri_is_unauthorized() {
        let fixture = fixture().await;
        let alice = local(&fixture, "alice", false).await;
        let bob = remote(&fixture, "bob").await;
        let carol = remote(&fixture, "carol").await;
        let original = stored_note(&fixture, &carol, "http://remote.test/notes/c1").await;

        let forged = Activity::Note(NoteObject {
            id: "c1".to_string(),
            uri: "http://remote.test/notes/c1".to_string(),
            author: fixture.ctx.actor_uri(&bob),
            created_at: Utc::now(),
            content: ContentFormat::new(None, Some("overwritten".to_string())),
            attachments: Vec::new(),
            mentions: Vec::new(),
            replies_to: None,
            quotes: None,
            is_sensitive: false,
            subject: None,
            visibility: Visibility::Direct,
            emojis: Vec::new(),
        });
        let result = fixture
            .dispatcher
            .dispatch(forged, Sender::Signed(bob.clone()), &alice)
            .await;

        assert!(matches!(result, Err(AppError::Authorization(_))));
        let stored = fixture.db.get_note(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.author_id, carol.id);
        assert_eq!(stored.content, "<p>hi</p>");
        assert_eq!(stored.visibility, Visibility::Public);
    }
}
