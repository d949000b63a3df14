//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Parse an id segment taken from a local URI
    pub fn parse(raw: &str) -> Option<Self> {
        ulid::Ulid::from_string(raw)
            .ok()
            .map(|ulid| Self(ulid.to_string()))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Instance
// =============================================================================

/// Remote origin we have talked to at least once
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: String,
    /// `host[:port]`
    pub domain: String,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Actor
// =============================================================================

/// A local or remote user
///
/// Local actors have no stored `uri` and no `instance_id`; their URI is
/// derived from the instance base URL and the id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    pub uri: Option<String>,
    pub username: String,
    pub display_name: Option<String>,
    /// Sanitized HTML
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub header_url: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format), local actors only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub inbox_uri: Option<String>,
    pub shared_inbox_uri: Option<String>,
    pub outbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub following_uri: Option<String>,
    /// Follow requests need manual approval
    pub locked: bool,
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.instance_id.is_none()
    }

    /// Inbox deliveries should go to, shared inbox first
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox_uri
            .as_deref()
            .or(self.inbox_uri.as_deref())
            .filter(|inbox| !inbox.trim().is_empty())
    }

    /// Whether a change from `self` to `other` must be federated.
    ///
    /// Timestamps and the private key are not part of the published
    /// representation and never count.
    pub fn differs_materially(&self, other: &Actor) -> bool {
        self.username != other.username
            || self.display_name != other.display_name
            || self.summary != other.summary
            || self.avatar_url != other.avatar_url
            || self.header_url != other.header_url
            || self.public_key_pem != other.public_key_pem
            || self.locked != other.locked
            || self.inbox_uri != other.inbox_uri
            || self.shared_inbox_uri != other.shared_inbox_uri
            || self.outbox_uri != other.outbox_uri
            || self.followers_uri != other.followers_uri
            || self.following_uri != other.following_uri
    }
}

// =============================================================================
// Note
// =============================================================================

/// Audience of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    /// Followers only
    Private,
    /// Mentioned actors only
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }

    /// Public and unlisted notes can be shown to anyone, including anonymous viewers
    pub fn is_world_readable(&self) -> bool {
        matches!(self, Self::Public | Self::Unlisted)
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            "private" => Ok(Self::Private),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

/// A post, local (no stored uri) or remote
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    pub author_id: String,
    pub uri: Option<String>,
    /// Rendered, sanitized HTML
    pub content: String,
    /// Plain-text source, if known
    pub source: Option<String>,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub spoiler_text: Option<String>,
    pub reply_id: Option<String>,
    pub quote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Association sets replaced together with a note upsert
#[derive(Debug, Clone, Default)]
pub struct NoteAssociations {
    pub mention_ids: Vec<String>,
    pub emoji_ids: Vec<String>,
    pub attachment_ids: Vec<String>,
}

/// Outcome of an idempotent insert-or-update keyed by uri
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub id: String,
    /// `false` when an existing row was updated in place
    pub created: bool,
}

// =============================================================================
// Custom emoji / attachments
// =============================================================================

/// Custom emoji, unique per image URL
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Emoji {
    pub id: String,
    pub shortcode: String,
    pub image_url: String,
    pub content_type: Option<String>,
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Remote media reference, unique per remote URL
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: String,
    pub note_id: Option<String>,
    pub remote_url: String,
    pub media_type: String,
    pub description: Option<String>,
    pub blurhash: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relationship
// =============================================================================

/// Directed edge from `owner_id` to `subject_id`
///
/// `following` and `requested` are never both set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relationship {
    pub id: String,
    pub owner_id: String,
    pub subject_id: String,
    pub following: bool,
    pub requested: bool,
    pub muting: bool,
    pub endorsed: bool,
    /// URI of the Follow activity that created the edge
    pub follow_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Notification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum NotificationKind {
    Follow,
    FollowRequest,
    Mention,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::FollowRequest => "follow_request",
            Self::Mention => "mention",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub origin_id: String,
    pub kind: NotificationKind,
    pub note_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient_id: &str,
        origin_id: &str,
        kind: NotificationKind,
        note_id: Option<&str>,
    ) -> Self {
        Self {
            id: EntityId::new().0,
            recipient_id: recipient_id.to_string(),
            origin_id: origin_id.to_string(),
            kind,
            note_id: note_id.map(str::to_string),
            read: false,
            created_at: Utc::now(),
        }
    }
}
