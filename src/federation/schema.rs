//! Federation wire schema
//!
//! Every inbound body and every fetched document is one JSON object
//! discriminated by `type`. Parsing is strict about required fields and
//! lenient about unknown ones.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Visibility;
use crate::error::AppError;

/// Content keyed by MIME type
///
/// ```json
/// { "text/html": { "content": "<p>hi</p>" }, "text/plain": { "content": "hi" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFormat(pub BTreeMap<String, ContentEntry>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub content: String,
}

impl ContentFormat {
    pub fn new(html: Option<String>, plain: Option<String>) -> Self {
        let mut formats = BTreeMap::new();
        if let Some(content) = html {
            formats.insert("text/html".to_string(), ContentEntry { content });
        }
        if let Some(content) = plain {
            formats.insert("text/plain".to_string(), ContentEntry { content });
        }
        Self(formats)
    }

    pub fn html(&self) -> Option<&str> {
        self.0.get("text/html").map(|entry| entry.content.as_str())
    }

    pub fn plain(&self) -> Option<&str> {
        self.0.get("text/plain").map(|entry| entry.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKeyObject {
    /// Owner of the key
    pub actor: String,
    /// SPKI PEM
    pub public_key: String,
}

/// A user document (`type: "User"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorObject {
    pub id: String,
    pub uri: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<ContentFormat>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
    pub public_key: PublicKeyObject,
    #[serde(default)]
    pub manually_approves_followers: bool,
    pub inbox: String,
    #[serde(default)]
    pub shared_inbox: Option<String>,
    #[serde(default)]
    pub outbox: Option<String>,
    #[serde(default)]
    pub followers: Option<String>,
    #[serde(default)]
    pub following: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentObject {
    pub url: String,
    pub media_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub blurhash: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEmojiObject {
    /// Shortcode without colons
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// A note document (`type: "Note"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteObject {
    pub id: String,
    pub uri: String,
    /// Author actor uri
    pub author: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub content: ContentFormat,
    #[serde(default)]
    pub attachments: Vec<AttachmentObject>,
    /// Mentioned actor uris
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub replies_to: Option<String>,
    #[serde(default)]
    pub quotes: Option<String>,
    #[serde(default)]
    pub is_sensitive: bool,
    /// Spoiler text
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default)]
    pub emojis: Vec<CustomEmojiObject>,
}

fn default_visibility() -> Visibility {
    Visibility::Public
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowObject {
    pub id: String,
    pub uri: String,
    pub author: String,
    pub followee: String,
    pub created_at: DateTime<Utc>,
}

/// Body of both FollowAccept and FollowReject; `author` is the followee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowResponseObject {
    pub id: String,
    pub uri: String,
    pub author: String,
    pub follower: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoObject {
    pub id: String,
    pub uri: String,
    pub author: String,
    /// Uri of the note, Follow activity or actor being undone
    pub object: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchObject {
    pub id: String,
    pub uri: String,
    pub author: String,
    pub patched_uri: String,
    pub patched_at: DateTime<Utc>,
}

/// Supported `type` discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Note,
    Follow,
    FollowAccept,
    FollowReject,
    Undo,
    /// Wire name `User`
    ActorUpdate,
    Patch,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "Note",
            Self::Follow => "Follow",
            Self::FollowAccept => "FollowAccept",
            Self::FollowReject => "FollowReject",
            Self::Undo => "Undo",
            Self::ActorUpdate => "User",
            Self::Patch => "Patch",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Note" => Ok(Self::Note),
            "Follow" => Ok(Self::Follow),
            "FollowAccept" => Ok(Self::FollowAccept),
            "FollowReject" => Ok(Self::FollowReject),
            "Undo" => Ok(Self::Undo),
            "User" => Ok(Self::ActorUpdate),
            "Patch" => Ok(Self::Patch),
            other => Err(AppError::UnsupportedActivity(other.to_string())),
        }
    }
}

/// One inbound or outbound federation object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Activity {
    Note(NoteObject),
    Follow(FollowObject),
    FollowAccept(FollowResponseObject),
    FollowReject(FollowResponseObject),
    Undo(UndoObject),
    #[serde(rename = "User")]
    ActorUpdate(ActorObject),
    Patch(PatchObject),
}

impl Activity {
    /// Parse a raw body
    ///
    /// # Errors
    /// - `UnsupportedActivity` when `type` names something outside the closed set
    /// - `SchemaValidation` when the body is not JSON, has no `type`, or a
    ///   supported type fails to parse
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AppError::SchemaValidation(format!("body is not JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(|kind| kind.as_str())
            .ok_or_else(|| AppError::SchemaValidation("missing type".to_string()))?
            .parse::<ActivityKind>()?;

        let activity: Activity = serde_json::from_value(value)
            .map_err(|e| AppError::SchemaValidation(format!("invalid {}: {e}", kind.as_str())))?;
        activity.validate()?;
        Ok(activity)
    }

    pub fn kind(&self) -> ActivityKind {
        match self {
            Self::Note(_) => ActivityKind::Note,
            Self::Follow(_) => ActivityKind::Follow,
            Self::FollowAccept(_) => ActivityKind::FollowAccept,
            Self::FollowReject(_) => ActivityKind::FollowReject,
            Self::Undo(_) => ActivityKind::Undo,
            Self::ActorUpdate(_) => ActivityKind::ActorUpdate,
            Self::Patch(_) => ActivityKind::Patch,
        }
    }

    /// Actor uri responsible for the activity
    pub fn author(&self) -> &str {
        match self {
            Self::Note(note) => &note.author,
            Self::Follow(follow) => &follow.author,
            Self::FollowAccept(response) | Self::FollowReject(response) => &response.author,
            Self::Undo(undo) => &undo.author,
            Self::ActorUpdate(actor) => &actor.uri,
            Self::Patch(patch) => &patch.author,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::Note(note) => &note.uri,
            Self::Follow(follow) => &follow.uri,
            Self::FollowAccept(response) | Self::FollowReject(response) => &response.uri,
            Self::Undo(undo) => &undo.uri,
            Self::ActorUpdate(actor) => &actor.uri,
            Self::Patch(patch) => &patch.uri,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        let mut uris = vec![self.uri(), self.author()];
        match self {
            Self::Note(note) => note.collect_uris(&mut uris),
            Self::Follow(follow) => uris.push(&follow.followee),
            Self::FollowAccept(response) | Self::FollowReject(response) => {
                uris.push(&response.follower)
            }
            Self::Undo(undo) => uris.push(&undo.object),
            Self::ActorUpdate(actor) => actor.collect_uris(&mut uris),
            Self::Patch(patch) => uris.push(&patch.patched_uri),
        }
        uris.into_iter()
            .try_for_each(require_http_uri)
            .map_err(AppError::SchemaValidation)
    }
}

impl ActorObject {
    /// Check a fetched actor document
    pub fn validate(&self) -> Result<(), String> {
        let mut uris = vec![self.uri.as_str()];
        self.collect_uris(&mut uris);
        uris.into_iter().try_for_each(require_http_uri)?;
        if self.username.trim().is_empty() {
            return Err("username must not be empty".to_string());
        }
        if self.public_key.actor != self.uri {
            return Err("public key belongs to another actor".to_string());
        }
        Ok(())
    }

    fn collect_uris<'a>(&'a self, uris: &mut Vec<&'a str>) {
        uris.push(&self.inbox);
        uris.extend(self.shared_inbox.as_deref());
        uris.extend(self.outbox.as_deref());
        uris.extend(self.followers.as_deref());
        uris.extend(self.following.as_deref());
    }
}

impl NoteObject {
    /// Check a fetched note document
    pub fn validate(&self) -> Result<(), String> {
        let mut uris = vec![self.uri.as_str(), self.author.as_str()];
        self.collect_uris(&mut uris);
        uris.into_iter().try_for_each(require_http_uri)
    }

    fn collect_uris<'a>(&'a self, uris: &mut Vec<&'a str>) {
        uris.extend(self.replies_to.as_deref());
        uris.extend(self.quotes.as_deref());
    }
}

fn require_http_uri(uri: &str) -> Result<(), String> {
    match url::Url::parse(uri) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => Ok(()),
        _ => Err(format!("{uri:?} is not an absolute http(s) uri")),
    }
}
