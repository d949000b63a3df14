//! Federation module
//!
//! Handles:
//! - Request authentication (HTTP signatures, bridge bypass)
//! - Activity dispatch (inbox)
//! - Local and remote reference resolution
//! - Outbound delivery (queue, signing, retry)

mod activity;
mod context;
mod delivery;
mod local_ref;
mod outbound;
mod resolver;
mod schema;
mod signature;
mod verifier;

pub use activity::{ActivityDispatcher, Sender};
pub use context::{
    BridgeTrust, DeliverySettings, FederationContext, LocalEntity, UriKind, authority_of,
};
pub use delivery::{
    ActivityDelivery, DeliveryBatch, DeliveryQueue, DeliveryResult, builder, unique_inbox_targets,
};
pub use local_ref::{LocalIndex, LocalReferenceResolver, Lookup};
pub use outbound::{OutboundFederator, delivery_targets};
pub use resolver::{
    FEDERATION_MEDIA_TYPE, MAX_RESOLVE_DEPTH, NoopSearchIndex, NoteSource, Refresh,
    RemoteResolver, SearchIndex,
};
pub use schema::{
    Activity, ActivityKind, ActorObject, AttachmentObject, ContentEntry, ContentFormat,
    CustomEmojiObject, FollowObject, FollowResponseObject, NoteObject, PatchObject,
    PublicKeyObject, UndoObject,
};
pub use signature::{
    ParsedSignature, SignatureHeaders, generate_digest, key_owner, parse_signature_header,
    sign_request, verify_signature,
};
pub use verifier::{InboundRequest, SignatureVerifier, Verification};

#[cfg(test)]
pub(crate) mod test_support {
    pub(crate) use super::context::test_support::{test_config, test_context};
    pub(crate) use super::signature::test_support::generate_test_keypair;
}
