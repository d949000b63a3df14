//! Service layer
//!
//! Local mutations and read-side logic, separated from HTTP handlers.
//! Mutating services hand their results to the outbound federator.

mod account;
mod note;
mod thread;

pub use account::{AccountService, ProfileUpdate};
pub use note::{NewNote, NoteService, render_plain_text};
pub use thread::{MAX_ANCESTOR_HOPS, MAX_DESCENDANT_DEPTH, ThreadService};
