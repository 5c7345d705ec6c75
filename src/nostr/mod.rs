//! Nostr relays as a [`DocumentStore`](crate::store::DocumentStore).

pub use client::NostrStore;
pub use identity::{generate_random_handle, Identity};

mod client;
mod identity;
