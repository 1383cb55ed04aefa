#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Client SDK for a receive-only email testing gateway.
//!
//! Provides temporary inboxes, real-time email delivery (push, poll,
//! or automatic fallback between the two), hash-based resync, and
//! transparent decryption of post-quantum encrypted inboxes. The
//! gateway itself is a black box behind [`GatewayTransport`]; this
//! crate owns the delivery, subscription, and crypto logic on top of
//! it.

mod b64;
mod client;
mod config;
mod crypto;
mod email;
mod error;
mod inbox;
mod registry;
mod strategy;
mod subscription;
mod sync;
mod transport;
mod wait;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use config::{BackoffConfig, ClientConfig, DeliveryMode, PollConfig};
pub use crypto::EncryptedEnvelope;
pub use email::{Attachment, Email, EmailMetadata};
pub use error::{Error, Result};
pub use inbox::{ExportedInbox, Inbox, Keypair};
pub use strategy::InboxEmail;
pub use subscription::{Callback, SubscriptionHandle};
pub use transport::{
    CreateInboxOptions, CreateInboxResult, EventStream, GatewayTransport, HttpGatewayTransport,
    InboxSyncResult, RawAttachment, RawEmailRecord, RawEmailSource, ServerInfo, StreamEvent,
};
pub use wait::{MatchOptions, WaitForEmailCountResult};
