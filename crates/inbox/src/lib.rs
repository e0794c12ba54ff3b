//! Floating chat-inbox client state.
//!
//! The crate keeps the in-memory view state of a messaging inbox widget in sync
//! with an external messaging SDK: conversation and message feeds, the per-peer
//! consent gate, session lifecycle and cached key material. Rendering is left to
//! the host; [`inbox::FloatingInbox`] exposes everything a view needs to draw.

#![deny(unsafe_code)]

pub mod address;
/// Conversation, message and consent domain.
pub mod chat;
pub mod config;
pub mod error;
pub mod inbox;
pub mod logging;
/// In-process messaging network implementing the SDK traits.
pub mod memory;
/// Contracts consumed from the external messaging SDK.
pub mod sdk;
pub mod session;
/// Ethereum-backed signer and name resolution.
pub mod wallet;

pub use address::{Address, AddressResolver, ResolutionTicket};
pub use chat::{
    AllowedScope, ConsentGate, ConsentState, Conversation, ConversationBuckets,
    ConversationStore, ConversationTab, Message, MessageStore,
};
pub use config::{InboxSettings, NetworkEnv, SettingsStore};
pub use error::{InboxError, InboxResult};
pub use inbox::{FloatingInbox, Screen};
pub use sdk::{ClientFactory, MessagingClient, NameResolver, SdkError, SdkResult, Signer, WalletProvider};
pub use session::{LogoutReport, SessionManager, SessionPhase};
