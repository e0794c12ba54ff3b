use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;
use snafu::Snafu;

use crate::address::Address;
use crate::chat::{ConsentState, Conversation, Message};
use crate::config::NetworkEnv;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Live, push-based feed of newly arriving items.
pub type FeedStream<T> = BoxStream<'static, SdkResult<T>>;
pub type SdkResult<T> = Result<T, SdkError>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum SdkError {
    #[snafu(display("network call failed on `{stage}`: {details}"))]
    Network {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("request was rejected on `{stage}`: {details}"))]
    Rejected {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("no conversation with {peer} exists"))]
    UnknownConversation { stage: &'static str, peer: String },
    #[snafu(display("live feed closed on `{stage}`"))]
    StreamClosed { stage: &'static str },
    #[snafu(display("key bundle could not be imported: {details}"))]
    MalformedKeyBundle {
        stage: &'static str,
        details: String,
    },
}

/// Exported identity material for a messaging client.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBundle(String);

impl KeyBundle {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "KeyBundle({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub env: NetworkEnv,
}

impl ClientOptions {
    pub const fn new(env: NetworkEnv) -> Self {
        Self { env }
    }
}

/// Anything that can prove control of an address.
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;
    fn sign_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, SdkResult<Vec<u8>>>;
}

/// An externally supplied wallet (browser extension, mobile wallet bridge).
pub trait WalletProvider: Send + Sync {
    /// Asks the wallet for a signer. `Ok(None)` means no compatible wallet is present.
    fn request_signer(&self) -> BoxFuture<'_, SdkResult<Option<Arc<dyn Signer>>>>;
}

/// Human-readable name lookup (`bob.eth` -> address).
pub trait NameResolver: Send + Sync {
    fn resolve_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SdkResult<Option<Address>>>;
}

/// Builds messaging clients.
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        signer: Arc<dyn Signer>,
        options: ClientOptions,
    ) -> BoxFuture<'_, SdkResult<Arc<dyn MessagingClient>>>;
    fn create_from_key_bundle(
        &self,
        bundle: KeyBundle,
        options: ClientOptions,
    ) -> BoxFuture<'_, SdkResult<Arc<dyn MessagingClient>>>;
    /// Creates a client for a freshly generated identity with no external signer.
    fn create_random(&self, options: ClientOptions)
    -> BoxFuture<'_, SdkResult<Arc<dyn MessagingClient>>>;
}

/// One connected messaging session.
///
/// Conversations are addressed by their [`Conversation`] snapshot; the client is
/// expected to key them by peer address.
pub trait MessagingClient: Send + Sync {
    fn address(&self) -> &Address;
    fn can_message<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, SdkResult<bool>>;
    fn export_key_bundle(&self) -> BoxFuture<'_, SdkResult<KeyBundle>>;

    fn list_conversations(&self) -> BoxFuture<'_, SdkResult<Vec<Conversation>>>;
    fn stream_conversations(&self) -> BoxFuture<'_, SdkResult<FeedStream<Conversation>>>;
    fn new_conversation<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, SdkResult<Conversation>>;

    fn messages<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, SdkResult<Vec<Message>>>;
    fn stream_messages<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, SdkResult<FeedStream<Message>>>;
    fn send<'a>(
        &'a self,
        conversation: &'a Conversation,
        text: &'a str,
    ) -> BoxFuture<'a, SdkResult<Message>>;

    /// Reads the locally cached consent state; see [`Self::refresh_consent_list`].
    fn consent_state<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, SdkResult<ConsentState>>;
    fn allow<'a>(&'a self, addresses: &'a [Address]) -> BoxFuture<'a, SdkResult<()>>;
    fn deny<'a>(&'a self, addresses: &'a [Address]) -> BoxFuture<'a, SdkResult<()>>;
    /// Pulls the authoritative consent list into the local cache.
    fn refresh_consent_list(&self) -> BoxFuture<'_, SdkResult<()>>;
}
