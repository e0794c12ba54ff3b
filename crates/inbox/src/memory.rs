use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use futures::channel::mpsc;
use futures::future;
use rand::RngCore;

use crate::address::Address;
use crate::chat::{ConsentState, Conversation, Message};
use crate::config::NetworkEnv;
use crate::sdk::{
    BoxFuture, ClientFactory, ClientOptions, FeedStream, KeyBundle, MessagingClient, NameResolver,
    SdkError, SdkResult, Signer, WalletProvider,
};

const CLOCK_START_UNIX_MS: u64 = 1_700_000_000_000;
const CLOCK_STEP_MS: u64 = 1_000;
const IDENTITY_CHALLENGE: &[u8] = b"XMTP : Create Identity";

type ThreadKey = (Address, Address);

fn thread_key(left: &Address, right: &Address) -> ThreadKey {
    if left <= right {
        (left.clone(), right.clone())
    } else {
        (right.clone(), left.clone())
    }
}

#[derive(Debug, Default)]
struct Thread {
    created_at_unix_ms: u64,
    messages: Vec<Message>,
}

/// Call counters for every client and factory operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub calls: BTreeMap<&'static str, u64>,
    /// Consent reads, writes and refreshes combined.
    pub consent_calls: u64,
}

impl NetworkStats {
    pub fn count(&self, operation: &str) -> u64 {
        self.calls.get(operation).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.values().sum()
    }
}

#[derive(Default)]
struct NetworkState {
    registered: BTreeSet<Address>,
    bundles: HashMap<String, Address>,
    threads: BTreeMap<ThreadKey, Thread>,
    consent: HashMap<(Address, Address), ConsentState>,
    conversation_watchers: Vec<(Address, mpsc::UnboundedSender<SdkResult<Conversation>>)>,
    message_watchers: Vec<(ThreadKey, mpsc::UnboundedSender<SdkResult<Message>>)>,
    failing: HashSet<&'static str>,
    clock_unix_ms: u64,
    next_message: u64,
    stats: NetworkStats,
}

impl NetworkState {
    fn begin(&mut self, operation: &'static str) -> SdkResult<()> {
        *self.stats.calls.entry(operation).or_default() += 1;
        if matches!(
            operation,
            "consent_state" | "allow" | "deny" | "refresh_consent_list"
        ) {
            self.stats.consent_calls += 1;
        }

        if self.failing.contains(operation) {
            tracing::debug!(operation, "memory network failing operation on request");
            return Err(SdkError::Network {
                stage: operation,
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn tick(&mut self) -> u64 {
        self.clock_unix_ms = self.clock_unix_ms.max(CLOCK_START_UNIX_MS) + CLOCK_STEP_MS;
        self.clock_unix_ms
    }

    fn consent_of(&self, owner: &Address, peer: &Address) -> ConsentState {
        self.consent
            .get(&(owner.clone(), peer.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn notify_conversation(&mut self, owner: &Address, conversation: &Conversation) {
        self.conversation_watchers.retain(|(watcher, sender)| {
            if watcher != owner {
                return !sender.is_closed();
            }
            sender.unbounded_send(Ok(conversation.clone())).is_ok()
        });
    }

    fn notify_message(&mut self, key: &ThreadKey, message: &Message) {
        self.message_watchers.retain(|(watched, sender)| {
            if watched != key {
                return !sender.is_closed();
            }
            sender.unbounded_send(Ok(message.clone())).is_ok()
        });
    }
}

/// In-process messaging network. Every client connected to the same network
/// sees the same conversations, messages and consent records.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `address` reachable without connecting a client for it.
    pub fn register(&self, address: &Address) {
        self.state().registered.insert(address.clone());
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.state().registered.contains(address)
    }

    /// Registers `address` and returns a ready client for it.
    pub fn connect(&self, address: &Address) -> Arc<MemoryClient> {
        self.connect_in(address, NetworkEnv::default())
    }

    fn connect_in(&self, address: &Address, env: NetworkEnv) -> Arc<MemoryClient> {
        self.register(address);
        Arc::new(MemoryClient {
            network: self.clone(),
            address: address.clone(),
            env,
            consent_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn client_factory(&self) -> Arc<MemoryClientFactory> {
        Arc::new(MemoryClientFactory {
            network: self.clone(),
        })
    }

    /// Makes every later call to `operation` fail with a network error.
    pub fn fail_operation(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    /// Authoritative consent `owner` has recorded for `peer`.
    pub fn consent_of(&self, owner: &Address, peer: &Address) -> ConsentState {
        self.state().consent_of(owner, peer)
    }

    /// Pushes every stored message between `left` and `right` to live watchers again.
    pub fn redeliver(&self, left: &Address, right: &Address) {
        let mut state = self.state();
        let key = thread_key(left, right);
        let messages = state
            .threads
            .get(&key)
            .map(|thread| thread.messages.clone())
            .unwrap_or_default();
        for message in &messages {
            state.notify_message(&key, message);
        }
    }

    /// Ends every open feed with a [`SdkError::StreamClosed`] item.
    pub fn close_feeds(&self) {
        let mut state = self.state();
        for (_, sender) in state.conversation_watchers.drain(..) {
            let _ = sender.unbounded_send(Err(SdkError::StreamClosed {
                stage: "close_feeds",
            }));
        }
        for (_, sender) in state.message_watchers.drain(..) {
            let _ = sender.unbounded_send(Err(SdkError::StreamClosed {
                stage: "close_feeds",
            }));
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.state().stats.clone()
    }
}

/// Client bound to one address on a [`MemoryNetwork`].
///
/// Consent reads come from a local cache that only `allow`, `deny` and
/// `refresh_consent_list` update.
pub struct MemoryClient {
    network: MemoryNetwork,
    address: Address,
    env: NetworkEnv,
    consent_cache: Mutex<HashMap<Address, ConsentState>>,
}

impl MemoryClient {
    pub fn env(&self) -> NetworkEnv {
        self.env
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<Address, ConsentState>> {
        self.consent_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_consent(&self, peer: &Address) -> ConsentState {
        self.cache().get(peer).copied().unwrap_or_default()
    }

    fn conversation_with(&self, peer: &Address, created_at_unix_ms: u64) -> Conversation {
        Conversation::new(peer.clone(), created_at_unix_ms).with_consent(self.cached_consent(peer))
    }

    fn peer_of(&self, key: &ThreadKey) -> Address {
        if key.0 == self.address {
            key.1.clone()
        } else {
            key.0.clone()
        }
    }

    fn record_consent(&self, operation: &'static str, peers: &[Address], state: ConsentState) -> SdkResult<()> {
        {
            let mut network = self.network.state();
            network.begin(operation)?;
            for peer in peers {
                network
                    .consent
                    .insert((self.address.clone(), peer.clone()), state);
            }
        }
        let mut cache = self.cache();
        for peer in peers {
            cache.insert(peer.clone(), state);
        }
        Ok(())
    }

    fn open_thread(&self, peer: &Address) -> SdkResult<Conversation> {
        let mut network = self.network.state();
        network.begin("new_conversation")?;

        if !network.registered.contains(peer) {
            return Err(SdkError::Rejected {
                stage: "new_conversation",
                details: format!("{peer} is not on the network"),
            });
        }

        let key = thread_key(&self.address, peer);
        if let Some(thread) = network.threads.get(&key) {
            let created_at = thread.created_at_unix_ms;
            drop(network);
            return Ok(self.conversation_with(peer, created_at));
        }

        let created_at = network.tick();
        network.threads.insert(
            key,
            Thread {
                created_at_unix_ms: created_at,
                messages: Vec::new(),
            },
        );
        let peer_view = Conversation::new(self.address.clone(), created_at)
            .with_consent(network.consent_of(peer, &self.address));
        network.notify_conversation(peer, &peer_view);
        let own_view = Conversation::new(peer.clone(), created_at)
            .with_consent(network.consent_of(&self.address, peer));
        network.notify_conversation(&self.address, &own_view);
        drop(network);

        tracing::debug!(owner = %self.address, peer = %peer, "memory conversation opened");
        Ok(self.conversation_with(peer, created_at))
    }

    fn post(&self, conversation: &Conversation, text: &str) -> SdkResult<Message> {
        let mut network = self.network.state();
        network.begin("send")?;

        let key = thread_key(&self.address, &conversation.peer_address);
        if !network.threads.contains_key(&key) {
            return Err(SdkError::UnknownConversation {
                stage: "send",
                peer: conversation.peer_address.to_string(),
            });
        }

        network.next_message += 1;
        let id = format!("msg-{}", network.next_message);
        let sent_at = network.tick();
        let message = Message::text(id, self.address.clone(), sent_at, text);
        if let Some(thread) = network.threads.get_mut(&key) {
            thread.messages.push(message.clone());
        }
        network.notify_message(&key, &message);
        Ok(message)
    }
}

impl MessagingClient for MemoryClient {
    fn address(&self) -> &Address {
        &self.address
    }

    fn can_message<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, SdkResult<bool>> {
        let result = {
            let mut network = self.network.state();
            network
                .begin("can_message")
                .map(|()| network.registered.contains(peer))
        };
        Box::pin(future::ready(result))
    }

    fn export_key_bundle(&self) -> BoxFuture<'_, SdkResult<KeyBundle>> {
        let result = {
            let mut network = self.network.state();
            network.begin("export_key_bundle").map(|()| {
                let mut nonce = [0_u8; 8];
                rand::thread_rng().fill_bytes(&mut nonce);
                let encoded = format!("memory:{}:{}", self.address, hex::encode(nonce));
                network.bundles.insert(encoded.clone(), self.address.clone());
                KeyBundle::new(encoded)
            })
        };
        Box::pin(future::ready(result))
    }

    fn list_conversations(&self) -> BoxFuture<'_, SdkResult<Vec<Conversation>>> {
        let result = {
            let mut network = self.network.state();
            network.begin("list").map(|()| {
                network
                    .threads
                    .iter()
                    .filter(|(key, _)| key.0 == self.address || key.1 == self.address)
                    .map(|(key, thread)| (self.peer_of(key), thread.created_at_unix_ms))
                    .collect::<Vec<_>>()
            })
        };
        let result = result.map(|threads| {
            threads
                .into_iter()
                .map(|(peer, created_at)| self.conversation_with(&peer, created_at))
                .collect()
        });
        Box::pin(future::ready(result))
    }

    fn stream_conversations(&self) -> BoxFuture<'_, SdkResult<FeedStream<Conversation>>> {
        let result = {
            let mut network = self.network.state();
            network.begin("stream_conversations").map(|()| {
                let (sender, receiver) = mpsc::unbounded();
                network
                    .conversation_watchers
                    .push((self.address.clone(), sender));
                receiver.boxed()
            })
        };
        Box::pin(future::ready(result))
    }

    fn new_conversation<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, SdkResult<Conversation>> {
        Box::pin(future::ready(self.open_thread(peer)))
    }

    fn messages<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, SdkResult<Vec<Message>>> {
        let result = {
            let mut network = self.network.state();
            network.begin("messages").and_then(|()| {
                let key = thread_key(&self.address, &conversation.peer_address);
                network
                    .threads
                    .get(&key)
                    .map(|thread| thread.messages.clone())
                    .ok_or_else(|| SdkError::UnknownConversation {
                        stage: "messages",
                        peer: conversation.peer_address.to_string(),
                    })
            })
        };
        Box::pin(future::ready(result))
    }

    fn stream_messages<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, SdkResult<FeedStream<Message>>> {
        let result = {
            let mut network = self.network.state();
            network.begin("stream_messages").map(|()| {
                let (sender, receiver) = mpsc::unbounded();
                let key = thread_key(&self.address, &conversation.peer_address);
                network.message_watchers.push((key, sender));
                receiver.boxed()
            })
        };
        Box::pin(future::ready(result))
    }

    fn send<'a>(
        &'a self,
        conversation: &'a Conversation,
        text: &'a str,
    ) -> BoxFuture<'a, SdkResult<Message>> {
        Box::pin(future::ready(self.post(conversation, text)))
    }

    fn consent_state<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, SdkResult<ConsentState>> {
        let result = self
            .network
            .state()
            .begin("consent_state")
            .map(|()| self.cached_consent(&conversation.peer_address));
        Box::pin(future::ready(result))
    }

    fn allow<'a>(&'a self, addresses: &'a [Address]) -> BoxFuture<'a, SdkResult<()>> {
        Box::pin(future::ready(self.record_consent(
            "allow",
            addresses,
            ConsentState::Allowed,
        )))
    }

    fn deny<'a>(&'a self, addresses: &'a [Address]) -> BoxFuture<'a, SdkResult<()>> {
        Box::pin(future::ready(self.record_consent(
            "deny",
            addresses,
            ConsentState::Blocked,
        )))
    }

    fn refresh_consent_list(&self) -> BoxFuture<'_, SdkResult<()>> {
        let result = {
            let mut network = self.network.state();
            network.begin("refresh_consent_list").map(|()| {
                network
                    .consent
                    .iter()
                    .filter(|((owner, _), _)| owner == &self.address)
                    .map(|((_, peer), state)| (peer.clone(), *state))
                    .collect::<Vec<_>>()
            })
        };
        let result = result.map(|records| {
            let mut cache = self.cache();
            cache.clear();
            cache.extend(records);
        });
        Box::pin(future::ready(result))
    }
}

/// Creates [`MemoryClient`]s on a shared network.
pub struct MemoryClientFactory {
    network: MemoryNetwork,
}

impl ClientFactory for MemoryClientFactory {
    fn create(
        &self,
        signer: Arc<dyn Signer>,
        options: ClientOptions,
    ) -> BoxFuture<'_, SdkResult<Arc<dyn MessagingClient>>> {
        Box::pin(async move {
            self.network.state().begin("create")?;

            let signature = signer.sign_message(IDENTITY_CHALLENGE).await?;
            if signature.is_empty() {
                return Err(SdkError::Rejected {
                    stage: "create",
                    details: "signer returned an empty signature".to_string(),
                });
            }

            let client: Arc<dyn MessagingClient> =
                self.network.connect_in(&signer.address(), options.env);
            Ok(client)
        })
    }

    fn create_from_key_bundle(
        &self,
        bundle: KeyBundle,
        options: ClientOptions,
    ) -> BoxFuture<'_, SdkResult<Arc<dyn MessagingClient>>> {
        let result = {
            let mut network = self.network.state();
            network.begin("create_from_key_bundle").and_then(|()| {
                network
                    .bundles
                    .get(bundle.as_str())
                    .cloned()
                    .ok_or_else(|| SdkError::MalformedKeyBundle {
                        stage: "create_from_key_bundle",
                        details: "bundle was not issued by this network".to_string(),
                    })
            })
        };
        let result = result.map(|address| {
            let client: Arc<dyn MessagingClient> = self.network.connect_in(&address, options.env);
            client
        });
        Box::pin(future::ready(result))
    }

    fn create_random(
        &self,
        options: ClientOptions,
    ) -> BoxFuture<'_, SdkResult<Arc<dyn MessagingClient>>> {
        let result = self.network.state().begin("create_random").and_then(|()| {
            let mut raw = [0_u8; 20];
            rand::thread_rng().fill_bytes(&mut raw);
            Address::parse(&format!("0x{}", hex::encode(raw))).map_err(|error| SdkError::Rejected {
                stage: "create_random",
                details: error.to_string(),
            })
        });
        let result = result.map(|address| {
            let client: Arc<dyn MessagingClient> = self.network.connect_in(&address, options.env);
            client
        });
        Box::pin(future::ready(result))
    }
}

/// Name provider backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticNameResolver {
    names: HashMap<String, Address>,
    failing: bool,
}

impl StaticNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose every lookup errors.
    pub fn failing() -> Self {
        Self {
            names: HashMap::new(),
            failing: true,
        }
    }

    pub fn with_name(mut self, name: &str, address: Address) -> Self {
        self.names.insert(name.trim().to_ascii_lowercase(), address);
        self
    }
}

impl NameResolver for StaticNameResolver {
    fn resolve_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SdkResult<Option<Address>>> {
        let result = if self.failing {
            Err(SdkError::Network {
                stage: "resolve_name",
                details: "name provider unavailable".to_string(),
            })
        } else {
            Ok(self.names.get(&name.trim().to_ascii_lowercase()).cloned())
        };
        Box::pin(future::ready(result))
    }
}

/// Wallet provider handing out a preconfigured signer, or none at all.
#[derive(Clone, Default)]
pub struct InjectedWallet {
    signer: Option<Arc<dyn Signer>>,
}

impl InjectedWallet {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self {
            signer: Some(signer),
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }
}

impl WalletProvider for InjectedWallet {
    fn request_signer(&self) -> BoxFuture<'_, SdkResult<Option<Arc<dyn Signer>>>> {
        Box::pin(future::ready(Ok(self.signer.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(fill: char) -> Address {
        Address::parse(&format!("0x{}", fill.to_string().repeat(40))).unwrap()
    }

    #[tokio::test]
    async fn both_sides_see_one_conversation() {
        let network = MemoryNetwork::new();
        let alice = network.connect(&address('a'));
        let bob = network.connect(&address('b'));

        alice.new_conversation(&address('b')).await.unwrap();
        alice.new_conversation(&address('b')).await.unwrap();

        let seen_by_bob = bob.list_conversations().await.unwrap();
        assert_eq!(seen_by_bob.len(), 1);
        assert_eq!(seen_by_bob[0].peer_address, address('a'));
        assert_eq!(alice.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_peers_cannot_be_reached() {
        let network = MemoryNetwork::new();
        let alice = network.connect(&address('a'));

        assert!(!alice.can_message(&address('c')).await.unwrap());
        let error = alice.new_conversation(&address('c')).await.unwrap_err();
        assert!(matches!(error, SdkError::Rejected { .. }));
    }

    #[tokio::test]
    async fn consent_cache_lags_until_refresh() {
        let network = MemoryNetwork::new();
        let alice = network.connect(&address('a'));
        let second_device = network.connect(&address('a'));
        network.register(&address('b'));
        let conversation = alice.new_conversation(&address('b')).await.unwrap();

        alice.deny(&[address('b')]).await.unwrap();
        assert_eq!(
            second_device.consent_state(&conversation).await.unwrap(),
            ConsentState::Unknown
        );

        second_device.refresh_consent_list().await.unwrap();
        assert_eq!(
            second_device.consent_state(&conversation).await.unwrap(),
            ConsentState::Blocked
        );
    }

    #[tokio::test]
    async fn exported_bundles_restore_the_same_address() {
        let network = MemoryNetwork::new();
        let factory = network.client_factory();
        let options = ClientOptions::new(NetworkEnv::Dev);

        let original = factory.create_random(options).await.unwrap();
        let bundle = original.export_key_bundle().await.unwrap();
        let restored = factory.create_from_key_bundle(bundle, options).await.unwrap();
        assert_eq!(restored.address(), original.address());

        let error = factory
            .create_from_key_bundle(KeyBundle::new("garbage"), options)
            .await
            .err()
            .unwrap();
        assert!(matches!(error, SdkError::MalformedKeyBundle { .. }));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_network_errors() {
        let network = MemoryNetwork::new();
        let alice = network.connect(&address('a'));
        network.fail_operation("list");

        assert!(matches!(
            alice.list_conversations().await,
            Err(SdkError::Network { .. })
        ));
        network.clear_failures();
        assert!(alice.list_conversations().await.is_ok());
        assert_eq!(network.stats().count("list"), 2);
    }

    #[tokio::test]
    async fn closing_feeds_reports_then_ends_the_stream() {
        let network = MemoryNetwork::new();
        let alice = network.connect(&address('a'));
        let mut feed = alice.stream_conversations().await.unwrap();

        network.close_feeds();
        assert!(matches!(
            feed.next().await,
            Some(Err(SdkError::StreamClosed { .. }))
        ));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn static_names_are_case_insensitive() {
        let resolver = StaticNameResolver::new().with_name("Bob.eth", address('b'));
        assert_eq!(
            resolver.resolve_name("bob.ETH").await.unwrap(),
            Some(address('b'))
        );
        assert_eq!(resolver.resolve_name("eve.eth").await.unwrap(), None);
    }
}
