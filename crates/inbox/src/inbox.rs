//! The floating inbox widget as a headless controller.
//!
//! [`FloatingInbox`] ties the session, the conversation list, the search box and
//! the open thread together. A host renders from its accessors and forwards user
//! actions to its methods; live feed events are applied by [`FloatingInbox::pump_events`]
//! or [`FloatingInbox::process_next_event`].

use std::sync::Arc;

use snafu::{OptionExt, ensure};
use tokio::sync::mpsc;

use crate::address::{Address, AddressResolver, ResolutionTicket, is_name};
use crate::chat::subscription::FeedSink;
use crate::chat::{
    AllowedScope, ConsentGate, Conversation, ConversationBuckets, ConversationStore,
    ConversationTab, FeedEvent, Message, MessageStore, SendOutcome, Subscription,
};
use crate::error::{
    InboxError, InboxResult, NoActiveClientSnafu, NoActiveConversationSnafu, NoPeerSelectedSnafu,
    NotOnNetworkSnafu, STATUS_INVALID_ADDRESS, STATUS_NOT_ON_NETWORK, STATUS_SELF_MESSAGING,
    SelfMessagingSnafu,
};
use crate::sdk::{MessagingClient, NameResolver};
use crate::session::{LogoutReport, SessionManager, SessionPhase};
use crate::wallet::ProviderConfig;

pub const STATUS_SEARCHING: &str = "Searching...";
pub const STATUS_RESOLVING: &str = "Resolving address...";
pub const STATUS_ON_NETWORK: &str = "Address is on the network ✅";
pub const TRUST_PROMPT: &str = "Do you trust this contact?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// No signer: connect a wallet, create a new identity or start from a key.
    Connect,
    /// Signer attached, client not yet established.
    JoinNetwork,
    /// Signer attached and the cached flags say this identity already joined;
    /// the client is being restored.
    Connecting,
    Conversations,
    Thread,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Existing(Conversation),
    /// "Create new conversation" pressed; the conversation is opened by the first send.
    Draft { peer: Address },
}

impl Selection {
    pub fn peer(&self) -> &Address {
        match self {
            Self::Existing(conversation) => &conversation.peer_address,
            Self::Draft { peer } => peer,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchState {
    pub term: String,
    pub peer_address: Option<Address>,
    pub status: Option<String>,
    pub can_message: bool,
    pub create_new: bool,
    pub resolving: bool,
    /// The committed address already has a conversation in the list.
    pub conversation_found: bool,
    ticket: Option<ResolutionTicket>,
}

impl SearchState {
    /// Status line to show under the search box.
    pub fn visible_status(&self) -> Option<&str> {
        if self.resolving && !self.term.is_empty() {
            return Some(STATUS_RESOLVING);
        }
        if self.conversation_found {
            return None;
        }
        self.status.as_deref()
    }
}

/// One search in flight. Runs without borrowing the inbox so a newer search
/// can be issued before it finishes.
pub struct SearchRequest {
    ticket: ResolutionTicket,
    input: String,
    resolver: AddressResolver,
    client: Arc<dyn MessagingClient>,
}

#[derive(Debug)]
pub struct SearchOutcome {
    ticket: ResolutionTicket,
    result: InboxResult<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchHit {
    address: Address,
    can_message: bool,
}

impl SearchRequest {
    pub fn ticket(&self) -> ResolutionTicket {
        self.ticket
    }

    pub async fn run(self) -> SearchOutcome {
        let result = self.lookup().await;
        SearchOutcome {
            ticket: self.ticket,
            result,
        }
    }

    async fn lookup(&self) -> InboxResult<SearchHit> {
        let address = self.resolver.resolve(&self.input).await?;
        ConsentGate::new(Arc::clone(&self.client)).ensure_not_self(&address)?;

        let can_message = self
            .client
            .can_message(&address)
            .await
            .map_err(|source| InboxError::Sdk {
                stage: "search-can-message",
                source,
            })?;
        Ok(SearchHit {
            address,
            can_message,
        })
    }
}

pub struct ThreadState {
    store: MessageStore,
    selection: Selection,
    subscription: Option<Subscription>,
    trust_prompt: bool,
    status: Option<String>,
}

impl ThreadState {
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    /// Trust prompt text while the peer's consent is still unknown.
    pub fn trust_prompt(&self) -> Option<&'static str> {
        self.trust_prompt.then_some(TRUST_PROMPT)
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn is_live(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Promotes a draft to the conversation its first send opened and starts
    /// its live feed. No-op for existing selections or unopened drafts.
    async fn bind_opened_draft(
        &mut self,
        client: &dyn MessagingClient,
        sink: FeedSink,
    ) -> InboxResult<Option<Conversation>> {
        if !matches!(self.selection, Selection::Draft { .. }) {
            return Ok(None);
        }
        let Some(conversation) = self.store.conversation().cloned() else {
            return Ok(None);
        };

        self.selection = Selection::Existing(conversation.clone());
        self.subscription = self.store.subscribe(client, sink).await?;
        tracing::debug!(peer = %conversation.peer_address, "draft bound to its conversation");
        Ok(Some(conversation))
    }

    fn release(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.store.detach();
    }
}

type LogoutCallback = Box<dyn FnMut(&LogoutReport) + Send>;

pub struct FloatingInbox {
    session: SessionManager,
    resolver: AddressResolver,
    scope: AllowedScope,
    conversations: ConversationStore,
    conversation_feed: Option<Subscription>,
    buckets: ConversationBuckets,
    search: SearchState,
    thread: Option<ThreadState>,
    status: Option<String>,
    events_tx: mpsc::UnboundedSender<FeedEvent>,
    events_rx: mpsc::UnboundedReceiver<FeedEvent>,
    on_logout: Option<LogoutCallback>,
}

impl FloatingInbox {
    pub fn new(session: SessionManager, names: Arc<dyn NameResolver>, scope: AllowedScope) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session,
            resolver: AddressResolver::new(names),
            scope,
            conversations: ConversationStore::new(),
            conversation_feed: None,
            buckets: ConversationBuckets::default(),
            search: SearchState::default(),
            thread: None,
            status: None,
            events_tx,
            events_rx,
            on_logout: None,
        }
    }

    pub fn with_logout_callback(
        mut self,
        callback: impl FnMut(&LogoutReport) + Send + 'static,
    ) -> Self {
        self.on_logout = Some(Box::new(callback));
        self
    }

    pub fn screen(&self) -> Screen {
        match self.session.phase() {
            SessionPhase::Disconnected => Screen::Connect,
            SessionPhase::SignerAttached if self.session.preferences().is_on_network => {
                Screen::Connecting
            }
            SessionPhase::SignerAttached => Screen::JoinNetwork,
            SessionPhase::NetworkAttached if self.thread.is_some() => Screen::Thread,
            SessionPhase::NetworkAttached => Screen::Conversations,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn search_state(&self) -> &SearchState {
        &self.search
    }

    pub fn buckets(&self) -> &ConversationBuckets {
        &self.buckets
    }

    pub fn conversations(&self) -> &[Conversation] {
        self.conversations.conversations()
    }

    pub fn active_tab(&self) -> ConversationTab {
        self.session.preferences().active_tab
    }

    /// Rows for the active tab.
    pub fn visible_conversations(&self) -> &[Conversation] {
        self.buckets.for_tab(self.active_tab())
    }

    pub fn thread(&self) -> Option<&ThreadState> {
        self.thread.as_ref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub async fn connect_wallet(&mut self) -> InboxResult<Address> {
        let result = self.session.connect_external_signer().await;
        self.record_status(result)
    }

    /// "Create new one": generates an identity and opens the inbox.
    pub async fn create_new_identity(&mut self) -> InboxResult<Address> {
        let env = self.session.env();
        let result = self.session.create_ephemeral_identity(env).await;
        let client = self.record_status(result)?;
        let opened = self.open_inbox().await;
        self.record_status(opened)?;
        Ok(client.address().clone())
    }

    /// "Start from key": attaches a signer for `key`; name lookups go through
    /// the resolver built for `provider` from then on.
    pub fn start_from_key(&mut self, key: &str, provider: &ProviderConfig) -> InboxResult<Address> {
        let result = self.session.restore_from_private_key(key, provider);
        let address = self.record_status(result)?;
        if let Some(names) = self.session.name_resolver() {
            self.resolver = AddressResolver::new(names);
        }
        Ok(address)
    }

    pub async fn connect_to_network(&mut self) -> InboxResult<()> {
        let result = self.session.connect_to_network().await;
        self.record_status(result)?;
        let opened = self.open_inbox().await;
        self.record_status(opened)
    }

    async fn open_inbox(&mut self) -> InboxResult<()> {
        let client = self.client()?;
        self.release_feeds();
        self.conversations = ConversationStore::new();
        self.conversations.load(client.as_ref()).await?;
        self.conversation_feed = Some(
            self.conversations
                .subscribe(client.as_ref(), self.events_tx.clone())
                .await?,
        );
        self.refresh_buckets().await
    }

    /// Recomputes the allowed and request buckets for the current search term.
    pub async fn refresh_buckets(&mut self) -> InboxResult<()> {
        let client = self.client()?;
        self.buckets = self
            .conversations
            .partition(client.as_ref(), &self.search.term, self.scope)
            .await;
        Ok(())
    }

    pub fn set_active_tab(&mut self, tab: ConversationTab) {
        self.session.set_active_tab(tab);
    }

    /// Starts a search for `input`. Returns `None` for blank input, which only
    /// clears the search box.
    pub fn begin_search(&mut self, input: &str) -> Option<SearchRequest> {
        let client = self.session.client()?;
        let ticket = self.resolver.issue();

        self.search = SearchState {
            term: input.to_string(),
            ticket: Some(ticket),
            ..SearchState::default()
        };
        if input.trim().is_empty() {
            return None;
        }

        self.search.status = Some(STATUS_SEARCHING.to_string());
        self.search.resolving = is_name(input);
        Some(SearchRequest {
            ticket,
            input: input.to_string(),
            resolver: self.resolver.clone(),
            client,
        })
    }

    /// Applies a finished search. Returns false when a newer search was started
    /// in the meantime and the outcome was dropped.
    pub async fn commit_search(&mut self, outcome: SearchOutcome) -> bool {
        if !self.resolver.is_current(outcome.ticket) || self.search.ticket != Some(outcome.ticket) {
            tracing::debug!(ticket = outcome.ticket.raw(), "discarding stale search result");
            return false;
        }

        self.search.resolving = false;
        match outcome.result {
            Ok(hit) => {
                self.search.term = hit.address.to_string();
                self.search.conversation_found = self.conversations.find(&hit.address).is_some();
                self.search.can_message = hit.can_message;
                self.search.create_new = hit.can_message && !self.search.conversation_found;
                self.search.status = Some(if hit.can_message {
                    STATUS_ON_NETWORK.to_string()
                } else {
                    STATUS_NOT_ON_NETWORK.to_string()
                });
                self.search.peer_address = Some(hit.address);
            }
            Err(InboxError::SelfMessaging { address, .. }) => {
                self.search.status = Some(STATUS_SELF_MESSAGING.to_string());
                self.search.peer_address = Some(address);
            }
            Err(error) if error.is_invalid_address() => {
                tracing::debug!(error = %error, "search input is not a usable address");
                self.search.status = Some(STATUS_INVALID_ADDRESS.to_string());
            }
            Err(error) => {
                tracing::warn!(error = %error, "search failed");
                self.search.status = Some(error.status_message());
            }
        }

        if let Err(error) = self.refresh_buckets().await {
            tracing::warn!(error = %error, "failed to refresh conversation buckets");
        }
        true
    }

    /// Begins, runs and commits a search in one go.
    pub async fn search(&mut self, input: &str) -> &SearchState {
        match self.begin_search(input) {
            Some(request) => {
                let outcome = request.run().await;
                self.commit_search(outcome).await;
            }
            None => {
                if let Err(error) = self.refresh_buckets().await {
                    tracing::debug!(error = %error, "no buckets to refresh");
                }
            }
        }
        &self.search
    }

    /// Opens an existing conversation: history, consent check, live feed.
    pub async fn select_conversation(&mut self, conversation: Conversation) -> InboxResult<()> {
        let client = self.client()?;
        self.close_thread();

        let gate = ConsentGate::new(Arc::clone(&client));
        let mut store = MessageStore::for_conversation(conversation.clone());
        store.load_initial(client.as_ref()).await?;
        let consent = gate.query(&conversation).await?;
        let subscription = store.subscribe(client.as_ref(), self.events_tx.clone()).await?;

        tracing::info!(peer = %conversation.peer_address, consent = %consent, "conversation opened");
        self.thread = Some(ThreadState {
            store,
            selection: Selection::Existing(conversation),
            subscription,
            trust_prompt: consent.needs_trust_prompt(),
            status: None,
        });
        Ok(())
    }

    /// "Create new conversation" for the address found by the last search.
    pub fn start_new_conversation(&mut self) -> InboxResult<()> {
        let peer = self
            .search
            .peer_address
            .clone()
            .context(NoPeerSelectedSnafu {
                stage: "start-new-conversation",
            })?;
        if self.session.address().as_ref() == Some(&peer) {
            return SelfMessagingSnafu {
                stage: "start-new-conversation-self",
                address: peer,
            }
            .fail();
        }
        ensure!(
            self.search.can_message,
            NotOnNetworkSnafu {
                stage: "start-new-conversation-reachable",
                address: peer,
            }
        );

        self.close_thread();
        self.thread = Some(ThreadState {
            store: MessageStore::new_draft(),
            selection: Selection::Draft { peer },
            subscription: None,
            trust_prompt: false,
            status: None,
        });
        Ok(())
    }

    /// Leaves the thread and returns to the list.
    pub fn back(&mut self) {
        self.close_thread();
    }

    pub async fn accept_contact(&mut self) -> InboxResult<()> {
        let (client, peer) = self.thread_peer()?;
        ConsentGate::new(client).allow(&peer).await?;
        self.settle_trust_prompt().await
    }

    pub async fn block_contact(&mut self) -> InboxResult<()> {
        let (client, peer) = self.thread_peer()?;
        ConsentGate::new(client).block(&peer).await?;
        self.settle_trust_prompt().await
    }

    pub async fn send_message(&mut self, text: &str) -> InboxResult<SendOutcome> {
        let client = self.client()?;
        let gate = ConsentGate::new(Arc::clone(&client));
        let thread = self.thread.as_mut().context(NoActiveConversationSnafu {
            stage: "send-without-thread",
        })?;

        let draft_peer = match &thread.selection {
            Selection::Draft { peer } => Some(peer.clone()),
            Selection::Existing(_) => None,
        };
        let sent = thread.store.send(&gate, draft_peer.as_ref(), text).await;
        // A failed send may still have opened the conversation.
        let opened = thread
            .bind_opened_draft(client.as_ref(), self.events_tx.clone())
            .await;

        let outcome = match sent {
            Ok(outcome) => outcome,
            Err(error) => {
                thread.status = Some(error.status_message());
                match opened {
                    Ok(Some(conversation)) => {
                        self.conversations.insert(conversation);
                        if let Err(refresh) = self.refresh_buckets().await {
                            tracing::warn!(error = %refresh, "failed to refresh conversation buckets");
                        }
                    }
                    Ok(None) => {}
                    Err(subscribe) => {
                        tracing::warn!(error = %subscribe, "failed to open feed for new conversation");
                    }
                }
                return Err(error);
            }
        };

        thread.status = None;
        thread.trust_prompt = false;
        if let Some(conversation) = opened? {
            self.conversations.insert(conversation);
        }

        self.refresh_buckets().await?;
        Ok(outcome)
    }

    /// Applies every feed event that has already arrived.
    pub async fn pump_events(&mut self) -> usize {
        let mut applied = 0;
        let mut conversations_changed = false;
        while let Ok(event) = self.events_rx.try_recv() {
            let is_conversation = matches!(event, FeedEvent::Conversation { .. });
            if self.apply_event(event) {
                applied += 1;
                conversations_changed |= is_conversation;
            }
        }

        if conversations_changed && let Err(error) = self.refresh_buckets().await {
            tracing::warn!(error = %error, "failed to refresh conversation buckets");
        }
        applied
    }

    /// Waits for the next feed event and applies it. Returns whether it changed state.
    pub async fn process_next_event(&mut self) -> bool {
        let Some(event) = self.events_rx.recv().await else {
            return false;
        };
        let is_conversation = matches!(event, FeedEvent::Conversation { .. });
        let applied = self.apply_event(event);
        if applied && is_conversation && let Err(error) = self.refresh_buckets().await {
            tracing::warn!(error = %error, "failed to refresh conversation buckets");
        }
        applied
    }

    /// Releases feeds and state, wipes the session, then runs the logout callback.
    pub fn logout(&mut self) -> LogoutReport {
        self.teardown();
        self.conversations = ConversationStore::new();
        self.buckets = ConversationBuckets::default();
        self.search = SearchState::default();
        self.status = None;

        let report = self.session.logout();
        if let Some(callback) = self.on_logout.as_mut() {
            callback(&report);
        }
        report
    }

    /// Releases every live feed. Events already queued from them are ignored.
    pub fn teardown(&mut self) {
        self.close_thread();
        self.release_feeds();
    }

    fn apply_event(&mut self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::Conversation { feed, conversation } => {
                self.conversations.apply_stream(feed, conversation)
            }
            FeedEvent::Message { feed, message } => match self.thread.as_mut() {
                Some(thread) => thread.store.apply_stream(feed, message),
                None => false,
            },
            FeedEvent::Closed { feed, error } => {
                match error {
                    Some(error) => tracing::warn!(feed = feed.raw(), error = %error, "feed closed"),
                    None => tracing::debug!(feed = feed.raw(), "feed closed"),
                }
                false
            }
        }
    }

    fn release_feeds(&mut self) {
        if let Some(mut subscription) = self.conversation_feed.take() {
            subscription.unsubscribe();
        }
        self.conversations.detach();
    }

    fn close_thread(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.release();
        }
    }

    fn client(&self) -> InboxResult<Arc<dyn MessagingClient>> {
        self.session.client().context(NoActiveClientSnafu {
            stage: "inbox-client",
        })
    }

    fn thread_peer(&self) -> InboxResult<(Arc<dyn MessagingClient>, Address)> {
        let client = self.client()?;
        let thread = self.thread.as_ref().context(NoActiveConversationSnafu {
            stage: "thread-peer",
        })?;
        Ok((client, thread.selection.peer().clone()))
    }

    async fn settle_trust_prompt(&mut self) -> InboxResult<()> {
        if let Some(thread) = self.thread.as_mut() {
            thread.trust_prompt = false;
        }
        self.refresh_buckets().await
    }

    fn record_status<T>(&mut self, result: InboxResult<T>) -> InboxResult<T> {
        match &result {
            Ok(_) => self.status = None,
            Err(error) => {
                tracing::warn!(error = %error, "inbox action failed");
                self.status = Some(error.status_message());
            }
        }
        result
    }
}

impl Drop for FloatingInbox {
    fn drop(&mut self) {
        self.teardown();
    }
}
