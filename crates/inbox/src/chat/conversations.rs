use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::address::Address;
use crate::chat::subscription::{FeedSink, spawn_feed};
use crate::chat::{ConsentState, Conversation, ConversationTab, FeedEvent, FeedId, Subscription};
use crate::error::{InboxResult, SdkSnafu};
use crate::sdk::MessagingClient;

/// Which list the "allowed" bucket is computed over.
///
/// `FullList` ignores the search filter and own-address exclusion for the allowed
/// bucket while requests still honour them. `Filtered` applies the filter to both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedScope {
    #[default]
    FullList,
    Filtered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationBuckets {
    pub allowed: Vec<Conversation>,
    pub requests: Vec<Conversation>,
}

impl ConversationBuckets {
    pub fn for_tab(&self, tab: ConversationTab) -> &[Conversation] {
        match tab {
            ConversationTab::Allowed => &self.allowed,
            ConversationTab::Requests => &self.requests,
        }
    }
}

/// Newest first; ties broken by peer address so the order is total.
pub fn sort_by_recent_desc(conversations: &mut [Conversation]) {
    conversations.sort_by(|left, right| {
        Reverse(left.created_at_unix_ms)
            .cmp(&Reverse(right.created_at_unix_ms))
            .then_with(|| left.peer_address.cmp(&right.peer_address))
    });
}

/// Pure reducer for the fetch + stream merge. An entry for the same peer is
/// replaced by the incoming one.
pub fn merge_conversation(current: &[Conversation], incoming: Conversation) -> Vec<Conversation> {
    let mut merged: Vec<Conversation> = current
        .iter()
        .filter(|existing| existing.peer_address != incoming.peer_address)
        .cloned()
        .collect();
    merged.push(incoming);
    sort_by_recent_desc(&mut merged);
    merged
}

pub fn matches_search(conversation: &Conversation, search: &str, own_address: &Address) -> bool {
    conversation.peer_address.contains_ignore_case(search.trim())
        && &conversation.peer_address != own_address
}

/// Splits `list` into allowed and request buckets using each entry's recorded
/// consent state. Blocked conversations land in neither.
pub fn partition(
    list: &[Conversation],
    search: &str,
    own_address: &Address,
    scope: AllowedScope,
) -> ConversationBuckets {
    let filtered = move || {
        list.iter()
            .filter(move |conversation| matches_search(conversation, search, own_address))
    };

    let allowed = match scope {
        AllowedScope::FullList => list
            .iter()
            .filter(|conversation| conversation.consent_state == ConsentState::Allowed)
            .cloned()
            .collect(),
        AllowedScope::Filtered => filtered()
            .filter(|conversation| conversation.consent_state == ConsentState::Allowed)
            .cloned()
            .collect(),
    };
    let requests = filtered()
        .filter(|conversation| conversation.consent_state == ConsentState::Unknown)
        .cloned()
        .collect();

    ConversationBuckets { allowed, requests }
}

/// In-memory, newest-first conversation list for one session.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    feed: Option<FeedId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Replaces the list with a fresh fetch.
    pub async fn load(&mut self, client: &dyn MessagingClient) -> InboxResult<&[Conversation]> {
        let fetched = client.list_conversations().await.context(SdkSnafu {
            stage: "conversations-list",
        })?;

        self.conversations = fetched
            .into_iter()
            .fold(Vec::new(), |current, incoming| merge_conversation(&current, incoming));
        tracing::debug!(count = self.conversations.len(), "conversations loaded");
        Ok(&self.conversations)
    }

    /// Opens the live feed. Events are delivered to `sink` tagged with the
    /// returned subscription's feed id; only that id is accepted afterwards.
    pub async fn subscribe(
        &mut self,
        client: &dyn MessagingClient,
        sink: FeedSink,
    ) -> InboxResult<Subscription> {
        let stream = client.stream_conversations().await.context(SdkSnafu {
            stage: "conversations-stream",
        })?;
        let feed = FeedId::next();
        self.feed = Some(feed);

        Ok(spawn_feed(feed, stream, sink, |feed, conversation| {
            FeedEvent::Conversation { feed, conversation }
        }))
    }

    /// Stops accepting events from the current feed.
    pub fn detach(&mut self) {
        self.feed = None;
    }

    pub fn accepts(&self, feed: FeedId) -> bool {
        self.feed == Some(feed)
    }

    /// Applies a streamed conversation if it came from the live feed.
    pub fn apply_stream(&mut self, feed: FeedId, conversation: Conversation) -> bool {
        if !self.accepts(feed) {
            tracing::debug!(feed = feed.raw(), "dropping conversation from released feed");
            return false;
        }
        self.insert(conversation);
        true
    }

    pub fn insert(&mut self, conversation: Conversation) {
        self.conversations = merge_conversation(&self.conversations, conversation);
    }

    pub fn find(&self, peer: &Address) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.peer_address == peer)
    }

    /// Refreshes every entry's consent state from the client, then buckets the list.
    /// A failed lookup keeps the last known state.
    pub async fn partition(
        &mut self,
        client: &dyn MessagingClient,
        search: &str,
        scope: AllowedScope,
    ) -> ConversationBuckets {
        for conversation in &mut self.conversations {
            match client.consent_state(conversation).await {
                Ok(state) => conversation.consent_state = state,
                Err(error) => tracing::warn!(
                    peer = %conversation.peer_address,
                    error = %error,
                    "failed to read consent state"
                ),
            }
        }

        partition(&self.conversations, search, client.address(), scope)
    }
}
