use snafu::{OptionExt, ResultExt, ensure};

use crate::address::Address;
use crate::chat::subscription::{FeedSink, spawn_feed};
use crate::chat::{ConsentGate, ConsentGrant, Conversation, FeedEvent, FeedId, Message, Subscription};
use crate::error::{EmptyMessageSnafu, InboxResult, NoPeerSelectedSnafu, SdkSnafu};
use crate::sdk::MessagingClient;

/// Pure reducer for the fetch + stream merge: append unless the id is already present.
pub fn merge_message(current: &[Message], incoming: Message) -> Vec<Message> {
    let mut merged = current.to_vec();
    if !current.iter().any(|existing| existing.id == incoming.id) {
        merged.push(incoming);
    }
    merged
}

/// Rejects blank drafts before anything touches the network.
pub fn validate_message_text(text: &str) -> InboxResult<&str> {
    ensure!(
        !text.trim().is_empty(),
        EmptyMessageSnafu {
            stage: "validate-message-text",
        }
    );
    Ok(text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub conversation: Conversation,
    pub message: Message,
    /// Set when the send had to open the conversation first.
    pub created_conversation: bool,
    pub consent: ConsentGrant,
}

/// Ordered messages of the active conversation, or of a draft that has no
/// conversation yet.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversation: Option<Conversation>,
    messages: Vec<Message>,
    feed: Option<FeedId>,
}

impl MessageStore {
    pub fn new_draft() -> Self {
        Self::default()
    }

    pub fn for_conversation(conversation: Conversation) -> Self {
        Self {
            conversation: Some(conversation),
            ..Self::default()
        }
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// One-shot fetch in source order, deduplicated by id.
    pub async fn load_initial(&mut self, client: &dyn MessagingClient) -> InboxResult<&[Message]> {
        let Some(conversation) = self.conversation.as_ref() else {
            return Ok(&self.messages);
        };

        let fetched = client.messages(conversation).await.context(SdkSnafu {
            stage: "messages-load",
        })?;
        self.messages = fetched
            .into_iter()
            .fold(Vec::new(), |current, incoming| merge_message(&current, incoming));
        tracing::debug!(
            peer = %conversation.peer_address,
            count = self.messages.len(),
            "messages loaded"
        );
        Ok(&self.messages)
    }

    /// Opens the live feed for the bound conversation. Returns `None` for drafts.
    pub async fn subscribe(
        &mut self,
        client: &dyn MessagingClient,
        sink: FeedSink,
    ) -> InboxResult<Option<Subscription>> {
        let Some(conversation) = self.conversation.as_ref() else {
            return Ok(None);
        };

        let stream = client.stream_messages(conversation).await.context(SdkSnafu {
            stage: "messages-stream",
        })?;
        let feed = FeedId::next();
        self.feed = Some(feed);

        Ok(Some(spawn_feed(feed, stream, sink, |feed, message| {
            FeedEvent::Message { feed, message }
        })))
    }

    pub fn detach(&mut self) {
        self.feed = None;
    }

    pub fn accepts(&self, feed: FeedId) -> bool {
        self.feed == Some(feed)
    }

    pub fn apply_stream(&mut self, feed: FeedId, message: Message) -> bool {
        if !self.accepts(feed) {
            tracing::debug!(feed = feed.raw(), "dropping message from released feed");
            return false;
        }
        self.merge(message);
        true
    }

    pub fn merge(&mut self, message: Message) {
        self.messages = merge_message(&self.messages, message);
    }

    /// Sends `text` to the bound conversation, or opens one with `draft_peer`
    /// first when the store is a draft.
    ///
    /// Every send refreshes consent and allows the peer before dispatching.
    pub async fn send(
        &mut self,
        gate: &ConsentGate,
        draft_peer: Option<&Address>,
        text: &str,
    ) -> InboxResult<SendOutcome> {
        let text = validate_message_text(text)?;

        let (conversation, created_conversation) = match self.conversation.clone() {
            Some(conversation) => {
                gate.ensure_not_self(&conversation.peer_address)?;
                (conversation, false)
            }
            None => {
                let peer = draft_peer.context(NoPeerSelectedSnafu {
                    stage: "send-draft-peer",
                })?;
                gate.ensure_not_self(peer)?;
                let conversation = gate
                    .client()
                    .new_conversation(peer)
                    .await
                    .context(SdkSnafu {
                        stage: "send-new-conversation",
                    })?;
                tracing::info!(peer = %peer, "opened conversation for first message");
                self.conversation = Some(conversation.clone());
                (conversation, true)
            }
        };

        let consent = gate.grant_on_send(&conversation).await?;
        let message = gate
            .client()
            .send(&conversation, text)
            .await
            .context(SdkSnafu {
                stage: "send-message",
            })?;
        self.merge(message.clone());

        Ok(SendOutcome {
            conversation,
            message,
            created_conversation,
            consent,
        })
    }
}
