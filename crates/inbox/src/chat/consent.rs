use std::sync::Arc;

use snafu::{ResultExt, ensure};

use crate::address::Address;
use crate::chat::{ConsentState, Conversation};
use crate::error::{InboxResult, SdkSnafu, SelfMessagingSnafu};
use crate::sdk::MessagingClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentAction {
    Allow,
    Block,
}

impl ConsentState {
    /// Every explicit action is a legal transition from every state.
    pub const fn apply(self, action: ConsentAction) -> Self {
        match action {
            ConsentAction::Allow => Self::Allowed,
            ConsentAction::Block => Self::Blocked,
        }
    }

    /// Unknown peers must be accepted or blocked before the thread is fully usable.
    pub const fn needs_trust_prompt(self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Consent state of a peer before and after an outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentGrant {
    pub previous: ConsentState,
    pub current: ConsentState,
}

impl ConsentGrant {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Reads and mutates per-peer trust through the connected client.
#[derive(Clone)]
pub struct ConsentGate {
    client: Arc<dyn MessagingClient>,
}

impl ConsentGate {
    pub fn new(client: Arc<dyn MessagingClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn MessagingClient> {
        &self.client
    }

    pub fn own_address(&self) -> &Address {
        self.client.address()
    }

    /// Runs before any consent lookup; a peer equal to the session address is terminal.
    pub fn ensure_not_self(&self, peer: &Address) -> InboxResult<()> {
        ensure!(
            peer != self.own_address(),
            SelfMessagingSnafu {
                stage: "consent-self-check",
                address: peer.clone(),
            }
        );
        Ok(())
    }

    pub async fn query(&self, conversation: &Conversation) -> InboxResult<ConsentState> {
        self.ensure_not_self(&conversation.peer_address)?;
        self.client
            .consent_state(conversation)
            .await
            .context(SdkSnafu {
                stage: "consent-query",
            })
    }

    pub async fn allow(&self, peer: &Address) -> InboxResult<()> {
        self.transition(peer, ConsentAction::Allow).await
    }

    pub async fn block(&self, peer: &Address) -> InboxResult<()> {
        self.transition(peer, ConsentAction::Block).await
    }

    /// Pulls the authoritative list; returns only after the cache is reconciled.
    pub async fn refresh(&self) -> InboxResult<()> {
        self.client
            .refresh_consent_list()
            .await
            .context(SdkSnafu {
                stage: "consent-refresh",
            })
    }

    /// First outbound message is an implicit trust grant.
    ///
    /// Refreshes first so the decision is made against the authoritative list,
    /// then allows the peer unless it already is.
    pub async fn grant_on_send(&self, conversation: &Conversation) -> InboxResult<ConsentGrant> {
        self.ensure_not_self(&conversation.peer_address)?;
        self.refresh().await?;

        let previous = self.query(conversation).await?;
        if previous == ConsentState::Allowed {
            return Ok(ConsentGrant {
                previous,
                current: previous,
            });
        }

        self.client
            .allow(std::slice::from_ref(&conversation.peer_address))
            .await
            .context(SdkSnafu {
                stage: "consent-grant-on-send",
            })?;
        tracing::info!(
            peer = %conversation.peer_address,
            previous = %previous,
            "peer allowed by outbound message"
        );

        Ok(ConsentGrant {
            previous,
            current: ConsentState::Allowed,
        })
    }

    async fn transition(&self, peer: &Address, action: ConsentAction) -> InboxResult<()> {
        self.ensure_not_self(peer)?;

        let peers = std::slice::from_ref(peer);
        match action {
            ConsentAction::Allow => self.client.allow(peers).await.context(SdkSnafu {
                stage: "consent-allow",
            })?,
            ConsentAction::Block => self.client.deny(peers).await.context(SdkSnafu {
                stage: "consent-block",
            })?,
        }
        self.refresh().await?;

        tracing::info!(peer = %peer, action = ?action, "consent updated");
        Ok(())
    }
}
