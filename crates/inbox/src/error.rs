use inbox_storage::StorageError;
use snafu::Snafu;

use crate::address::Address;
use crate::sdk::SdkError;

pub const STATUS_INVALID_ADDRESS: &str = "Invalid Ethereum address";
pub const STATUS_RESOLUTION_FAILED: &str = "Error resolving address";
pub const STATUS_SELF_MESSAGING: &str = "No self messaging allowed";
pub const STATUS_NOT_ON_NETWORK: &str = "Address is not on the network ❌";
pub const STATUS_EMPTY_MESSAGE: &str = "Empty message";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InboxError {
    #[snafu(display("'{input}' is not a valid address"))]
    InvalidAddress { stage: &'static str, input: String },
    #[snafu(display("failed to resolve name '{name}': {details}"))]
    ResolutionFailed {
        stage: &'static str,
        name: String,
        details: String,
    },
    #[snafu(display("no compatible wallet provider is available: {details}"))]
    SignerUnavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("private key is malformed: {details}"))]
    InvalidKey {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("message text is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("cannot message own address {address}"))]
    SelfMessaging {
        stage: &'static str,
        address: Address,
    },
    #[snafu(display("{address} is not on the network"))]
    NotOnNetwork {
        stage: &'static str,
        address: Address,
    },
    #[snafu(display("local storage failed on `{stage}`: {source}"))]
    PersistenceFailure {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("invalid configuration: {details}"))]
    InvalidConfiguration {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("no messaging client is connected"))]
    NoActiveClient { stage: &'static str },
    #[snafu(display("no conversation is selected"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("no peer address is selected for a new conversation"))]
    NoPeerSelected { stage: &'static str },
    #[snafu(display("messaging client failed on `{stage}`: {source}"))]
    Sdk {
        stage: &'static str,
        source: SdkError,
    },
}

pub type InboxResult<T> = Result<T, InboxError>;

impl InboxError {
    /// True for every failure that means "the input does not name a usable address".
    pub fn is_invalid_address(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. } | Self::ResolutionFailed { .. }
        )
    }

    /// Inline status text shown in place of the failed action.
    pub fn status_message(&self) -> String {
        match self {
            Self::InvalidAddress { .. } => STATUS_INVALID_ADDRESS.to_string(),
            Self::ResolutionFailed { .. } => STATUS_RESOLUTION_FAILED.to_string(),
            Self::SignerUnavailable { .. } => "No wallet provider found".to_string(),
            Self::InvalidKey { .. } => "Invalid private key".to_string(),
            Self::EmptyMessage { .. } => STATUS_EMPTY_MESSAGE.to_string(),
            Self::SelfMessaging { .. } => STATUS_SELF_MESSAGING.to_string(),
            Self::NotOnNetwork { .. } => STATUS_NOT_ON_NETWORK.to_string(),
            Self::PersistenceFailure { .. } => "Could not access local storage".to_string(),
            Self::InvalidConfiguration { details, .. } => format!("Configuration error: {details}"),
            Self::NoActiveClient { .. } => "Not connected to XMTP".to_string(),
            Self::NoActiveConversation { .. } => "No conversation selected".to_string(),
            Self::NoPeerSelected { .. } => "Enter an address to start a conversation".to_string(),
            Self::Sdk { .. } => "Something went wrong, please retry".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_failures_share_the_invalid_address_class() {
        let invalid = InboxError::InvalidAddress {
            stage: "test",
            input: "nope".to_string(),
        };
        let unresolved = InboxError::ResolutionFailed {
            stage: "test",
            name: "ghost.eth".to_string(),
            details: "no resolver".to_string(),
        };
        let empty = InboxError::EmptyMessage { stage: "test" };

        assert!(invalid.is_invalid_address());
        assert!(unresolved.is_invalid_address());
        assert!(!empty.is_invalid_address());
    }

    #[test]
    fn status_text_matches_inline_messages() {
        let address = Address::parse("0x1111111111111111111111111111111111111111").unwrap();
        assert_eq!(
            InboxError::SelfMessaging {
                stage: "test",
                address: address.clone(),
            }
            .status_message(),
            "No self messaging allowed"
        );
        assert_eq!(
            InboxError::NotOnNetwork {
                stage: "test",
                address,
            }
            .status_message(),
            "Address is not on the network ❌"
        );
        assert_eq!(
            InboxError::InvalidAddress {
                stage: "test",
                input: "bob".to_string(),
            }
            .status_message(),
            "Invalid Ethereum address"
        );
    }
}
