pub mod consent;
pub mod conversations;
pub mod messages;
mod model;
pub mod subscription;
pub mod time_text;

pub use consent::{ConsentAction, ConsentGate, ConsentGrant};
pub use conversations::{AllowedScope, ConversationBuckets, ConversationStore};
pub use messages::{MessageStore, SendOutcome};
pub use model::{
    ConsentState, Conversation, ConversationTab, Message, MessageBody, MessageId,
};
pub use subscription::{FeedEvent, FeedId, Subscription};
