use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::chat::{Conversation, Message};
use crate::sdk::FeedStream;

static NEXT_FEED_ID: AtomicU64 = AtomicU64::new(1);

/// Tags every event with the subscription that produced it, so events from a
/// released subscription can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(u64);

impl FeedId {
    pub fn next() -> Self {
        Self(NEXT_FEED_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Conversation {
        feed: FeedId,
        conversation: Conversation,
    },
    Message {
        feed: FeedId,
        message: Message,
    },
    /// The upstream feed ended; `error` is set when it ended on a failure.
    Closed {
        feed: FeedId,
        error: Option<String>,
    },
}

impl FeedEvent {
    pub fn feed(&self) -> FeedId {
        match self {
            Self::Conversation { feed, .. } | Self::Message { feed, .. } | Self::Closed { feed, .. } => {
                *feed
            }
        }
    }
}

pub type FeedSink = mpsc::UnboundedSender<FeedEvent>;

/// Handle to a live feed. Dropping it releases the feed.
#[derive(Debug)]
pub struct Subscription {
    feed: FeedId,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn feed(&self) -> FeedId {
        self.feed
    }

    pub fn is_active(&self) -> bool {
        self.cancel_tx
            .as_ref()
            .is_some_and(|cancel_tx| !cancel_tx.is_closed())
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
            tracing::debug!(feed = self.feed.raw(), "feed unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Forwards `stream` into `sink` until the stream ends, the sink is gone, or the
/// returned handle is released.
pub(crate) fn spawn_feed<T, F>(
    feed: FeedId,
    mut stream: FeedStream<T>,
    sink: FeedSink,
    wrap: F,
) -> Subscription
where
    T: Send + 'static,
    F: Fn(FeedId, T) -> FeedEvent + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = oneshot::channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    tracing::debug!(feed = feed.raw(), "feed worker cancelled");
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if sink.send(wrap(feed, item)).is_err() {
                                return;
                            }
                        }
                        Some(Err(error)) => {
                            tracing::warn!(feed = feed.raw(), error = %error, "feed emitted an error");
                            let _ = sink.send(FeedEvent::Closed {
                                feed,
                                error: Some(error.to_string()),
                            });
                            return;
                        }
                        None => {
                            let _ = sink.send(FeedEvent::Closed { feed, error: None });
                            return;
                        }
                    }
                }
            }
        }
    });

    Subscription {
        feed,
        cancel_tx: Some(cancel_tx),
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::address::Address;
    use crate::sdk::SdkError;

    fn conversation(created: u64) -> Conversation {
        Conversation::new(
            Address::parse("0x2222222222222222222222222222222222222222").unwrap(),
            created,
        )
    }

    #[tokio::test]
    async fn forwards_items_then_reports_close() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let feed = FeedId::next();
        let items = stream::iter(vec![Ok(conversation(1)), Ok(conversation(2))]).boxed();
        let _subscription = spawn_feed(feed, items, sink, |feed, conversation| {
            FeedEvent::Conversation { feed, conversation }
        });

        assert!(matches!(events.recv().await, Some(FeedEvent::Conversation { .. })));
        assert!(matches!(events.recv().await, Some(FeedEvent::Conversation { .. })));
        assert_eq!(events.recv().await, Some(FeedEvent::Closed { feed, error: None }));
    }

    #[tokio::test]
    async fn errors_close_the_feed_with_details() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let feed = FeedId::next();
        let items = stream::iter(vec![Err::<Conversation, _>(SdkError::Network {
            stage: "test",
            details: "socket closed".to_string(),
        })])
        .boxed();
        let _subscription = spawn_feed(feed, items, sink, |feed, conversation| {
            FeedEvent::Conversation { feed, conversation }
        });

        match events.recv().await {
            Some(FeedEvent::Closed { error: Some(error), .. }) => {
                assert!(error.contains("socket closed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let feed = FeedId::next();
        let idle = stream::pending::<crate::sdk::SdkResult<Conversation>>().boxed();
        let mut subscription = spawn_feed(feed, idle, sink, |feed, conversation| {
            FeedEvent::Conversation { feed, conversation }
        });
        assert!(subscription.is_active());

        subscription.unsubscribe();
        assert!(!subscription.is_active());
        // The worker drops its sink once it observes the cancel.
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn feed_ids_are_unique() {
        assert_ne!(FeedId::next(), FeedId::next());
    }
}
