//! In-process event bus over a tokio broadcast channel.

use async_trait::async_trait;
use conduit_core::Result;
use conduit_core::events::Event;
use conduit_core::ports::{EventBus, EventStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out event bus for a single process.
///
/// Subscribers only see events published after they subscribed; a
/// subscriber that falls more than `capacity` events behind skips ahead.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        // No receivers is not an error: nobody is listening yet.
        match self.sender.send(event) {
            Ok(receivers) => debug!(%subject, receivers, "published event"),
            Err(_) => debug!(%subject, "published event with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!("Subscribing to pattern: {}", pattern);
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = futures::stream::unfold(
            (receiver, pattern),
            |(mut receiver, pattern)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if subject_matches(&pattern, &event.subject()) {
                                return Some((Ok(event), (receiver, pattern)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%pattern, skipped, "event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return pattern.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
