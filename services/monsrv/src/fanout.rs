//! Fan-out of monitor records to any number of subscribers
//!
//! Records travel over a tokio broadcast channel. The feed counts live
//! [`Subscription`]s: the first one starts the poll source and dropping
//! the last one stops it again.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::record::MonitorRecord;

/// Producer that only polls while someone listens
pub trait PollSource: Send + Sync {
    fn start_polling(self: Arc<Self>);
    fn stop_polling(&self);
}

/// Reference counted broadcast feed
pub struct Feed<T: Clone> {
    source: Arc<dyn PollSource>,
    sender: broadcast::Sender<T>,
    subscribers: Mutex<usize>,
}

pub type MonitorFeed = Feed<Arc<MonitorRecord>>;

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new(source: Arc<dyn PollSource>, sender: broadcast::Sender<T>) -> Self {
        Self {
            source,
            sender,
            subscribers: Mutex::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.lock()
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        // Count and source transitions stay under one lock so churn
        // cannot start the source twice
        let mut count = self.subscribers.lock();
        let receiver = self.sender.subscribe();
        *count += 1;
        debug!("Feed subscribed, {} subscribers", *count);
        if *count == 1 {
            Arc::clone(&self.source).start_polling();
        }
        Subscription {
            feed: Arc::clone(self),
            receiver,
        }
    }
}

/// Live subscription; dropping it unsubscribes
pub struct Subscription<T: Clone> {
    feed: Arc<Feed<T>>,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next item, skipping over items lost to lag; `None` once the feed closed
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(item) => return Some(item),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagging, {} records skipped", skipped);
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut count = self.feed.subscribers.lock();
        *count = count.saturating_sub(1);
        debug!("Feed unsubscribed, {} subscribers", *count);
        if *count == 0 {
            self.feed.source.stop_polling();
        }
    }
}
