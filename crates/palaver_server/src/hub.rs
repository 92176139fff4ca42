#![forbid(unsafe_code)]

//! Topic-keyed fan-out hub used by the chat, presence and inbox channels.
//!
//! The registry index is a short-lived read/write lock around per-topic
//! entries; publishing into one topic only takes that topic's lock, so a slow
//! room never stalls the others.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for FanoutConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum HubItem<T> {
	Event(T),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged { dropped: u64 },
}

#[derive(Debug)]
pub struct FanoutHub<K, T> {
	topics: Arc<RwLock<HashMap<K, Arc<Mutex<TopicEntry<T>>>>>>,
	cfg: FanoutConfig,
}

impl<K, T> Clone for FanoutHub<K, T> {
	fn clone(&self) -> Self {
		Self {
			topics: Arc::clone(&self.topics),
			cfg: self.cfg.clone(),
		}
	}
}

#[derive(Debug)]
struct TopicEntry<T> {
	subscribers: Vec<mpsc::Sender<HubItem<T>>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

impl<T> Default for TopicEntry<T> {
	fn default() -> Self {
		Self {
			subscribers: Vec::new(),
			pending_lag_by_subscriber: Vec::new(),
		}
	}
}

impl<K, T> FanoutHub<K, T>
where
	K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug,
	T: Clone + Send,
{
	pub fn new(cfg: FanoutConfig) -> Self {
		Self {
			topics: Arc::new(RwLock::new(HashMap::new())),
			cfg,
		}
	}

	/// Subscribe to one topic. Dropping the receiver unsubscribes; the dead
	/// sender is pruned on the next publish or subscribe for that topic.
	pub async fn subscribe(&self, topic: K) -> mpsc::Receiver<HubItem<T>> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let entry = {
			let mut topics = self.topics.write().await;
			Arc::clone(topics.entry(topic).or_default())
		};

		let mut entry = entry.lock().await;
		prune_closed_subscribers(&mut entry);
		entry.subscribers.push(tx);
		entry.pending_lag_by_subscriber.push(0);

		rx
	}

	/// Publish one item to every live subscriber of `topic`. Subscribers with
	/// a full queue miss the item and get a lag marker once they drain.
	pub async fn publish(&self, topic: &K, item: T) {
		let entry = {
			let topics = self.topics.read().await;
			match topics.get(topic) {
				Some(entry) => Arc::clone(entry),
				None => return,
			}
		};

		let dropped_total = {
			let mut guard = entry.lock().await;
			let entry = &mut *guard;
			prune_closed_subscribers(entry);

			let mut dropped_total: u64 = 0;
			for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
				match sub.try_send(HubItem::Event(item.clone())) {
					Ok(()) => {
						if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx)
							&& *pending > 0 && sub.try_send(HubItem::Lagged { dropped: *pending }).is_ok()
						{
							*pending = 0;
						}
					}
					Err(mpsc::error::TrySendError::Full(_)) => {
						dropped_total += 1;
						if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx) {
							*pending = pending.saturating_add(1);
						}
					}
					Err(mpsc::error::TrySendError::Closed(_)) => {}
				}
			}

			prune_closed_subscribers(entry);
			dropped_total
		};

		if dropped_total > 0 {
			metrics::counter!("palaver_hub_dropped_total").increment(dropped_total);
			debug!(?topic, dropped = dropped_total, "fan-out: dropped due to full subscriber queues");
		}
	}

	/// Drop a topic whose subscribers are all gone.
	pub async fn prune_topic(&self, topic: &K) {
		let mut topics = self.topics.write().await;
		let empty = match topics.get(topic) {
			Some(entry) => {
				let mut entry = entry.lock().await;
				prune_closed_subscribers(&mut entry);
				entry.subscribers.is_empty()
			}
			None => return,
		};

		if empty {
			topics.remove(topic);
		}
	}

	pub async fn subscriber_count(&self, topic: &K) -> usize {
		let entry = {
			let topics = self.topics.read().await;
			match topics.get(topic) {
				Some(entry) => Arc::clone(entry),
				None => return 0,
			}
		};
		let entry = entry.lock().await;
		entry.subscribers.iter().filter(|s| !s.is_closed()).count()
	}
}

fn prune_closed_subscribers<T>(entry: &mut TopicEntry<T>) {
	if entry.subscribers.len() != entry.pending_lag_by_subscriber.len() {
		entry.pending_lag_by_subscriber.resize(entry.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(entry.subscribers.len());
	let mut new_lag = Vec::with_capacity(entry.subscribers.len());

	for (idx, s) in entry.subscribers.drain(..).enumerate() {
		if !s.is_closed() {
			new_subs.push(s);
			new_lag.push(*entry.pending_lag_by_subscriber.get(idx).unwrap_or(&0));
		}
	}

	entry.subscribers = new_subs;
	entry.pending_lag_by_subscriber = new_lag;
}
