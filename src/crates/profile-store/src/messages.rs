//! Per-profile message queue processing
//!
//! Messages live in the document's queue until a handler acknowledges them.
//! Delivery is at-least-once across sessions and at-most-once per handler
//! generation: each delivery records the handler's generation id in the
//! message's `deliveredTo` set, and generation ids embed the session load
//! count, so a new session offers every unacknowledged message again.
//!
//! Acknowledgements and delivery marks are collected locally and merged into
//! the stored queue inside the next session write, so they never race with
//! senders appending to the same queue.

use crate::document::QueuedMessage;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

pub(crate) type MessageHandlerFn = Arc<dyn Fn(&Value, MessageAck) + Send + Sync>;

#[derive(Default)]
struct MessageState {
    /// Queue as last read from or written to the store
    queue: Vec<QueuedMessage>,
    handlers: Vec<(String, MessageHandlerFn)>,
    generation_prefix: String,
    acked: HashSet<Uuid>,
    offered: HashMap<Uuid, BTreeSet<String>>,
}

struct Shared {
    state: Mutex<MessageState>,
    save_requested: Arc<Notify>,
}

/// Handed to a message handler together with the message. Calling
/// [`MessageAck::processed`] removes the message from the queue on the next
/// write; it may be called later, from any task.
#[derive(Clone)]
pub struct MessageAck {
    id: Uuid,
    shared: Arc<Shared>,
}

impl MessageAck {
    pub fn message_id(&self) -> Uuid {
        self.id
    }

    pub fn processed(&self) {
        let inserted = self.shared.state.lock().acked.insert(self.id);
        if inserted {
            self.shared.save_requested.notify_one();
        }
    }
}

impl fmt::Debug for MessageAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageAck").field("id", &self.id).finish()
    }
}

/// Delivery state not yet persisted, captured for one write
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingDelivery {
    pub acked: HashSet<Uuid>,
    pub offered: HashMap<Uuid, BTreeSet<String>>,
}

impl PendingDelivery {
    pub fn is_empty(&self) -> bool {
        self.acked.is_empty() && self.offered.is_empty()
    }

    /// Merge into a stored queue: drop acknowledged messages and record
    /// delivery marks on the rest
    pub fn apply(&self, queue: &mut Vec<QueuedMessage>) {
        queue.retain(|message| !self.acked.contains(&message.id));
        for message in queue.iter_mut() {
            if let Some(generations) = self.offered.get(&message.id) {
                message.delivered_to.extend(generations.iter().cloned());
            }
        }
    }
}

pub(crate) struct MessageProcessor {
    shared: Arc<Shared>,
    delivering: AtomicBool,
    rerun: AtomicBool,
}

impl MessageProcessor {
    pub fn new(save_requested: Arc<Notify>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MessageState::default()),
                save_requested,
            }),
            delivering: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    /// Start a new session generation with the queue loaded at acquisition
    pub fn start_generation(&self, prefix: String, queue: Vec<QueuedMessage>) {
        let mut state = self.shared.state.lock();
        state.generation_prefix = prefix;
        state.queue = queue;
        let handlers = std::mem::take(&mut state.handlers);
        let prefix = state.generation_prefix.clone();
        state.handlers = handlers
            .into_iter()
            .enumerate()
            .map(|(index, (_, handler))| (format!("{}:{}", prefix, index), handler))
            .collect();
    }

    pub fn register(&self, handler: MessageHandlerFn) -> String {
        let mut state = self.shared.state.lock();
        let generation = format!("{}:{}", state.generation_prefix, state.handlers.len());
        state.handlers.push((generation.clone(), handler));
        generation
    }

    /// Messages still waiting for an acknowledgement
    pub fn queued(&self) -> Vec<QueuedMessage> {
        let state = self.shared.state.lock();
        state
            .queue
            .iter()
            .filter(|message| !state.acked.contains(&message.id))
            .cloned()
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        let state = self.shared.state.lock();
        !state.acked.is_empty() || !state.offered.is_empty()
    }

    pub fn pending(&self) -> PendingDelivery {
        let state = self.shared.state.lock();
        PendingDelivery {
            acked: state.acked.clone(),
            offered: state.offered.clone(),
        }
    }

    /// A write carrying `pending` succeeded and stored `queue`
    pub fn committed(&self, queue: Vec<QueuedMessage>, pending: &PendingDelivery) {
        let mut state = self.shared.state.lock();
        state.queue = queue;
        for id in &pending.acked {
            state.acked.remove(id);
        }
        for (id, generations) in &pending.offered {
            if let Some(current) = state.offered.get_mut(id) {
                current.retain(|generation| !generations.contains(generation));
                if current.is_empty() {
                    state.offered.remove(id);
                }
            }
        }
    }

    /// Offer every queued message to every handler that has not seen it.
    ///
    /// Handlers run synchronously on the calling task. A handler that
    /// registers another handler or acknowledges a message re-enters here;
    /// the nested call is folded into another pass of the outer one.
    pub fn deliver(&self) {
        loop {
            if self.delivering.swap(true, Ordering::SeqCst) {
                self.rerun.store(true, Ordering::SeqCst);
                return;
            }
            self.rerun.store(false, Ordering::SeqCst);
            self.delivery_pass();
            self.delivering.store(false, Ordering::SeqCst);

            if !self.rerun.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn delivery_pass(&self) {
        let (queue, handlers) = {
            let state = self.shared.state.lock();
            (state.queue.clone(), state.handlers.clone())
        };

        for message in &queue {
            for (generation, handler) in &handlers {
                {
                    let mut state = self.shared.state.lock();
                    if state.acked.contains(&message.id) {
                        break;
                    }
                    let seen = message.delivered_to.contains(generation)
                        || state
                            .offered
                            .get(&message.id)
                            .map_or(false, |offered| offered.contains(generation));
                    if seen {
                        continue;
                    }
                    state
                        .offered
                        .entry(message.id)
                        .or_default()
                        .insert(generation.clone());
                }

                handler(
                    &message.message,
                    MessageAck {
                        id: message.id,
                        shared: Arc::clone(&self.shared),
                    },
                );
            }
        }
    }
}
