//! Event dispatcher: routes inbound frames to per-channel handlers.
//!
//! Classification order:
//! 1. control frames are returned to the driver and never reach handlers;
//! 2. typing events go to the typing handlers of the frame's channel;
//! 3. everything else is normalized, deduplicated when it carries a message
//!    id, and fanned out to the message handlers of the frame's channel.
//!
//! Handler lists are snapshotted under the lock and invoked after it is
//! released, so a handler may register or unregister handlers itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use deskline_shared::{ChannelName, ControlEvent, DomainEvent, Frame, TypingIndicator};
use parking_lot::Mutex;
use serde_json::Value;

/// A domain event delivered to message handlers.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: ChannelName,
    /// Event name exactly as received.
    pub event: String,
    pub payload: DomainEvent,
    /// Raw (decoded) data for fields the normalized payload does not cover.
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TypingEvent {
    pub channel: ChannelName,
    pub event: String,
    pub indicator: TypingIndicator,
    pub received_at: DateTime<Utc>,
}

pub type MessageHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;
pub type TypingHandler = Arc<dyn Fn(&TypingEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Message,
    Typing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Control(ControlEvent),
    /// Number of handlers invoked.
    Delivered(usize),
    Duplicate,
    /// Domain frame without a channel.
    Unrouted,
}

struct HandlerTable {
    next_id: u64,
    message: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
    typing: HashMap<String, Vec<(HandlerId, TypingHandler)>>,
}

/// Bounded history of `(channel, message id)` pairs already delivered.
struct RecentMessages {
    capacity: usize,
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `false` when the key was already seen.
    fn insert(&mut self, channel: &str, id: &str) -> bool {
        let key = (channel.to_string(), id.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

pub struct Dispatcher {
    handlers: Mutex<HandlerTable>,
    recent: Mutex<RecentMessages>,
}

impl Dispatcher {
    pub fn new(dedup_window: usize) -> Self {
        Self {
            handlers: Mutex::new(HandlerTable {
                next_id: 0,
                message: HashMap::new(),
                typing: HashMap::new(),
            }),
            recent: Mutex::new(RecentMessages::new(dedup_window)),
        }
    }

    pub fn on_message(&self, channel: &ChannelName, handler: MessageHandler) -> HandlerId {
        let mut table = self.handlers.lock();
        table.next_id += 1;
        let id = HandlerId(table.next_id);
        table
            .message
            .entry(channel.logical().to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn on_typing(&self, channel: &ChannelName, handler: TypingHandler) -> HandlerId {
        let mut table = self.handlers.lock();
        table.next_id += 1;
        let id = HandlerId(table.next_id);
        table
            .typing
            .entry(channel.logical().to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove one handler. Returns `false` if it was already gone.
    pub fn remove(&self, kind: HandlerKind, channel: &ChannelName, id: HandlerId) -> bool {
        let mut table = self.handlers.lock();
        match kind {
            HandlerKind::Message => remove_from(&mut table.message, channel.logical(), id),
            HandlerKind::Typing => remove_from(&mut table.typing, channel.logical(), id),
        }
    }

    pub fn handler_count(&self, kind: HandlerKind, channel: &ChannelName) -> usize {
        let table = self.handlers.lock();
        let count = match kind {
            HandlerKind::Message => table.message.get(channel.logical()).map(Vec::len),
            HandlerKind::Typing => table.typing.get(channel.logical()).map(Vec::len),
        };
        count.unwrap_or(0)
    }

    pub fn dispatch(&self, frame: &Frame) -> Dispatch {
        if let Some(control) = ControlEvent::from_frame(frame) {
            return Dispatch::Control(control);
        }

        let Some(channel) = frame.channel_name() else {
            crate::log_debug!("Dropping {} without a channel", frame.event);
            return Dispatch::Unrouted;
        };
        let received_at = Utc::now();

        match DomainEvent::normalize(&frame.event, &frame.data) {
            DomainEvent::Typing(indicator) => {
                let handlers: Vec<TypingHandler> = {
                    let table = self.handlers.lock();
                    snapshot(&table.typing, channel.logical())
                };
                let event = TypingEvent {
                    channel,
                    event: frame.event.clone(),
                    indicator,
                    received_at,
                };
                for handler in &handlers {
                    handler(&event);
                }
                Dispatch::Delivered(handlers.len())
            }
            payload => {
                if let Some(id) = payload.dedup_id() {
                    let fresh = self.recent.lock().insert(channel.logical(), id);
                    if !fresh {
                        crate::log_debug!(
                            "Duplicate message {} on {} ({})",
                            id,
                            channel,
                            frame.event
                        );
                        return Dispatch::Duplicate;
                    }
                }

                let handlers: Vec<MessageHandler> = {
                    let table = self.handlers.lock();
                    snapshot(&table.message, channel.logical())
                };
                let event = ChannelEvent {
                    channel,
                    event: frame.event.clone(),
                    payload,
                    data: frame.data.clone(),
                    received_at,
                };
                for handler in &handlers {
                    handler(&event);
                }
                Dispatch::Delivered(handlers.len())
            }
        }
    }
}

fn snapshot<H: Clone>(map: &HashMap<String, Vec<(HandlerId, H)>>, channel: &str) -> Vec<H> {
    map.get(channel)
        .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
        .unwrap_or_default()
}

fn remove_from<H>(map: &mut HashMap<String, Vec<(HandlerId, H)>>, channel: &str, id: HandlerId) -> bool {
    let Some(list) = map.get_mut(channel) else {
        return false;
    };
    let before = list.len();
    list.retain(|(existing, _)| *existing != id);
    let removed = list.len() != before;
    if list.is_empty() {
        map.remove(channel);
    }
    removed
}
