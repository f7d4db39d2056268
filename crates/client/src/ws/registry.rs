//! Subscription registry: which channels consumers want, and how far each
//! one has progressed towards a server-acknowledged subscription.
//!
//! Entries are reference counted. Only the 0→1 transition starts an
//! authenticate-then-subscribe sequence and only 1→0 removes the entry, so
//! any number of consumers can share one channel subscription.

use std::collections::HashMap;

use deskline_shared::ChannelName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Wanted, nothing sent on the current socket.
    Idle,
    /// A grant request is in flight.
    Authorizing { attempt: u64 },
    /// Subscribe frame sent, waiting for the ack.
    Pending,
    Subscribed,
    /// Auth refused or the server rejected the subscribe. Retried on reconnect.
    Failed,
}

impl SubscriptionStatus {
    /// Whether the server may hold a subscription we would need to undo.
    pub fn reached_server(self) -> bool {
        matches!(self, SubscriptionStatus::Pending | SubscriptionStatus::Subscribed)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub channel: ChannelName,
    pub refs: usize,
    pub status: SubscriptionStatus,
}

/// Outcome of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Decremented { remaining: usize },
    /// Last reference gone; the entry was removed in this state.
    Removed { status: SubscriptionStatus },
    Unknown,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: HashMap<String, ChannelEntry>,
    next_attempt: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference. Returns `true` when this is the first one.
    pub fn want(&mut self, channel: &ChannelName) -> bool {
        let entry = self
            .channels
            .entry(channel.logical().to_string())
            .or_insert_with(|| ChannelEntry {
                channel: channel.clone(),
                refs: 0,
                status: SubscriptionStatus::Idle,
            });
        entry.refs += 1;
        entry.refs == 1
    }

    pub fn release(&mut self, channel: &ChannelName) -> Release {
        let Some(entry) = self.channels.get_mut(channel.logical()) else {
            return Release::Unknown;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return Release::Decremented {
                remaining: entry.refs,
            };
        }
        let status = entry.status;
        self.channels.remove(channel.logical());
        Release::Removed { status }
    }

    pub fn ref_count(&self, channel: &ChannelName) -> usize {
        self.channels
            .get(channel.logical())
            .map_or(0, |entry| entry.refs)
    }

    pub fn contains(&self, channel: &ChannelName) -> bool {
        self.channels.contains_key(channel.logical())
    }

    pub fn status(&self, channel: &ChannelName) -> Option<SubscriptionStatus> {
        self.channels.get(channel.logical()).map(|entry| entry.status)
    }

    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.status(channel) == Some(SubscriptionStatus::Subscribed)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Every wanted channel, in name order.
    pub fn desired(&self) -> Vec<ChannelName> {
        let mut channels: Vec<ChannelName> = self
            .channels
            .values()
            .map(|entry| entry.channel.clone())
            .collect();
        channels.sort_by(|a, b| a.logical().cmp(b.logical()));
        channels
    }

    /// Start a subscribe attempt. `None` when the channel is not wanted or is
    /// already authorizing, pending or subscribed on this socket.
    pub fn begin_attempt(&mut self, channel: &ChannelName) -> Option<u64> {
        let entry = self.channels.get_mut(channel.logical())?;
        match entry.status {
            SubscriptionStatus::Idle | SubscriptionStatus::Failed => {
                self.next_attempt += 1;
                entry.status = SubscriptionStatus::Authorizing {
                    attempt: self.next_attempt,
                };
                Some(self.next_attempt)
            }
            _ => None,
        }
    }

    /// Settle an attempt. Returns `false` when the attempt is stale: the
    /// channel was released, or a reconnect superseded it.
    pub fn complete_attempt(&mut self, channel: &ChannelName, attempt: u64, granted: bool) -> bool {
        let Some(entry) = self.channels.get_mut(channel.logical()) else {
            return false;
        };
        if entry.status != (SubscriptionStatus::Authorizing { attempt }) {
            return false;
        }
        entry.status = if granted {
            SubscriptionStatus::Pending
        } else {
            SubscriptionStatus::Failed
        };
        true
    }

    /// Record the server ack. `false` for channels no longer wanted.
    pub fn mark_subscribed(&mut self, channel: &ChannelName) -> bool {
        match self.channels.get_mut(channel.logical()) {
            Some(entry) => {
                entry.status = SubscriptionStatus::Subscribed;
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, channel: &ChannelName) -> bool {
        match self.channels.get_mut(channel.logical()) {
            Some(entry) => {
                entry.status = SubscriptionStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// The socket is gone; nothing is subscribed any more. In-flight attempts
    /// become stale.
    pub fn reset(&mut self) {
        for entry in self.channels.values_mut() {
            entry.status = SubscriptionStatus::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn conv(n: u32) -> ChannelName {
        ChannelName::conversation(n)
    }

    #[test]
    fn only_first_want_starts_subscription() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.want(&conv(1)));
        assert!(!registry.want(&conv(1)));
        assert_eq!(registry.ref_count(&conv(1)), 2);

        assert_eq!(
            registry.release(&conv(1)),
            Release::Decremented { remaining: 1 }
        );
        assert_eq!(
            registry.release(&conv(1)),
            Release::Removed {
                status: SubscriptionStatus::Idle
            }
        );
        assert_eq!(registry.release(&conv(1)), Release::Unknown);
        assert!(registry.is_empty());
    }

    #[test]
    fn wire_and_logical_names_share_an_entry() {
        let mut registry = SubscriptionRegistry::new();
        registry.want(&ChannelName::parse("conversation.5"));
        assert!(!registry.want(&ChannelName::parse("private-conversation.5")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_attempts_join() {
        let mut registry = SubscriptionRegistry::new();
        registry.want(&conv(1));
        let attempt = registry.begin_attempt(&conv(1)).unwrap();
        assert_eq!(registry.begin_attempt(&conv(1)), None);

        assert!(registry.complete_attempt(&conv(1), attempt, true));
        assert_eq!(registry.status(&conv(1)), Some(SubscriptionStatus::Pending));
        assert!(registry.mark_subscribed(&conv(1)));
        assert!(registry.is_subscribed(&conv(1)));
        assert_eq!(registry.begin_attempt(&conv(1)), None);
    }

    #[test]
    fn grant_for_released_channel_is_stale() {
        let mut registry = SubscriptionRegistry::new();
        registry.want(&conv(1));
        let first = registry.begin_attempt(&conv(1)).unwrap();
        assert_eq!(
            registry.release(&conv(1)),
            Release::Removed {
                status: SubscriptionStatus::Authorizing { attempt: first }
            }
        );
        assert!(!registry.complete_attempt(&conv(1), first, true));

        // Wanted again: the old grant still must not be used.
        registry.want(&conv(1));
        let second = registry.begin_attempt(&conv(1)).unwrap();
        assert_ne!(first, second);
        assert!(!registry.complete_attempt(&conv(1), first, true));
        assert!(registry.complete_attempt(&conv(1), second, true));
    }

    #[test]
    fn reset_invalidates_in_flight_attempts() {
        let mut registry = SubscriptionRegistry::new();
        registry.want(&conv(1));
        registry.want(&conv(2));
        let attempt = registry.begin_attempt(&conv(1)).unwrap();
        registry.mark_subscribed(&conv(2));

        registry.reset();
        assert!(!registry.complete_attempt(&conv(1), attempt, true));
        assert_eq!(registry.status(&conv(2)), Some(SubscriptionStatus::Idle));
        assert_eq!(registry.desired(), vec![conv(1), conv(2)]);
    }

    #[test]
    fn failed_channels_can_retry() {
        let mut registry = SubscriptionRegistry::new();
        registry.want(&conv(3));
        let attempt = registry.begin_attempt(&conv(3)).unwrap();
        assert!(registry.complete_attempt(&conv(3), attempt, false));
        assert_eq!(registry.status(&conv(3)), Some(SubscriptionStatus::Failed));
        assert!(registry.begin_attempt(&conv(3)).is_some());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Want(u32),
        Release(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u32..4).prop_map(Op::Want), (0u32..4).prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn ref_counts_never_go_negative(ops in proptest::collection::vec(op(), 0..64)) {
            let mut registry = SubscriptionRegistry::new();
            let mut expected = [0usize; 4];

            for op in ops {
                match op {
                    Op::Want(n) => {
                        let first = registry.want(&conv(n));
                        prop_assert_eq!(first, expected[n as usize] == 0);
                        expected[n as usize] += 1;
                    }
                    Op::Release(n) => {
                        registry.release(&conv(n));
                        expected[n as usize] = expected[n as usize].saturating_sub(1);
                    }
                }
                for n in 0..4u32 {
                    prop_assert_eq!(registry.ref_count(&conv(n)), expected[n as usize]);
                    prop_assert_eq!(registry.contains(&conv(n)), expected[n as usize] > 0);
                }
            }
        }
    }
}
