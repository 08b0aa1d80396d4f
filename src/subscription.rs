//! Signal subscription index: in-process match-rule bookkeeping plus
//! reference-counted daemon-side `AddMatch`/`RemoveMatch` rules (§4.7).
//!
//! This module only tracks *what* should be subscribed to; the actual
//! `AddMatch`/`RemoveMatch` method calls are issued by [`crate::connection`],
//! which is the thing that actually owns the transport.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;

use crate::message::Message;
use crate::names::{BusOrUniqueName, InterfaceName, MemberName, UniqueName};

pub type SubscriberId = u64;

/// One subscriber's interest: every `None` component is a wildcard. The
/// member is never a wildcard — a subscriber always names the signal it
/// wants (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub sender: Option<BusOrUniqueName>,
    pub path: Option<String>,
    pub interface: Option<InterfaceName>,
    pub member: MemberName,
}

impl SubscriptionSpec {
    /// Render the daemon-side `AddMatch`/`RemoveMatch` rule string for this
    /// spec. Two specs that render to the same rule string share one
    /// daemon-side registration (reference-counted).
    pub fn match_rule(&self) -> String {
        let mut parts = vec!["type='signal'".to_string()];
        if let Some(sender) = &self.sender {
            parts.push(format!("sender='{}'", sender));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path='{}'", path));
        }
        if let Some(interface) = &self.interface {
            parts.push(format!("interface='{}'", interface));
        }
        parts.push(format!("member='{}'", self.member));
        parts.join(",")
    }

    fn matches(&self, msg: &Message, name_owners: &HashMap<String, UniqueName>) -> bool {
        if msg.fields.member.as_ref() != Some(&self.member) {
            return false;
        }
        if let Some(path) = &self.path {
            if msg.fields.path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if msg.fields.interface.as_ref() != Some(interface) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            let expected_unique = resolve_owner(sender, name_owners);
            let actual = match &msg.fields.sender {
                Some(s) => s.to_string(),
                None => return false,
            };
            if expected_unique.as_deref() != Some(actual.as_str()) {
                return false;
            }
        }
        true
    }
}

fn resolve_owner(
    name: &BusOrUniqueName,
    name_owners: &HashMap<String, UniqueName>,
) -> Option<String> {
    match name {
        BusOrUniqueName::Unique(u) => Some(u.to_string()),
        BusOrUniqueName::WellKnown(w) => name_owners.get(w.as_ref()).map(|u| u.to_string()),
    }
}

struct Subscriber {
    id: SubscriberId,
    spec: SubscriptionSpec,
    sink: Box<dyn FnMut(&Message)>,
}

/// A live subscription handle. Dropping it queues the subscriber for
/// removal, which [`SubscriptionIndex::drain_removals`] picks up on the
/// connection's next pass through its dispatch loop (per design note:
/// "re-architect as an explicit `subscribe(spec) -> Subscription` handle
/// whose drop/close removes the rule").
pub struct Subscription {
    id: SubscriberId,
    pending_removals: Rc<RefCell<Vec<SubscriberId>>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pending_removals.borrow_mut().push(self.id);
    }
}

/// A rule whose daemon-side registration just changed and needs a matching
/// `AddMatch`/`RemoveMatch` call.
pub enum RuleChange {
    NowNeeded(String),
    NoLongerNeeded(String),
}

#[derive(Default)]
pub struct SubscriptionIndex {
    next_id: SubscriberId,
    subscribers: Vec<Subscriber>,
    rule_refcounts: HashMap<String, u32>,
    name_owners: HashMap<String, UniqueName>,
    pending_removals: Rc<RefCell<Vec<SubscriberId>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        SubscriptionIndex::default()
    }

    /// Register a subscriber and report whether its match rule needs to be
    /// added at the daemon (first subscriber for that exact rule string).
    pub fn subscribe(
        &mut self,
        spec: SubscriptionSpec,
        sink: Box<dyn FnMut(&Message)>,
    ) -> (Subscription, Option<RuleChange>) {
        self.next_id += 1;
        let id = self.next_id;
        let rule = spec.match_rule();
        self.subscribers.push(Subscriber { id, spec, sink });

        let count = self.rule_refcounts.entry(rule.clone()).or_insert(0);
        *count += 1;
        let change = if *count == 1 {
            Some(RuleChange::NowNeeded(rule))
        } else {
            None
        };
        (
            Subscription {
                id,
                pending_removals: self.pending_removals.clone(),
            },
            change,
        )
    }

    fn remove(&mut self, id: SubscriberId) -> Option<RuleChange> {
        let pos = self.subscribers.iter().position(|s| s.id == id)?;
        let subscriber = self.subscribers.remove(pos);
        let rule = subscriber.spec.match_rule();
        let count = self.rule_refcounts.get_mut(&rule)?;
        *count -= 1;
        if *count == 0 {
            self.rule_refcounts.remove(&rule);
            Some(RuleChange::NoLongerNeeded(rule))
        } else {
            None
        }
    }

    /// Drain subscriptions dropped since the last call, actually removing
    /// them from the index and reporting which daemon rules are now unused.
    pub fn drain_removals(&mut self) -> Vec<RuleChange> {
        let ids: Vec<SubscriberId> = self.pending_removals.borrow_mut().drain(..).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Record (or clear) the current unique-name owner of a well-known name,
    /// driven by the connection's `NameOwnerChanged` subscription on the bus
    /// driver itself (§4.7).
    pub fn update_name_owner(&mut self, well_known: &str, owner: Option<&str>) {
        match owner.filter(|o| !o.is_empty()).and_then(|o| UniqueName::from_str(o).ok()) {
            Some(unique) => {
                self.name_owners.insert(well_known.to_string(), unique);
            }
            None => {
                self.name_owners.remove(well_known);
            }
        }
    }

    /// Invoke every subscriber whose spec matches this inbound signal, in
    /// registration order. A sink never removes itself from the index as a
    /// side effect of being called in this loop.
    pub fn dispatch_signal(&mut self, msg: &Message) {
        for subscriber in &mut self.subscribers {
            if subscriber.spec.matches(msg, &self.name_owners) {
                (subscriber.sink)(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HeaderFields, HeaderFlags, MessageType, Serial};
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    fn signal(sender: &str, path: &str, interface: &str, member: &str) -> Message {
        Message {
            message_type: MessageType::Signal,
            flags: HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                path: Some(path.to_string()),
                interface: Some(InterfaceName::from_str(interface).unwrap()),
                member: Some(MemberName::from_str(member).unwrap()),
                sender: Some(UniqueName::from_str(sender).unwrap()),
                ..Default::default()
            },
            body: vec![],
        }
    }

    #[test]
    fn wildcard_subscriber_matches_any_sender() {
        let mut index = SubscriptionIndex::new();
        let hits = StdRc::new(Cell::new(0));
        let hits_clone = hits.clone();
        let spec = SubscriptionSpec {
            sender: None,
            path: Some("/dev".into()),
            interface: Some(InterfaceName::from_str("iface").unwrap()),
            member: MemberName::from_str("Changed").unwrap(),
        };
        let (_sub, _change) = index.subscribe(
            spec,
            Box::new(move |_| hits_clone.set(hits_clone.get() + 1)),
        );
        index.dispatch_signal(&signal(":1.5", "/dev", "iface", "Changed"));
        index.dispatch_signal(&signal(":1.6", "/dev", "iface", "Changed"));
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn exact_sender_subscriber_only_matches_that_sender() {
        let mut index = SubscriptionIndex::new();
        let hits = StdRc::new(Cell::new(0));
        let hits_clone = hits.clone();
        let spec = SubscriptionSpec {
            sender: Some(BusOrUniqueName::from_str(":1.5").unwrap()),
            path: None,
            interface: None,
            member: MemberName::from_str("Changed").unwrap(),
        };
        let (_sub, _change) = index.subscribe(
            spec,
            Box::new(move |_| hits_clone.set(hits_clone.get() + 1)),
        );
        index.dispatch_signal(&signal(":1.5", "/dev", "iface", "Changed"));
        index.dispatch_signal(&signal(":1.6", "/dev", "iface", "Changed"));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn both_subscribers_fire_for_matching_signal_s6() {
        let mut index = SubscriptionIndex::new();
        let a_hits = StdRc::new(Cell::new(0));
        let b_hits = StdRc::new(Cell::new(0));
        let (a_clone, b_clone) = (a_hits.clone(), b_hits.clone());
        index.subscribe(
            SubscriptionSpec {
                sender: None,
                path: Some("/dev".into()),
                interface: Some(InterfaceName::from_str("iface").unwrap()),
                member: MemberName::from_str("Changed").unwrap(),
            },
            Box::new(move |_| a_clone.set(a_clone.get() + 1)),
        );
        index.subscribe(
            SubscriptionSpec {
                sender: Some(BusOrUniqueName::from_str(":1.5").unwrap()),
                path: None,
                interface: None,
                member: MemberName::from_str("Changed").unwrap(),
            },
            Box::new(move |_| b_clone.set(b_clone.get() + 1)),
        );
        index.dispatch_signal(&signal(":1.5", "/dev", "iface", "Changed"));
        assert_eq!(a_hits.get(), 1);
        assert_eq!(b_hits.get(), 1);

        index.dispatch_signal(&signal(":1.6", "/dev", "iface", "Changed"));
        assert_eq!(a_hits.get(), 2);
        assert_eq!(b_hits.get(), 1);
    }

    #[test]
    fn refcounted_rule_removed_only_after_last_subscriber_drops() {
        let mut index = SubscriptionIndex::new();
        let spec = SubscriptionSpec {
            sender: None,
            path: Some("/dev".into()),
            interface: None,
            member: MemberName::from_str("Changed").unwrap(),
        };
        let (sub_a, change_a) = index.subscribe(spec.clone(), Box::new(|_| {}));
        assert!(matches!(change_a, Some(RuleChange::NowNeeded(_))));
        let (sub_b, change_b) = index.subscribe(spec, Box::new(|_| {}));
        assert!(change_b.is_none());

        drop(sub_a);
        let changes = index.drain_removals();
        assert!(changes.is_empty(), "one remaining subscriber keeps the rule");

        drop(sub_b);
        let changes = index.drain_removals();
        assert!(matches!(changes.as_slice(), [RuleChange::NoLongerNeeded(_)]));
    }

    #[test]
    fn name_owner_resolves_well_known_sender() {
        let mut index = SubscriptionIndex::new();
        index.update_name_owner("com.example.Foo", Some(":1.9"));
        let hits = StdRc::new(Cell::new(0));
        let hits_clone = hits.clone();
        index.subscribe(
            SubscriptionSpec {
                sender: Some(BusOrUniqueName::from_str("com.example.Foo").unwrap()),
                path: None,
                interface: None,
                member: MemberName::from_str("Changed").unwrap(),
            },
            Box::new(move |_| hits_clone.set(hits_clone.get() + 1)),
        );
        index.dispatch_signal(&signal(":1.9", "/dev", "iface", "Changed"));
        assert_eq!(hits.get(), 1);
    }
}
