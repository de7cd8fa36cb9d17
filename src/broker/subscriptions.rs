//! Subscription registry
//!
//! Maps each topic filter to the consumers subscribed to it. The registry
//! never touches the network: every mutation returns the broker-level
//! [`BrokerCommand`]s the connection manager has to send, so one broker
//! subscription exists per filter no matter how many consumers share it.

use crate::protocol::{is_valid_subscription_filter, matches};
use crate::transport::{InboundPacket, SubscribeOptions, SubscribeRequest};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Callback invoked for every inbound packet routed to a consumer
pub type MessageCallback = Arc<dyn Fn(&InboundPacket) + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("Invalid topic specified: {0}")]
    InvalidFilter(String),
}

/// Broker-level work produced by a registry mutation
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCommand {
    Subscribe(SubscribeRequest),
    Unsubscribe(String),
}

/// One consumer's request to receive messages for a filter
#[derive(Clone)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub options: SubscribeOptions,
    pub owner: String,
    pub callback: MessageCallback,
}

impl fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("filter", &self.filter)
            .field("options", &self.options)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl SubscriptionRequest {
    pub fn new(
        filter: impl Into<String>,
        options: SubscribeOptions,
        owner: impl Into<String>,
        callback: MessageCallback,
    ) -> Self {
        Self {
            filter: filter.into(),
            options,
            owner: owner.into(),
            callback,
        }
    }
}

struct Record {
    options: SubscribeOptions,
    callback: MessageCallback,
    /// Receives dispatched packets
    attached: bool,
    /// Unsubscribed without removal; waiting in the owner's pending list
    staged: bool,
}

struct FilterEntry {
    subscription_id: u32,
    /// Options of the SUBSCRIBE last sent for this filter on this connection
    broker_options: Option<SubscribeOptions>,
    owners: IndexMap<String, Record>,
}

/// Filter to owner records, in insertion order
pub struct SubscriptionRegistry {
    entries: IndexMap<String, FilterEntry>,
    pending: IndexMap<String, Vec<String>>,
    next_id: u32,
    auto_unsubscribe: bool,
    connected: bool,
    subscription_identifiers: bool,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SubscriptionRegistry {
    pub fn new(auto_unsubscribe: bool) -> Self {
        Self {
            entries: IndexMap::new(),
            pending: IndexMap::new(),
            next_id: 1,
            auto_unsubscribe,
            connected: false,
            subscription_identifiers: false,
        }
    }

    /// Add or update `(filter, owner)`.
    ///
    /// Pending filters the owner left behind are removed from the broker
    /// unless they are the filter being subscribed again. Changed options
    /// tear the old record down first.
    pub fn subscribe(
        &mut self,
        request: SubscriptionRequest,
    ) -> Result<Vec<BrokerCommand>, SubscriptionError> {
        let SubscriptionRequest {
            filter,
            options,
            owner,
            callback,
        } = request;
        if !is_valid_subscription_filter(&filter) {
            return Err(SubscriptionError::InvalidFilter(filter));
        }

        let mut commands = Vec::new();

        if let Some(candidates) = self.pending.shift_remove(&owner) {
            for candidate in candidates.into_iter().filter(|c| *c != filter) {
                commands.extend(self.remove_record(&candidate, &owner, true));
            }
        }

        let previous = self
            .entries
            .get(&filter)
            .and_then(|entry| entry.owners.get(&owner))
            .map(|record| record.options);
        if previous.is_some_and(|old| old != options) {
            debug!(filter = %filter, owner = %owner, "Subscription options changed");
            commands.extend(self.remove_record(&filter, &owner, true));
        }

        let next_id = &mut self.next_id;
        let entry = self.entries.entry(filter.clone()).or_insert_with(|| {
            let subscription_id = *next_id;
            *next_id += 1;
            FilterEntry {
                subscription_id,
                broker_options: None,
                owners: IndexMap::new(),
            }
        });

        let record = entry.owners.entry(owner).or_insert_with(|| Record {
            options,
            callback: Arc::clone(&callback),
            attached: false,
            staged: false,
        });
        record.options = options;
        record.callback = callback;
        record.staged = false;

        if self.connected {
            record.attached = true;
            if entry.broker_options != Some(options) {
                entry.broker_options = Some(options);
                commands.push(BrokerCommand::Subscribe(SubscribeRequest {
                    filter: filter.clone(),
                    options,
                    subscription_identifier: self
                        .subscription_identifiers
                        .then_some(entry.subscription_id),
                }));
            }
        }

        Ok(commands)
    }

    /// Remove `(filter, owner)`. Without `force` and with auto-unsubscribe
    /// off, the record is detached and staged instead.
    pub fn unsubscribe(&mut self, filter: &str, owner: &str, force: bool) -> Vec<BrokerCommand> {
        self.remove_record(filter, owner, force)
    }

    fn remove_record(&mut self, filter: &str, owner: &str, force: bool) -> Vec<BrokerCommand> {
        let remove = force || self.auto_unsubscribe;
        let Some(entry) = self.entries.get_mut(filter) else {
            return Vec::new();
        };
        let Some(record) = entry.owners.get_mut(owner) else {
            return Vec::new();
        };
        record.attached = false;

        if !remove {
            record.staged = true;
            let staged = self.pending.entry(owner.to_string()).or_default();
            if !staged.iter().any(|f| f == filter) {
                staged.push(filter.to_string());
            }
            return Vec::new();
        }

        entry.owners.shift_remove(owner);
        if let Some(staged) = self.pending.get_mut(owner) {
            staged.retain(|f| f != filter);
        }
        if !entry.owners.is_empty() {
            return Vec::new();
        }

        self.entries.shift_remove(filter);
        debug!(filter = %filter, "Last owner left, unsubscribing");
        vec![BrokerCommand::Unsubscribe(filter.to_string())]
    }

    /// Force-remove every active record held by `owner`. Staged records stay.
    pub fn remove_owner(&mut self, owner: &str) -> Vec<BrokerCommand> {
        let filters: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owners.get(owner).is_some_and(|r| !r.staged))
            .map(|(filter, _)| filter.clone())
            .collect();
        filters
            .iter()
            .flat_map(|filter| self.remove_record(filter, owner, true))
            .collect()
    }

    /// Detach every dispatch handler. Called when a connection attempt starts
    /// and when the connection drops.
    pub fn detach_all(&mut self) {
        self.connected = false;
        for entry in self.entries.values_mut() {
            entry.broker_options = None;
            for record in entry.owners.values_mut() {
                record.attached = false;
            }
        }
    }

    /// Re-issue every stored subscription for a fresh connection
    pub fn replay(&mut self, subscription_identifiers: bool) -> Vec<BrokerCommand> {
        self.connected = true;
        self.subscription_identifiers = subscription_identifiers;

        let mut commands = Vec::new();
        for (filter, entry) in self.entries.iter_mut() {
            entry.broker_options = None;
            for record in entry.owners.values_mut() {
                record.attached = !record.staged;
                if entry.broker_options != Some(record.options) {
                    entry.broker_options = Some(record.options);
                    commands.push(BrokerCommand::Subscribe(SubscribeRequest {
                        filter: filter.clone(),
                        options: record.options,
                        subscription_identifier: subscription_identifiers
                            .then_some(entry.subscription_id),
                    }));
                }
            }
        }
        commands
    }

    /// Callbacks that should receive `packet`, in filter then owner order
    pub fn dispatch(&self, packet: &InboundPacket) -> Vec<MessageCallback> {
        let check_ids = self.subscription_identifiers && !packet.subscription_identifiers.is_empty();
        let mut callbacks = Vec::new();
        for (filter, entry) in &self.entries {
            if check_ids && !packet.subscription_identifiers.contains(&entry.subscription_id) {
                continue;
            }
            if !matches(filter, &packet.topic) {
                continue;
            }
            callbacks.extend(
                entry
                    .owners
                    .values()
                    .filter(|record| record.attached)
                    .map(|record| Arc::clone(&record.callback)),
            );
        }
        callbacks
    }

    pub fn subscription_identifier(&self, filter: &str) -> Option<u32> {
        self.entries.get(filter).map(|e| e.subscription_id)
    }

    pub fn filters(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn owners(&self, filter: &str) -> Vec<String> {
        self.entries
            .get(filter)
            .map(|e| e.owners.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Active (non-staged) subscriptions held by `owner`
    pub fn subscriptions_for(&self, owner: &str) -> Vec<(String, SubscribeOptions)> {
        self.entries
            .iter()
            .filter_map(|(filter, entry)| {
                entry
                    .owners
                    .get(owner)
                    .filter(|record| !record.staged)
                    .map(|record| (filter.clone(), record.options))
            })
            .collect()
    }

    pub fn pending_for(&self, owner: &str) -> &[String] {
        self.pending.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (MessageCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: MessageCallback = Arc::new(move |packet: &InboundPacket| {
            sink.lock().unwrap().push(packet.topic.clone());
        });
        (callback, seen)
    }

    fn noop() -> MessageCallback {
        Arc::new(|_: &InboundPacket| {})
    }

    fn request(filter: &str, owner: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(filter, SubscribeOptions::default(), owner, noop())
    }

    fn connected(ids: bool) -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::new(true);
        assert!(registry.replay(ids).is_empty());
        registry
    }

    fn subscribes(commands: &[BrokerCommand]) -> usize {
        commands
            .iter()
            .filter(|c| matches!(c, BrokerCommand::Subscribe(_)))
            .count()
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let mut registry = connected(true);
        let err = registry.subscribe(request("a/#/b", "n1")).unwrap_err();
        assert_eq!(err, SubscriptionError::InvalidFilter("a/#/b".into()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_identical_resubscribe_sends_once() {
        let mut registry = connected(true);
        let first = registry.subscribe(request("a/+", "n1")).unwrap();
        let second = registry.subscribe(request("a/+", "n1")).unwrap();

        assert_eq!(
            first,
            vec![BrokerCommand::Subscribe(SubscribeRequest {
                filter: "a/+".into(),
                options: SubscribeOptions::default(),
                subscription_identifier: Some(1),
            })]
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_changed_options_resubscribe_pair() {
        let mut registry = connected(true);
        registry.subscribe(request("a/b", "n1")).unwrap();

        let options = SubscribeOptions {
            qos: 2,
            ..Default::default()
        };
        let commands = registry
            .subscribe(SubscriptionRequest::new("a/b", options, "n1", noop()))
            .unwrap();

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], BrokerCommand::Unsubscribe("a/b".into()));
        match &commands[1] {
            BrokerCommand::Subscribe(req) => {
                assert_eq!(req.options.qos, 2);
                assert_eq!(req.subscription_identifier, Some(2));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_shared_filter_ref_counting() {
        let mut registry = connected(true);
        assert_eq!(subscribes(&registry.subscribe(request("t/#", "n1")).unwrap()), 1);
        assert!(registry.subscribe(request("t/#", "n2")).unwrap().is_empty());
        assert_eq!(registry.subscription_identifier("t/#"), Some(1));
        assert_eq!(registry.owners("t/#"), vec!["n1".to_string(), "n2".to_string()]);

        assert!(registry.unsubscribe("t/#", "n1", false).is_empty());
        assert_eq!(registry.filters(), vec!["t/#".to_string()]);

        assert_eq!(
            registry.unsubscribe("t/#", "n2", false),
            vec![BrokerCommand::Unsubscribe("t/#".into())]
        );
        assert!(registry.is_empty());
        assert!(registry.unsubscribe("t/#", "n2", true).is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut registry = connected(true);
        registry.subscribe(request("a", "n1")).unwrap();
        registry.unsubscribe("a", "n1", true);
        registry.subscribe(request("b", "n1")).unwrap();
        registry.subscribe(request("a", "n1")).unwrap();

        assert_eq!(registry.subscription_identifier("b"), Some(2));
        assert_eq!(registry.subscription_identifier("a"), Some(3));
    }

    #[test]
    fn test_ids_omitted_when_unsupported() {
        let mut registry = connected(false);
        let commands = registry.subscribe(request("a", "n1")).unwrap();
        match &commands[0] {
            BrokerCommand::Subscribe(req) => assert_eq!(req.subscription_identifier, None),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(registry.subscription_identifier("a"), Some(1));
    }

    #[test]
    fn test_staged_unsubscribe_without_auto_unsubscribe() {
        let mut registry = SubscriptionRegistry::new(false);
        registry.replay(true);
        registry.subscribe(request("old", "n1")).unwrap();

        assert!(registry.unsubscribe("old", "n1", false).is_empty());
        assert_eq!(registry.pending_for("n1"), ["old".to_string()]);
        assert!(registry.subscriptions_for("n1").is_empty());

        // resubscribing the same filter reuses the broker subscription
        assert!(registry.subscribe(request("old", "n1")).unwrap().is_empty());
        assert!(registry.pending_for("n1").is_empty());

        registry.unsubscribe("old", "n1", false);
        let commands = registry.subscribe(request("new", "n1")).unwrap();
        assert_eq!(commands[0], BrokerCommand::Unsubscribe("old".into()));
        assert_eq!(subscribes(&commands), 1);
        assert_eq!(registry.filters(), vec!["new".to_string()]);
    }

    #[test]
    fn test_remove_owner_only_touches_exclusive_filters() {
        let mut registry = connected(true);
        registry.subscribe(request("shared", "n1")).unwrap();
        registry.subscribe(request("shared", "n2")).unwrap();
        registry.subscribe(request("mine", "n1")).unwrap();

        let commands = registry.remove_owner("n1");
        assert_eq!(commands, vec![BrokerCommand::Unsubscribe("mine".into())]);
        assert_eq!(registry.owners("shared"), vec!["n2".to_string()]);
    }

    #[test]
    fn test_disconnected_subscribe_waits_for_replay() {
        let mut registry = SubscriptionRegistry::new(true);
        assert!(registry.subscribe(request("b", "n1")).unwrap().is_empty());
        assert!(registry.subscribe(request("a", "n2")).unwrap().is_empty());
        assert!(registry.subscribe(request("b", "n2")).unwrap().is_empty());

        let replayed: Vec<String> = registry
            .replay(true)
            .into_iter()
            .map(|c| match c {
                BrokerCommand::Subscribe(req) => req.filter,
                BrokerCommand::Unsubscribe(f) => panic!("unexpected unsubscribe {}", f),
            })
            .collect();
        assert_eq!(replayed, vec!["b".to_string(), "a".to_string()]);

        registry.detach_all();
        assert_eq!(registry.replay(true).len(), 2);
    }

    #[test]
    fn test_dispatch_order_and_detach() {
        let mut registry = connected(true);
        let (first, seen_first) = recorder();
        let (second, seen_second) = recorder();
        registry
            .subscribe(SubscriptionRequest::new("s/+", SubscribeOptions::default(), "n1", first))
            .unwrap();
        registry
            .subscribe(SubscriptionRequest::new("s/#", SubscribeOptions::default(), "n2", second))
            .unwrap();

        let packet = InboundPacket::new("s/x", "hi");
        for callback in registry.dispatch(&packet) {
            callback(&packet);
        }
        assert_eq!(*seen_first.lock().unwrap(), vec!["s/x".to_string()]);
        assert_eq!(*seen_second.lock().unwrap(), vec!["s/x".to_string()]);

        registry.detach_all();
        assert!(registry.dispatch(&packet).is_empty());
    }

    #[test]
    fn test_dispatch_honours_subscription_identifiers() {
        let mut registry = connected(true);
        registry.subscribe(request("s/+", "n1")).unwrap();
        registry.subscribe(request("s/#", "n2")).unwrap();

        let mut packet = InboundPacket::new("s/x", "hi");
        packet.subscription_identifiers = vec![2];
        assert_eq!(registry.dispatch(&packet).len(), 1);

        packet.subscription_identifiers.clear();
        assert_eq!(registry.dispatch(&packet).len(), 2);

        let mut no_ids = connected(false);
        no_ids.subscribe(request("s/+", "n1")).unwrap();
        packet.subscription_identifiers = vec![99];
        assert_eq!(no_ids.dispatch(&packet).len(), 1);
    }
}
