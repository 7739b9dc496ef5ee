// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Topic filter to subscriber mapping with wildcard resolution and retained-message storage.
//! Specification component 4.3.

use std::collections::HashMap;
use std::sync::Mutex;

use codec::{v5, topic_matches_filter, QoS, SubTopic};

/// One concrete topic's subscriber set and optional retained message.
#[derive(Default)]
struct TopicEntry {
    clients: HashMap<String, QoS>,
    retained: Option<v5::PublishPacket>,
}

fn has_wildcard(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// `GrantedQoS0` shares MQTT 5's `0x00` value with `Success`, so there is no distinct variant.
fn granted_qos_reason(qos: QoS) -> v5::ReasonCode {
    match qos {
        QoS::AtMostOnce => v5::ReasonCode::Success,
        QoS::AtLeastOnce => v5::ReasonCode::GrantedQoS1,
        QoS::ExactOnce => v5::ReasonCode::GrantedQoS2,
    }
}

/// Concrete-topic-keyed routing table, guarded by a single mutex (reads during fan-out, writes
/// during subscribe/unsubscribe, exactly as specified for the broker's shared resources).
#[derive(Default)]
pub struct SubscriptionTable {
    topics: Mutex<HashMap<String, TopicEntry>>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `client_id` to `filter` at `qos`, returning the reason code to place in SUBACK.
    ///
    /// A filter with a wildcard in an invalid position (e.g. `"foo#"`, `"foo+"`) is rejected
    /// with `UnspecifiedError` and records nothing. A filter containing `+`/`#` that matches no
    /// currently known concrete topic records nothing and returns `NoSubscriptionExisted`; a
    /// concrete (non-wildcard) filter always creates its topic entry if absent.
    pub fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> v5::ReasonCode {
        if SubTopic::new(filter).is_err() {
            return v5::ReasonCode::UnspecifiedError;
        }
        if !matches!(qos, QoS::AtMostOnce | QoS::AtLeastOnce | QoS::ExactOnce) {
            return v5::ReasonCode::QoSNotSupported;
        }

        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());

        if has_wildcard(filter) {
            let matching: Vec<String> = topics
                .keys()
                .filter(|topic| topic_matches_filter(topic, filter))
                .cloned()
                .collect();
            if matching.is_empty() {
                return v5::ReasonCode::NoSubscriptionExisted;
            }
            for topic in matching {
                topics
                    .entry(topic)
                    .or_default()
                    .clients
                    .insert(client_id.to_owned(), qos);
            }
        } else {
            topics
                .entry(filter.to_owned())
                .or_default()
                .clients
                .insert(client_id.to_owned(), qos);
        }

        granted_qos_reason(qos)
    }

    /// Remove `client_id` from every topic's subscriber map. Topic entries (and any retained
    /// message they hold) are left in place.
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        for entry in topics.values_mut() {
            entry.clients.remove(client_id);
        }
    }

    /// Point lookup: subscribers currently registered on a concrete topic name.
    #[must_use]
    pub fn clients_by_topic(&self, topic: &str) -> Vec<(String, QoS)> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(topic)
            .map(|entry| {
                entry
                    .clients
                    .iter()
                    .map(|(id, qos)| (id.clone(), *qos))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store `publish` as the retained message for `topic`, creating the topic entry if it
    /// does not yet exist (retained messages persist independent of subscriber presence).
    pub fn set_retained(&self, topic: &str, publish: v5::PublishPacket) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.entry(topic.to_owned()).or_default().retained = Some(publish);
    }

    /// Delete the retained message for `topic`, if any.
    pub fn delete_retained(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = topics.get_mut(topic) {
            entry.retained = None;
        }
    }

    /// All `(topic, retained publish)` pairs whose topic currently matches `filter`.
    ///
    /// Used after a successful SUBACK to deliver retained messages on newly-subscribed filters.
    #[must_use]
    pub fn retained_matching(&self, filter: &str) -> Vec<(String, v5::PublishPacket)> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .iter()
            .filter(|(topic, entry)| entry.retained.is_some() && topic_matches_filter(topic, filter))
            .map(|(topic, entry)| (topic.clone(), entry.retained.clone().expect("checked Some above")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriptionTable;
    use codec::{v5, QoS};

    #[test]
    fn test_subscribe_concrete_topic() {
        let table = SubscriptionTable::new();
        let reason = table.subscribe("client-a", "gqtt/example", QoS::AtMostOnce);
        assert_eq!(reason, v5::ReasonCode::Success);
        let clients = table.clients_by_topic("gqtt/example");
        assert_eq!(clients, vec![("client-a".to_owned(), QoS::AtMostOnce)]);
    }

    #[test]
    fn test_subscribe_rejects_malformed_wildcard_placement() {
        let table = SubscriptionTable::new();
        for filter in ["foo#", "foo+", "a/#/c"] {
            let reason = table.subscribe("client-a", filter, QoS::AtMostOnce);
            assert_eq!(reason, v5::ReasonCode::UnspecifiedError, "filter {filter}");
        }
        assert!(table.clients_by_topic("foo#").is_empty());
    }

    #[test]
    fn test_subscribe_accepts_bare_wildcard_filters() {
        let table = SubscriptionTable::new();
        table.subscribe("client-b", "gqtt/example", QoS::AtMostOnce);
        assert_eq!(
            table.subscribe("client-a", "#", QoS::AtMostOnce),
            v5::ReasonCode::Success
        );
        assert_eq!(
            table.subscribe("client-a", "+", QoS::AtMostOnce),
            v5::ReasonCode::NoSubscriptionExisted
        );
    }

    #[test]
    fn test_wildcard_subscribe_without_existing_topic() {
        let table = SubscriptionTable::new();
        let reason = table.subscribe("client-a", "gqtt/+", QoS::AtMostOnce);
        assert_eq!(reason, v5::ReasonCode::NoSubscriptionExisted);
        assert!(table.clients_by_topic("gqtt/example").is_empty());
    }

    #[test]
    fn test_wildcard_subscribe_matches_existing_topic() {
        let table = SubscriptionTable::new();
        table.subscribe("client-b", "gqtt/example", QoS::AtMostOnce);
        let reason = table.subscribe("client-a", "gqtt/+", QoS::AtLeastOnce);
        assert_eq!(reason, v5::ReasonCode::GrantedQoS1);
        let clients = table.clients_by_topic("gqtt/example");
        assert!(clients.contains(&("client-a".to_owned(), QoS::AtLeastOnce)));
    }

    #[test]
    fn test_unsubscribe_all_leaves_retained() {
        let table = SubscriptionTable::new();
        table.subscribe("client-a", "t", QoS::AtMostOnce);
        let publish = v5::PublishPacket::new("t", QoS::AtMostOnce, b"r1").unwrap();
        table.set_retained("t", publish);
        table.unsubscribe_all("client-a");
        assert!(table.clients_by_topic("t").is_empty());
        assert_eq!(table.retained_matching("t").len(), 1);
    }

    #[test]
    fn test_delete_retained() {
        let table = SubscriptionTable::new();
        let publish = v5::PublishPacket::new("t", QoS::AtMostOnce, b"r1").unwrap();
        table.set_retained("t", publish);
        table.delete_retained("t");
        assert!(table.retained_matching("t").is_empty());
    }
}
