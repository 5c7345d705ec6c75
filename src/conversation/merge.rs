use std::collections::HashSet;

use super::{Message, PartitionKey, Snapshot, Timeline};

/// Merge the latest snapshot of every partition into one timeline.
///
/// Pending messages (no timestamp yet) are left out. Entries sharing an id are
/// collapsed to the earliest copy in sort order. Equal timestamps are ordered
/// by message id, then by partition key, so the result does not depend on the
/// order partitions are visited in.
pub fn merge<'a, I>(partitions: I) -> Timeline
where
    I: IntoIterator<Item = (&'a PartitionKey, &'a Snapshot)>,
{
    let mut entries: Vec<(&PartitionKey, &Message)> = partitions
        .into_iter()
        .flat_map(|(key, snapshot)| snapshot.iter().map(move |message| (key, message)))
        .filter(|(_, message)| message.timestamp.is_some())
        .collect();

    entries.sort_by(|(key_a, a), (key_b, b)| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| key_a.cmp(key_b))
    });

    let mut seen = HashSet::with_capacity(entries.len());
    let messages = entries
        .into_iter()
        .filter(|(_, message)| seen.insert(&message.id))
        .map(|(_, message)| message.clone())
        .collect();

    Timeline::from_sorted(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationId, MessageBody, UserId};
    use chrono::{DateTime, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn key(conversation: &str, author: &str) -> PartitionKey {
        PartitionKey::new(ConversationId::new(conversation), UserId::new(author))
    }

    fn msg(id: &str, sender: &str, secs: Option<i64>, text: &str) -> Message {
        Message::new(id, UserId::new(sender), MessageBody::text(text), secs.map(at))
    }

    #[test]
    fn interleaves_two_direct_partitions_by_time() {
        let mut partitions = BTreeMap::new();
        partitions.insert(key("B", "A"), Arc::new(vec![msg("1", "A", Some(10), "hi")]));
        partitions.insert(key("A", "B"), Arc::new(vec![msg("2", "B", Some(5), "yo")]));

        let timeline = merge(&partitions);

        assert_eq!(timeline.ids(), vec!["2", "1"]);
    }

    #[test]
    fn pending_messages_are_left_out() {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            key("B", "A"),
            Arc::new(vec![msg("1", "A", Some(1), "sent"), msg("2", "A", None, "pending")]),
        );

        let timeline = merge(&partitions);

        assert_eq!(timeline.ids(), vec!["1"]);
    }

    #[test]
    fn repeated_ids_collapse_to_one_entry() {
        let mut partitions = BTreeMap::new();
        let copy = msg("7", "A", Some(3), "same");
        partitions.insert(key("B", "A"), Arc::new(vec![copy.clone(), copy.clone()]));
        partitions.insert(key("A", "B"), Arc::new(vec![copy]));

        let timeline = merge(&partitions);

        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let mut partitions = BTreeMap::new();
        partitions.insert(key("G", "X"), Arc::new(vec![msg("b", "X", Some(4), "x")]));
        partitions.insert(key("G", "Y"), Arc::new(vec![msg("a", "Y", Some(4), "y")]));

        assert_eq!(merge(&partitions).ids(), vec!["a", "b"]);
    }

    #[test]
    fn empty_input_gives_empty_timeline() {
        let partitions: HashMap<PartitionKey, Snapshot> = HashMap::new();
        assert!(merge(&partitions).is_empty());
    }

    #[test]
    fn random_deliveries_stay_sorted_and_ignore_visit_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let authors = ["X", "Y", "Z", "W"];

        for _ in 0..200 {
            let mut snapshots: Vec<(PartitionKey, Snapshot)> = authors
                .iter()
                .map(|author| {
                    let count = rng.gen_range(0..12);
                    let messages = (0..count)
                        .map(|_| {
                            // small id space forces cross-partition collisions
                            let id = rng.gen_range(0..20).to_string();
                            let ts = if rng.gen_bool(0.1) {
                                None
                            } else {
                                Some(rng.gen_range(0..8))
                            };
                            msg(&id, author, ts, "body")
                        })
                        .collect();
                    (key("G", author), Arc::new(messages))
                })
                .collect();

            let first = merge(snapshots.iter().map(|(k, s)| (k, s)));
            snapshots.shuffle(&mut rng);
            let second = merge(snapshots.iter().map(|(k, s)| (k, s)));
            assert_eq!(first, second);

            let mut ids = HashSet::new();
            for message in first.iter() {
                assert!(ids.insert(message.id.clone()), "duplicate id {}", message.id);
                assert!(message.timestamp.is_some());
            }
            for pair in first.messages().windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
    }
}
