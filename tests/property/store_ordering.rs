// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property-based tests for the message store.
//!
//! Uses proptest to verify:
//! 1. Any mix of live pushes and history pages leaves the store sorted by
//!    `(created_at, key)` with every confirmed id stored exactly once.
//! 2. The merged result does not depend on arrival order.
//! 3. Reconciling optimistic messages never changes the entry count, even
//!    when a push echo of the same message was merged first.

use std::collections::HashSet;

use matchchat::chat::composer::Payload;
use matchchat::chat::store::{Message, MessageKey, MessageStore};
use matchchat_proto::message::{MessageId, PeerId, Timestamp, WireMessage};
use proptest::prelude::*;

fn alice() -> PeerId {
    PeerId::new("alice")
}

fn bob() -> PeerId {
    PeerId::new("bob")
}

/// The `i`th message of the conversation, sent at `at`.
fn wire(i: usize, at: u64) -> WireMessage {
    let (from, to) = if i % 2 == 0 { (alice(), bob()) } else { (bob(), alice()) };
    WireMessage {
        id: MessageId::new(format!("m{i:03}")),
        from,
        to,
        body: format!("message {i}"),
        at: Timestamp::from_millis(at),
        reply_to_id: None,
    }
}

/// One delivery of server messages to the store.
#[derive(Debug, Clone)]
enum Arrival {
    Push(usize),
    Page(Vec<usize>),
}

/// Timestamps for a pool of messages (collisions are likely on purpose),
/// and a sequence of arrivals drawing from that pool with repeats.
fn arb_history() -> impl Strategy<Value = (Vec<u64>, Vec<Arrival>)> {
    prop::collection::vec(0u64..20, 1..40).prop_flat_map(|times| {
        let n = times.len();
        let arrival = prop_oneof![
            (0..n).prop_map(Arrival::Push),
            prop::collection::vec(0..n, 0..10).prop_map(Arrival::Page),
        ];
        (Just(times), prop::collection::vec(arrival, 0..30))
    })
}

fn apply(store: &mut MessageStore, times: &[u64], arrival: &Arrival) {
    let me = alice();
    match arrival {
        Arrival::Push(i) => {
            store.merge_incoming(Message::from_wire(&wire(*i, times[*i]), &me));
        }
        Arrival::Page(items) => {
            let batch = items
                .iter()
                .map(|&i| Message::from_wire(&wire(i, times[i]), &me))
                .collect();
            store.prepend_history(batch);
        }
    }
}

fn assert_sorted(store: &MessageStore) -> Result<(), TestCaseError> {
    for pair in store.messages().windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        prop_assert!(
            (a.created_at, &a.key) <= (b.created_at, &b.key),
            "{} sorts after {}",
            a.key,
            b.key
        );
    }
    Ok(())
}

fn arrived_ids(arrivals: &[Arrival]) -> HashSet<usize> {
    arrivals
        .iter()
        .flat_map(|a| match a {
            Arrival::Push(i) => vec![*i],
            Arrival::Page(items) => items.clone(),
        })
        .collect()
}

proptest! {
    #[test]
    fn merges_stay_sorted_and_unique((times, arrivals) in arb_history()) {
        let mut store = MessageStore::new();
        for arrival in &arrivals {
            apply(&mut store, &times, arrival);
        }

        assert_sorted(&store)?;
        let keys: Vec<_> = store.messages().iter().map(|m| m.key.clone()).collect();
        let unique: HashSet<_> = keys.iter().collect();
        prop_assert_eq!(unique.len(), keys.len());
        prop_assert_eq!(keys.len(), arrived_ids(&arrivals).len());
    }

    #[test]
    fn arrival_order_does_not_matter(
        (times, arrivals, shuffled) in arb_history().prop_flat_map(|(times, arrivals)| {
            let shuffled = Just(arrivals.clone()).prop_shuffle();
            (Just(times), Just(arrivals), shuffled)
        })
    ) {
        let mut in_order = MessageStore::new();
        for arrival in &arrivals {
            apply(&mut in_order, &times, arrival);
        }
        let mut out_of_order = MessageStore::new();
        for arrival in &shuffled {
            apply(&mut out_of_order, &times, arrival);
        }

        let keys = |store: &MessageStore| -> Vec<MessageKey> {
            store.messages().iter().map(|m| m.key.clone()).collect()
        };
        prop_assert_eq!(keys(&in_order), keys(&out_of_order));
    }

    #[test]
    fn reconcile_keeps_one_entry_per_message(
        sends in prop::collection::vec((0u64..20, 0u64..20, any::<bool>()), 1..20),
    ) {
        let mut store = MessageStore::new();
        let pending: Vec<_> = sends
            .iter()
            .map(|&(local_at, _, _)| {
                store.insert_optimistic(
                    bob(),
                    Payload::text("draft"),
                    None,
                    Timestamp::from_millis(local_at),
                )
            })
            .collect();
        prop_assert_eq!(store.len(), sends.len());

        for (n, (temp, &(_, server_at, echo_first))) in pending.iter().zip(&sends).enumerate() {
            // Even-numbered messages are ours in `wire`.
            let confirmed = WireMessage {
                body: "draft".into(),
                ..wire(n * 2, server_at)
            };
            if echo_first {
                store.merge_incoming(Message::from_wire(&confirmed, &alice()));
            }
            store.reconcile(*temp, &confirmed).unwrap();
            prop_assert_eq!(store.len(), sends.len());
        }

        assert_sorted(&store)?;
        prop_assert!(
            store
                .messages()
                .iter()
                .all(|m| matches!(m.key, MessageKey::Confirmed(_)))
        );
    }
}
