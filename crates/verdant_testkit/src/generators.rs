//! Property-based test generators using proptest.
//!
//! Provides strategies for push events and write sequences that keep the
//! invariants the sync layer relies on (unique event ids, non-zero deltas).

use proptest::prelude::*;
use verdant_protocol::{MutationKind, PostId, PushEvent, Timestamp, UserId};

/// Strategy for remote user ids (never the local user).
pub fn remote_user_strategy() -> impl Strategy<Value = UserId> {
    prop::string::string_regex("u[a-z0-9]{1,8}")
        .expect("Invalid regex")
        .prop_map(UserId::new)
}

/// Strategy for like deltas (+1 or -1).
pub fn like_delta_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![Just(1i64), Just(-1i64)]
}

/// Strategy for like events on one post with unique ids and timestamps.
pub fn like_events_strategy(
    post_id: PostId,
    max_len: usize,
) -> impl Strategy<Value = Vec<PushEvent>> {
    prop::collection::vec((remote_user_strategy(), like_delta_strategy()), 0..max_len).prop_map(
        move |items| {
            items
                .into_iter()
                .enumerate()
                .map(|(i, (user, delta))| {
                    let n = u64::try_from(i).unwrap_or(u64::MAX);
                    PushEvent::like_changed(
                        format!("ev-{i}"),
                        user,
                        post_id.clone(),
                        delta,
                        Timestamp::from_millis(1_000 + n),
                    )
                })
                .collect()
        },
    )
}

/// Strategy for like events together with a delivery order (a permutation
/// of their indices, possibly with repeats to model redelivery).
pub fn shuffled_deliveries_strategy(
    post_id: PostId,
    max_len: usize,
) -> impl Strategy<Value = (Vec<PushEvent>, Vec<usize>)> {
    like_events_strategy(post_id, max_len).prop_flat_map(|events| {
        let len = events.len();
        let order = Just((0..len).collect::<Vec<_>>()).prop_shuffle();
        let repeats = prop::collection::vec(0..len.max(1), 0..4);
        (Just(events), order, repeats).prop_map(move |(events, mut order, repeats)| {
            if len > 0 {
                order.extend(repeats);
            }
            (events, order)
        })
    })
}

/// Strategy for user write kinds that need an existing post.
pub fn write_kind_strategy() -> impl Strategy<Value = MutationKind> {
    prop_oneof![
        Just(MutationKind::Like),
        Just(MutationKind::Unlike),
        Just(MutationKind::Comment),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    proptest! {
        #[test]
        fn like_events_have_unique_ids(events in like_events_strategy(PostId::new("p1"), 20)) {
            let ids: HashSet<_> = events.iter().map(|e| e.id.clone()).collect();
            prop_assert_eq!(ids.len(), events.len());
            for event in &events {
                prop_assert_ne!(event.origin_user_id.as_str(), "me");
            }
        }

        #[test]
        fn deliveries_cover_every_event((events, order) in shuffled_deliveries_strategy(PostId::new("p1"), 10)) {
            let delivered: HashSet<_> = order.iter().copied().collect();
            prop_assert_eq!(delivered.len(), events.len());
        }
    }
}
