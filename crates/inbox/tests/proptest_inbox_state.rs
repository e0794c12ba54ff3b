use std::sync::Arc;

use floating_inbox::address::{Address, AddressResolver, is_canonical_address};
use floating_inbox::chat::conversations::{merge_conversation, partition, sort_by_recent_desc};
use floating_inbox::chat::messages::merge_message;
use floating_inbox::chat::time_text::relative_time_label;
use floating_inbox::chat::{AllowedScope, ConsentState, Conversation, Message};
use floating_inbox::memory::StaticNameResolver;
use proptest::prelude::*;

fn address_strategy() -> impl Strategy<Value = Address> {
    "0x[0-9a-fA-F]{40}".prop_map(|raw| Address::parse(&raw).unwrap())
}

fn consent_strategy() -> impl Strategy<Value = ConsentState> {
    prop_oneof![
        Just(ConsentState::Unknown),
        Just(ConsentState::Allowed),
        Just(ConsentState::Blocked),
    ]
}

fn conversation_strategy() -> impl Strategy<Value = Conversation> {
    (address_strategy(), 0u64..10_000, consent_strategy())
        .prop_map(|(peer, created, consent)| Conversation::new(peer, created).with_consent(consent))
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (0u32..8, address_strategy(), 0u64..10_000, "[a-z ]{1,12}").prop_map(
        |(id, sender, sent, text)| Message::text(format!("msg-{id}"), sender, sent, text),
    )
}

proptest! {
    #[test]
    fn canonical_addresses_resolve_to_themselves(raw in "0x[0-9a-fA-F]{40}") {
        prop_assert!(is_canonical_address(&raw));

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let resolver = AddressResolver::new(Arc::new(StaticNameResolver::failing()));
        let resolved = runtime.block_on(resolver.resolve(&raw)).unwrap();
        prop_assert_eq!(resolved.as_str(), raw.to_ascii_lowercase());
    }

    #[test]
    fn wrong_length_hex_is_never_canonical(digits in "[0-9a-f]{0,39}") {
        let raw = format!("0x{digits}");
        prop_assert!(!is_canonical_address(&raw));
    }

    #[test]
    fn merging_a_message_twice_is_idempotent(
        seed in proptest::collection::vec(message_strategy(), 0..6),
        incoming in message_strategy(),
    ) {
        let mut current = Vec::new();
        for message in seed {
            current = merge_message(&current, message);
        }

        let once = merge_message(&current, incoming.clone());
        let twice = merge_message(&once, incoming);
        prop_assert_eq!(&once, &twice);

        let mut ids: Vec<_> = once.iter().map(|message| message.id.clone()).collect();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), once.len());
    }

    #[test]
    fn merged_conversations_stay_sorted_and_unique(
        seed in proptest::collection::vec(conversation_strategy(), 0..8),
        incoming in conversation_strategy(),
    ) {
        let mut current = Vec::new();
        for conversation in seed {
            current = merge_conversation(&current, conversation);
        }
        let merged = merge_conversation(&current, incoming.clone());

        prop_assert!(merged.windows(2).all(|pair| pair[0].created_at_unix_ms >= pair[1].created_at_unix_ms));
        prop_assert_eq!(
            merged.iter().filter(|conversation| conversation.peer_address == incoming.peer_address).count(),
            1
        );
        prop_assert_eq!(merge_conversation(&merged, incoming), merged);
    }

    #[test]
    fn sorting_is_a_total_order(list in proptest::collection::vec(conversation_strategy(), 0..10)) {
        let mut once = Vec::new();
        for conversation in list {
            if once.iter().all(|existing: &Conversation| existing.peer_address != conversation.peer_address) {
                once.push(conversation);
            }
        }
        sort_by_recent_desc(&mut once);
        sort_by_recent_desc(&mut once);
        let mut again = once.clone();
        again.reverse();
        sort_by_recent_desc(&mut again);
        prop_assert_eq!(once, again);
    }

    #[test]
    fn buckets_never_hold_blocked_or_own_requests(
        list in proptest::collection::vec(conversation_strategy(), 0..10),
        own in address_strategy(),
        filtered in any::<bool>(),
    ) {
        let scope = if filtered { AllowedScope::Filtered } else { AllowedScope::FullList };
        let buckets = partition(&list, "", &own, scope);

        prop_assert!(buckets.allowed.iter().all(|conversation| conversation.consent_state == ConsentState::Allowed));
        let requests_ok = buckets.requests.iter().all(|conversation| {
            conversation.consent_state == ConsentState::Unknown && conversation.peer_address != own
        });
        prop_assert!(requests_ok);
        let blocked = list.iter().filter(|conversation| conversation.consent_state == ConsentState::Blocked).count();
        prop_assert!(buckets.allowed.len() + buckets.requests.len() + blocked <= list.len());
    }

    #[test]
    fn relative_labels_pluralize_only_above_one(now in 0u64..10_000_000_000, back in 0u64..10_000_000_000) {
        let label = relative_time_label(now, now.saturating_sub(back));
        let amount: u64 = label.split(' ').next().unwrap().parse().unwrap();
        prop_assert!(label.ends_with(" ago"));
        prop_assert_eq!(label.contains("s ago"), amount > 1);
    }
}
