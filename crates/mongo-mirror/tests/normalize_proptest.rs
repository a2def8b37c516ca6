//! Property tests for identifier normalization.

#![allow(clippy::pedantic)]

use mongo_mirror::identifier::normalize_filter;
use mongodb::bson::{Bson, Document};
use proptest::prelude::*;

fn leaf() -> impl Strategy<Value = Bson> {
    prop_oneof![
        any::<i32>().prop_map(Bson::Int32),
        any::<bool>().prop_map(Bson::Boolean),
        "[a-z]{0,12}".prop_map(Bson::String),
        any::<u128>().prop_map(|n| Bson::String(uuid::Uuid::from_u128(n).to_string())),
    ]
}

fn node() -> impl Strategy<Value = Bson> {
    leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Bson::Array),
            prop::collection::btree_map("[A-Za-z$]{1,8}", inner, 0..4)
                .prop_map(|fields| Bson::Document(fields.into_iter().collect())),
        ]
    })
}

fn filter() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[A-Za-z]{1,8}", node(), 0..5)
        .prop_map(|fields| fields.into_iter().collect())
}

fn has_hyphenated_string(value: &Bson) -> bool {
    match value {
        Bson::String(text) => text.contains('-'),
        Bson::Array(items) => items.iter().any(has_hyphenated_string),
        Bson::Document(doc) => doc.values().any(has_hyphenated_string),
        _ => false,
    }
}

proptest! {
    #[test]
    fn normalize_is_idempotent(original in filter()) {
        let mut once = original.clone();
        normalize_filter(&mut once).unwrap();

        let mut twice = once.clone();
        normalize_filter(&mut twice).unwrap();

        prop_assert_eq!(once, twice);
    }

    #[test]
    fn normalize_leaves_no_uuid_text(original in filter()) {
        let mut normalized = original;
        normalize_filter(&mut normalized).unwrap();

        prop_assert!(!normalized.values().any(has_hyphenated_string));
    }
}
