//! Property tests for the order-independent parts of the pipeline.

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

use ob_resource_pipeline::service_resources::discovery::expand_dimensions;
use ob_resource_pipeline::service_resources::ledger::content_hash;
use ob_resource_pipeline::service_resources::rollup::merge_constraints;
use ob_resource_pipeline::service_resources::{
    AttributeConstraints, ConstraintContribution, EventDirection, EventPayload, IntentOptions,
    ParameterDimension, RequirementStrength, ResourceParameters,
};

// -- Strategy helpers --

fn arb_constraints() -> impl Strategy<Value = AttributeConstraints> {
    (
        prop::option::of(0usize..12),
        prop::option::of(0usize..12),
        prop::option::of(prop::collection::btree_set("[A-D]", 1..4)),
    )
        .prop_map(|(min_length, max_length, allowed)| AttributeConstraints {
            min_length,
            max_length,
            allowed_values: allowed.map(|set| set.into_iter().map(|v| json!(v)).collect()),
            ..Default::default()
        })
}

fn arb_contributions() -> impl Strategy<Value = Vec<ConstraintContribution>> {
    prop::collection::vec(arb_constraints(), 1..5).prop_map(|all| {
        all.into_iter()
            .enumerate()
            .map(|(i, constraints)| ConstraintContribution {
                srdef_id: format!("SRDEF::TEST::Account::r{}", i),
                constraints,
            })
            .collect()
    })
}

fn arb_strength() -> impl Strategy<Value = RequirementStrength> {
    prop_oneof![
        Just(RequirementStrength::Required),
        Just(RequirementStrength::Optional),
    ]
}

fn allowed_set(c: &AttributeConstraints) -> Option<BTreeSet<String>> {
    c.allowed_values
        .as_ref()
        .map(|values| values.iter().map(|v| v.to_string()).collect())
}

proptest! {
    #[test]
    fn constraint_merge_ignores_contributor_order(contributions in arb_contributions()) {
        let base = AttributeConstraints::default();
        let forward = merge_constraints("account_name", &base, &contributions);
        let mut reversed_input = contributions.clone();
        reversed_input.reverse();
        let reversed = merge_constraints("account_name", &base, &reversed_input);

        prop_assert_eq!(forward.is_ok(), reversed.is_ok());
        if let (Ok(a), Ok(b)) = (&forward, &reversed) {
            prop_assert_eq!(a.min_length, b.min_length);
            prop_assert_eq!(a.max_length, b.max_length);
            prop_assert_eq!(allowed_set(a), allowed_set(b));
            prop_assert_eq!(&a.patterns, &b.patterns);
        }
    }

    #[test]
    fn merged_length_bounds_are_the_tightest(contributions in arb_contributions()) {
        let merged = merge_constraints("account_name", &AttributeConstraints::default(), &contributions);
        let min = contributions.iter().filter_map(|c| c.constraints.min_length).max();
        let max = contributions.iter().filter_map(|c| c.constraints.max_length).min();
        match (min, max) {
            (Some(lo), Some(hi)) if lo > hi => prop_assert!(merged.is_err()),
            _ => {
                if let Ok(m) = merged {
                    prop_assert_eq!(m.min_length, min);
                    prop_assert_eq!(m.max_length, max);
                }
            }
        }
    }

    #[test]
    fn required_dominates_in_any_order(strengths in prop::collection::vec(arb_strength(), 1..8)) {
        let merged = strengths
            .iter()
            .copied()
            .fold(RequirementStrength::Optional, RequirementStrength::merge);
        let any_required = strengths.contains(&RequirementStrength::Required);
        prop_assert_eq!(merged == RequirementStrength::Required, any_required);
    }

    #[test]
    fn expansion_is_the_cartesian_product(
        markets in prop::collection::btree_set("X[A-Z]{3}", 1..5),
        currencies in prop::collection::btree_set("[A-Z]{3}", 1..4),
    ) {
        let options = IntentOptions {
            markets: markets.iter().cloned().collect(),
            currencies: currencies.iter().cloned().collect(),
            ..Default::default()
        };
        let sets = expand_dimensions(
            &[ParameterDimension::Market, ParameterDimension::Currency],
            &ResourceParameters::new(),
            &options,
        );
        prop_assert_eq!(sets.len(), markets.len() * currencies.len());
        let distinct: BTreeSet<_> = sets.iter().cloned().collect();
        prop_assert_eq!(distinct.len(), sets.len());
    }

    #[test]
    fn content_hash_depends_only_on_content(ticket in "[A-Z0-9]{1,10}", other in "[a-z]{1,10}") {
        let request_id = Uuid::from_u128(42);
        let payload = EventPayload::Ack { owner_ticket_id: Some(ticket.clone()) };
        let a = content_hash(request_id, EventDirection::In, &payload).unwrap();
        let b = content_hash(request_id, EventDirection::In, &payload.clone()).unwrap();
        prop_assert_eq!(&a, &b);

        let different = EventPayload::Ack { owner_ticket_id: Some(other) };
        let c = content_hash(request_id, EventDirection::In, &different).unwrap();
        prop_assert_ne!(a, c);
    }
}
