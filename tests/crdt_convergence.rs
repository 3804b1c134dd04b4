//! Cross-replica convergence: reciprocal merges, delta exchange, and
//! byte-identical final states.

use weft::{
    Actor, CountOperation, CrdtChange, CrdtCollection, CrdtCount, CrdtModel, CrdtSingleton,
    CrdtError,
};

fn actor(name: &str) -> Actor {
    Actor::new(name).unwrap()
}

fn multi(name: &str, from: u64, to: u64, value: u64) -> CountOperation {
    CountOperation::MultiIncrement {
        actor: actor(name),
        from,
        to,
        value,
    }
}

#[test]
fn reciprocal_count_merge_converges_to_eleven() {
    let mut left = CrdtCount::new();
    let mut right = CrdtCount::new();
    assert!(left.apply_operation(&multi("me", 0, 1, 7)));
    assert!(right.apply_operation(&multi("them", 0, 1, 4)));

    let left_outcome = left.merge(right.data()).unwrap();
    let CrdtChange::Operations(for_right) = left_outcome.other_change else {
        panic!("count merges emit operation lists");
    };
    let CrdtChange::Operations(applied_here) = left_outcome.model_change else {
        panic!("count merges emit operation lists");
    };
    assert_eq!(for_right.len(), 1);
    assert_eq!(applied_here.len(), 1);

    for op in &for_right {
        assert!(right.apply_operation(op));
    }

    assert_eq!(left.particle_view(), 11);
    assert_eq!(right.particle_view(), 11);

    // Bit-for-bit equality of the serialized models.
    let left_bytes = serde_json::to_vec(left.data()).unwrap();
    let right_bytes = serde_json::to_vec(right.data()).unwrap();
    assert_eq!(left_bytes, right_bytes);
}

#[test]
fn same_actor_divergence_throws() {
    let mut left = CrdtCount::new();
    let mut right = CrdtCount::new();
    assert!(left.apply_operation(&multi("me", 0, 1, 7)));
    assert!(right.apply_operation(&multi("me", 0, 1, 4)));

    assert!(matches!(
        left.merge(right.data()).unwrap_err(),
        CrdtError::Divergence { .. }
    ));
}

#[test]
fn count_increment_inverse_leaves_values_but_versions_advance() {
    // Applying an op and its "inverse" (the lift the other side would
    // emit) nets out in the particle view while versions only grow.
    let mut base = CrdtCount::new();
    assert!(base.apply_operation(&multi("me", 0, 1, 5)));

    let mut replica = CrdtCount::new();
    let outcome = base.merge(replica.data()).unwrap();
    let CrdtChange::Operations(lift) = outcome.other_change else {
        panic!("count merges emit operation lists");
    };
    for op in &lift {
        assert!(replica.apply_operation(op));
    }
    assert_eq!(replica.data(), base.data());
    assert_eq!(replica.data().version_of(&actor("me")), 1);
}

#[test]
fn collection_delta_exchange_reaches_equal_bytes() {
    let mut left: CrdtCollection<String> = CrdtCollection::new();
    let mut right: CrdtCollection<String> = CrdtCollection::new();

    let add_a = left.add_op(&actor("a"), "apple".to_string());
    assert!(left.apply_operation(&add_a));
    let add_b = right.add_op(&actor("b"), "banana".to_string());
    assert!(right.apply_operation(&add_b));
    let remove_b = right.remove_op(&actor("b"), "banana".to_string());
    assert!(right.apply_operation(&remove_b));

    let outcome = left.merge(right.data()).unwrap();
    let CrdtChange::Model(for_right) = outcome.other_change else {
        panic!("set merges emit model deltas");
    };
    right.merge(&for_right).unwrap();

    assert_eq!(
        serde_json::to_vec(left.data()).unwrap(),
        serde_json::to_vec(right.data()).unwrap()
    );
    let view = left.particle_view();
    assert!(view.contains("apple"));
    assert!(!view.contains("banana"));
}

#[test]
fn singleton_concurrent_writers_agree_on_winner() {
    let mut left: CrdtSingleton<String> = CrdtSingleton::new();
    let mut right: CrdtSingleton<String> = CrdtSingleton::new();

    let set_left = left.set_op(&actor("a"), "left-wins?".to_string());
    assert!(left.apply_operation(&set_left));
    let set_right = right.set_op(&actor("b"), "right-wins?".to_string());
    assert!(right.apply_operation(&set_right));

    let outcome = left.merge(right.data()).unwrap();
    let CrdtChange::Model(for_right) = outcome.other_change else {
        panic!("set merges emit model deltas");
    };
    right.merge(&for_right).unwrap();

    assert_eq!(left.data(), right.data());
    assert_eq!(left.particle_view(), right.particle_view());
    assert!(left.particle_view().is_some());
}

#[test]
fn merge_is_idempotent_over_snapshots() {
    let mut model: CrdtCollection<String> = CrdtCollection::new();
    let add = model.add_op(&actor("a"), "x".to_string());
    model.apply_operation(&add);
    let snapshot = model.data().clone();

    model.merge(&snapshot).unwrap();
    model.merge(&snapshot).unwrap();
    assert_eq!(model.data(), &snapshot);
}
