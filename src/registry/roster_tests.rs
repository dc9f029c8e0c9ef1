//! Tests for runner registration, eligibility and slot accounting.

use std::time::{Duration, Instant};

use super::*;
use crate::protocol::RequestId;

fn registry() -> RunnerRegistry {
    RunnerRegistry::new(RegistryConfig::default())
}

fn demand(model: Option<&str>, memory: u64) -> Demand<'_> {
    Demand { model, memory }
}

#[test]
fn update_is_idempotent_and_keeps_registration_order() {
    let mut reg = registry();
    let now = Instant::now();
    assert!(reg.update(RunnerReport::new("r1", 100), now));
    assert!(reg.update(RunnerReport::new("r2", 100), now));
    assert!(!reg.update(RunnerReport::new("r1", 50), now));

    assert_eq!(reg.len(), 2);
    assert_eq!(reg.get("r1").unwrap().total_memory(), 50);
    let order: Vec<&str> = reg.runners().iter().map(|r| r.id()).collect();
    assert_eq!(order, vec!["r1", "r2"]);
}

#[test]
fn eligibility_requires_free_capacity() {
    let mut reg = registry();
    let now = Instant::now();
    reg.update(RunnerReport::new("small", 10), now);
    reg.update(RunnerReport::new("large", 100), now);

    let eligible = reg.list_eligible(demand(None, 50), now);
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].runner_id, "large");
}

#[test]
fn resident_only_excludes_cold_runners() {
    let mut reg = RunnerRegistry::new(RegistryConfig {
        eligibility: ModelEligibility::ResidentOnly,
        ..Default::default()
    });
    let now = Instant::now();
    reg.update(RunnerReport::new("warm", 100).with_model("llama3", 10), now);
    reg.update(RunnerReport::new("cold", 100), now);

    let eligible = reg.list_eligible(demand(Some("llama3"), 10), now);
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].runner_id, "warm");
    assert!(eligible[0].warm);
}

#[test]
fn loadable_runners_are_eligible_by_default() {
    let mut reg = registry();
    let now = Instant::now();
    reg.update(RunnerReport::new("any", 100), now);
    reg.update(RunnerReport::new("phi-only", 100).with_loadable(&["phi3"]), now);

    let eligible = reg.list_eligible(demand(Some("llama3"), 10), now);
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].runner_id, "any");
    assert!(!eligible[0].warm);
}

#[test]
fn reserve_rechecks_capacity() {
    let mut reg = registry();
    let now = Instant::now();
    reg.update(RunnerReport::new("r1", 10), now);

    reg.reserve("r1", RequestId::new(), demand(None, 6), now).unwrap();
    let err = reg.reserve("r1", RequestId::new(), demand(None, 6), now).unwrap_err();
    assert!(matches!(err, ReserveError::InsufficientCapacity { free: 4, needed: 6, .. }));
    assert!(matches!(
        reg.reserve("ghost", RequestId::new(), demand(None, 1), now),
        Err(ReserveError::UnknownRunner(_))
    ));
}

#[test]
fn release_frees_capacity() {
    let mut reg = registry();
    let now = Instant::now();
    reg.update(RunnerReport::new("r1", 10), now);
    let slot = reg.reserve("r1", RequestId::new(), demand(None, 10), now).unwrap();
    assert!(reg.list_eligible(demand(None, 1), now).is_empty());

    assert!(reg.release("r1", slot, now).is_some());
    assert!(reg.release("r1", slot, now).is_none());
    assert_eq!(reg.list_eligible(demand(None, 10), now).len(), 1);
}

#[test]
fn evict_expired_returns_runner_with_slots() {
    let mut reg = registry();
    let t0 = Instant::now();
    reg.update(RunnerReport::new("stale", 10), t0);
    let id = RequestId::new();
    reg.reserve("stale", id, demand(None, 1), t0).unwrap();

    let t1 = t0 + Duration::from_secs(20);
    reg.update(RunnerReport::new("fresh", 10), t1);
    assert!(reg.evict_expired(t1).is_empty());

    let t2 = t0 + Duration::from_secs(31);
    let evicted = reg.evict_expired(t2);
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].id(), "stale");
    assert_eq!(evicted[0].slots().next().unwrap().request_id, id);
    assert!(!reg.contains("stale"));
    assert!(reg.contains("fresh"));
}

#[test]
fn expire_slots_releases_old_leases() {
    let mut reg = registry();
    let t0 = Instant::now();
    reg.update(RunnerReport::new("r1", 10), t0);
    reg.reserve("r1", RequestId::new(), demand(None, 5), t0).unwrap();

    let ttl = Duration::from_secs(300);
    assert!(reg.expire_slots(t0 + Duration::from_secs(299), ttl).is_empty());
    let expired = reg.expire_slots(t0 + Duration::from_secs(301), ttl);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].0, "r1");
    assert_eq!(reg.get("r1").unwrap().active_slots(), 0);
}

#[test]
fn reregistration_after_eviction_gets_new_order() {
    let mut reg = registry();
    let t0 = Instant::now();
    reg.update(RunnerReport::new("a", 10), t0);
    reg.update(RunnerReport::new("b", 10), t0 + Duration::from_secs(25));
    reg.evict_expired(t0 + Duration::from_secs(31));
    reg.update(RunnerReport::new("a", 10), t0 + Duration::from_secs(32));

    let order: Vec<&str> = reg.runners().iter().map(|r| r.id()).collect();
    assert_eq!(order, vec!["b", "a"]);
}

#[test]
fn compatible_runners_excludes_runners_too_small_to_ever_fit() {
    let mut reg = registry();
    let now = Instant::now();
    reg.update(RunnerReport::new("small", 10), now);
    reg.update(RunnerReport::new("large", 200), now);
    reg.reserve("large", RequestId::new(), demand(None, 150), now).unwrap();

    let mut ids = reg.compatible_runners(demand(None, 100), now);
    ids.sort();
    assert_eq!(ids, vec!["large".to_string()]);
    assert!(reg.compatible_runners(demand(None, 500), now).is_empty());
}
