//! Property-based invariants for the scheduler, run against the in-memory
//! store and a fake runtime so no Docker daemon is required.

use broker_catalog::Catalog;
use broker_common::Challenge;
use broker_runtime::fake::FakeRuntime;
use broker_runtime::ContainerRuntime;
use broker_scheduler::Scheduler;
use broker_store::{InMemoryStateStore, StateStore};
use proptest::prelude::*;
use std::sync::Arc;

fn challenge(user_limit: u32) -> Challenge {
    Challenge {
        name: "echo".into(),
        internal_port: 9000,
        mem_limit_mb: 64,
        user_limit,
        lifetime_seconds: 600,
        can_prestart: false,
    }
}

async fn build_scheduler(user_limit: u32) -> Arc<Scheduler> {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::default());
    let catalog = Arc::new(Catalog::new("unused", runtime.clone()));
    catalog
        .register(challenge(user_limit), std::path::Path::new("."))
        .await
        .unwrap();
    Arc::new(Scheduler::new(store, runtime, catalog))
}

proptest! {
    /// P1: used_ports and all_instances stay in lockstep, no matter how many
    /// distinct users attach.
    #[test]
    fn p1_ports_and_instances_stay_in_lockstep(user_count in 1usize..40) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (ports, instances) = rt.block_on(async {
            let sched = build_scheduler(4).await;
            for i in 0..user_count {
                sched.get_instance_for(&format!("user-{i}"), "echo").await.unwrap();
            }

            let ports = sched.repository().used_port_count().await.unwrap();
            let instances = sched.repository().all_instance_count().await.unwrap();
            (ports, instances)
        });
        prop_assert_eq!(ports, instances);
    }

    /// P2: a user is never attached to more than one instance's roster.
    #[test]
    fn p2_user_appears_in_at_most_one_instance(user_count in 1usize..30) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let max_duplicate_count = rt.block_on(async {
            let sched = build_scheduler(3).await;
            for i in 0..user_count {
                let user = format!("user-{i}");
                sched.get_instance_for(&user, "echo").await.unwrap();
            }

            let ids = sched.repository().all_instance_ids().await.unwrap();
            let mut worst = 0usize;
            for id in ids {
                let inst = sched.repository().get(&id).await.unwrap().unwrap();
                let mut seen = std::collections::HashSet::new();
                for u in &inst.users {
                    if !seen.insert(u.clone()) {
                        worst += 1;
                    }
                }
            }
            worst
        });
        prop_assert_eq!(max_duplicate_count, 0);
    }

    /// P3: no instance ever exceeds its own user_limit.
    #[test]
    fn p3_instances_never_exceed_user_limit(user_count in 1usize..40, limit in 1u32..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let violations = rt.block_on(async {
            let sched = build_scheduler(limit).await;
            for i in 0..user_count {
                sched.get_instance_for(&format!("user-{i}"), "echo").await.unwrap();
            }

            let mut violations = 0usize;
            for id in sched.repository().all_instance_ids().await.unwrap() {
                let inst = sched.repository().get(&id).await.unwrap().unwrap();
                if inst.users.len() > inst.user_limit as usize {
                    violations += 1;
                }
            }
            violations
        });
        prop_assert_eq!(violations, 0);
    }

    /// P4: disconnecting a user clears their assignment and membership
    /// everywhere.
    #[test]
    fn p4_disconnect_clears_user_fully(user_count in 2usize..20) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let still_present = rt.block_on(async {
            let sched = build_scheduler(4).await;
            for i in 0..user_count {
                sched.get_instance_for(&format!("user-{i}"), "echo").await.unwrap();
            }

            sched.disconnect("user-0").await.unwrap();

            let mut still_present = false;
            for id in sched.repository().all_instance_ids().await.unwrap() {
                let inst = sched.repository().get(&id).await.unwrap().unwrap();
                if inst.users.iter().any(|u| u == "user-0") {
                    still_present = true;
                }
            }
            still_present
        });
        prop_assert!(!still_present);
    }

    /// P5: after a reset, the vacated instance is in the user's avoid set and
    /// the replacement instance is a different one.
    #[test]
    fn p5_reset_avoids_the_vacated_instance(extra_instances in 0usize..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (avoided, changed) = rt.block_on(async {
            let sched = build_scheduler(4).await;
            let first = sched.get_instance_for("u1", "echo").await.unwrap();
            for i in 0..extra_instances {
                sched.start_instance("echo", Some(50000 + i as u16)).await.unwrap();
            }

            let after = sched.request_reset("u1", &first.container_id).await.unwrap();
            let avoid = sched.avoid_list_for("u1").await.unwrap();
            (avoid.contains(&first.container_id), after.container_id != first.container_id)
        });
        prop_assert!(avoided);
        prop_assert!(changed);
    }

    /// P6: cleanup never leaves more than one empty instance per challenge.
    #[test]
    fn p6_cleanup_leaves_at_most_one_empty(empty_count in 0usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let remaining_empties = rt.block_on(async {
            let sched = build_scheduler(4).await;
            for i in 0..empty_count {
                sched.start_instance("echo", Some(51000 + i as u16)).await.unwrap();
            }

            sched.reap_idle_instances().await.unwrap();

            let mut empties = 0usize;
            for id in sched.repository().all_instance_ids().await.unwrap() {
                let inst = sched.repository().get(&id).await.unwrap().unwrap();
                if inst.users.is_empty() {
                    empties += 1;
                }
            }
            empties
        });
        prop_assert!(remaining_empties <= 1);
    }

    /// P7: a can_prestart challenge left with zero free-seat instances after
    /// cleanup is queued for pre-warm.
    #[test]
    fn p7_cleanup_queues_prewarm_when_no_free_seats(user_count in 3usize..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let queued = rt.block_on(async {
            let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::default());
            let catalog = Arc::new(Catalog::new("unused", runtime.clone()));
            let mut chal = challenge(4);
            chal.can_prestart = true;
            catalog.register(chal, std::path::Path::new(".")).await.unwrap();
            let sched = Arc::new(Scheduler::new(store, runtime, catalog));

            for i in 0..user_count {
                sched.get_instance_for(&format!("user-{i}"), "echo").await.unwrap();
            }

            sched.reap_idle_instances().await.unwrap();
            sched.prewarm_queue_snapshot().await.unwrap()
        });
        prop_assert!(queued.contains(&"echo".to_string()));
    }
}
