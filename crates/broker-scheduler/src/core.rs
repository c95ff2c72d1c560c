//! Scheduler core: port allocation, instance lifecycle, and user
//! assignment/avoid-list bookkeeping. Every mutating method is called with
//! the scheduler lock held by the caller (see [`Scheduler::lock`]).

use crate::repository::InstanceRepository;
use broker_catalog::Catalog;
use broker_common::{BrokerError, Instance, Result};
use broker_runtime::ContainerRuntime;
use broker_store::StateStore;
use rand::Rng;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const PORT_RANGE_LOW: u16 = 1025;
const PORT_RANGE_HIGH: u32 = 65535;
const PORT_COLLISION_BUDGET: u32 = 32;
const PREWARM_MARGIN: usize = 2;
const STOP_GRACE_SECONDS: i64 = 5;

fn assignment_key(user: &str) -> String {
    format!("assignment:{user}")
}

fn avoid_key(user: &str) -> String {
    format!("avoid:{user}")
}

const PREWARM_QUEUE: &str = "prewarm_queue";
const USERS: &str = "users";

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// All scheduler state mutations acquire this lock for the duration of one
/// logical operation, including the Runtime Adapter calls it makes.
pub struct Scheduler {
    lock: Mutex<()>,
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<Catalog>,
    repo: InstanceRepository,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<Catalog>,
    ) -> Self {
        let repo = InstanceRepository::new(store.clone());
        Self {
            lock: Mutex::new(()),
            store,
            runtime,
            catalog,
            repo,
        }
    }

    pub fn repository(&self) -> &InstanceRepository {
        &self.repo
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn allocate_port(&self) -> Result<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..PORT_COLLISION_BUDGET {
            let candidate = rng.gen_range(PORT_RANGE_LOW as u32..PORT_RANGE_HIGH) as u16;
            if !self.repo.is_port_used(candidate).await? {
                return Ok(candidate);
            }
        }
        Err(BrokerError::NoPortAvailable)
    }

    /// Starts a fresh instance of `challenge`. `port` overrides allocation,
    /// used by tests to pin a deterministic value.
    #[instrument(skip(self))]
    pub async fn start_instance(&self, challenge: &str, port: Option<u16>) -> Result<Instance> {
        let _guard = self.lock.lock().await;
        self.start_instance_locked(challenge, port).await
    }

    async fn start_instance_locked(&self, challenge: &str, port: Option<u16>) -> Result<Instance> {
        let chal = self.catalog.require(challenge).await?;
        let external_port = match port {
            Some(p) => p,
            None => self.allocate_port().await?,
        };

        let mem_limit_bytes = (chal.mem_limit_mb as i64) * 1_048_576;
        let run_result = self
            .runtime
            .run(&chal.name, chal.internal_port, external_port, mem_limit_bytes)
            .await;

        let container_id = match run_result {
            Ok(id) => id,
            Err(e) => return Err(e.into()),
        };

        let instance = Instance {
            container_id: container_id.clone(),
            challenge: chal.name.clone(),
            external_port,
            started_at: now(),
            users: Vec::new(),
            user_limit: chal.user_limit,
        };

        if let Err(e) = self.repo.save(&instance).await {
            warn!(container_id = %container_id, error = %e, "save failed after runtime start, compensating stop");
            if let Err(stop_err) = self.runtime.stop(&container_id, STOP_GRACE_SECONDS).await {
                warn!(container_id = %container_id, error = %stop_err, "compensating stop also failed");
            }
            return Err(e);
        }

        self.store.incr("instance_count", 1).await?;
        self.store.srem(PREWARM_QUEUE, challenge).await?;

        info!(container_id = %instance.container_id, %challenge, %external_port, "started instance");
        Ok(instance)
    }

    async fn maybe_queue_prewarm(&self, challenge: &str, users_len: usize, user_limit: u32) -> Result<()> {
        let chal = self.catalog.require(challenge).await?;
        if chal.can_prestart && users_len + PREWARM_MARGIN > user_limit as usize {
            self.store.sadd(PREWARM_QUEUE, challenge).await?;
        }
        Ok(())
    }

    async fn attach(&self, instance: &mut Instance, user: &str) -> Result<()> {
        instance.users.push(user.to_string());
        self.repo.save(instance).await?;
        self.store.set(&assignment_key(user), &instance.container_id).await?;
        self.store.sadd(USERS, user).await?;
        self.maybe_queue_prewarm(&instance.challenge, instance.users.len(), instance.user_limit)
            .await?;
        Ok(())
    }

    /// Finds or creates an instance of `challenge` with a free seat, attaches
    /// `user`, and returns it. Callers (the HTTP layer) are responsible for
    /// rejecting requests where `challenge` is unknown or `user` already has
    /// a live assignment before calling this.
    #[instrument(skip(self))]
    pub async fn get_instance_for(&self, user: &str, challenge: &str) -> Result<Instance> {
        let _guard = self.lock.lock().await;

        let avoid = self.store.smembers(&avoid_key(user)).await?;
        let candidates = self.repo.by_challenge(challenge).await?;

        for mut inst in candidates {
            if inst.is_full() {
                continue;
            }
            if avoid.contains(&inst.container_id) {
                continue;
            }
            self.attach(&mut inst, user).await?;
            return Ok(inst);
        }

        let mut inst = self.start_instance_locked(challenge, None).await?;
        self.attach(&mut inst, user).await?;
        Ok(inst)
    }

    /// Removes `user`'s assignment, if any. Idempotent.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, user: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let assigned = self.store.get(&assignment_key(user)).await?;
        let Some(container_id) = assigned else {
            return Ok(());
        };

        if let Some(mut inst) = self.repo.get(&container_id).await? {
            inst.users.retain(|u| u != user);
            self.repo.save(&inst).await?;
        }

        self.store.del(&assignment_key(user)).await?;
        self.store.srem(USERS, user).await?;
        self.store.del(&avoid_key(user)).await?;
        Ok(())
    }

    /// Detaches `user` from `current_instance_id` (which must match their
    /// live assignment), marks it avoided, and re-runs `get_instance_for` to
    /// hand back a different instance.
    #[instrument(skip(self))]
    pub async fn request_reset(&self, user: &str, current_instance_id: &str) -> Result<Instance> {
        {
            let _guard = self.lock.lock().await;

            let assigned = self.store.get(&assignment_key(user)).await?;
            if assigned.as_deref() != Some(current_instance_id) {
                return Err(BrokerError::Forbidden(format!(
                    "user {user} is not assigned to {current_instance_id}"
                )));
            }

            if let Some(mut inst) = self.repo.get(current_instance_id).await? {
                inst.users.retain(|u| u != user);
                self.repo.save(&inst).await?;
            }

            self.store.sadd(&avoid_key(user), current_instance_id).await?;
            self.store.del(&assignment_key(user)).await?;
        }

        // get_instance_for re-acquires the lock; the assignment was already
        // cleared above so it does not observe a stale value.
        let challenge = self
            .repo
            .get(current_instance_id)
            .await?
            .map(|i| i.challenge)
            .ok_or_else(|| BrokerError::NotFound(current_instance_id.to_string()))?;

        self.get_instance_for(user, &challenge).await
    }

    /// Stops and forgets an instance. Only called on instances with no
    /// remaining users (the cleanup loop's invariant); the HTTP layer never
    /// calls this directly. Acquires the scheduler lock, like every other
    /// public scheduler operation.
    #[instrument(skip(self))]
    pub async fn stop_instance(&self, instance: &Instance) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.stop_instance_locked(instance).await
    }

    async fn stop_instance_locked(&self, instance: &Instance) -> Result<()> {
        if let Err(e) = self
            .runtime
            .stop(&instance.container_id, STOP_GRACE_SECONDS)
            .await
        {
            warn!(container_id = %instance.container_id, error = %e, "stop failed, forgetting anyway");
        }
        self.repo.forget(instance).await
    }

    /// Stops every idle instance except the youngest empty one per challenge,
    /// and queues a pre-warm for any `can_prestart` challenge left with no
    /// free-seat instance. Called from the cleanup loop; exposed as a public
    /// method so it is independently testable without spinning up a ticker.
    /// Holds the scheduler lock for the whole pass, the same as any other
    /// scheduler operation, so a concurrent `get_instance_for` never attaches
    /// a user to an instance this pass is about to forget.
    #[instrument(skip(self))]
    pub async fn reap_idle_instances(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        for challenge in self.catalog.all().await {
            let instances = self.repo.by_challenge(&challenge.name).await?;

            let mut empties: Vec<_> = instances.iter().filter(|i| i.is_empty()).cloned().collect();
            let has_free_instance = instances
                .iter()
                .any(|i| i.has_free_seats(PREWARM_MARGIN));

            empties.sort_by_key(|i| i.started_at);

            if empties.len() > 1 {
                for inst in &empties[..empties.len() - 1] {
                    self.stop_instance_locked(inst).await?;
                }
            }

            if !has_free_instance && challenge.can_prestart {
                self.store.sadd(PREWARM_QUEUE, &challenge.name).await?;
            }
        }
        Ok(())
    }

    pub async fn prewarm_queue_snapshot(&self) -> Result<Vec<String>> {
        Ok(self.store.smembers(PREWARM_QUEUE).await?)
    }

    pub async fn queue_prewarm(&self, challenge: &str) -> Result<()> {
        self.store.sadd(PREWARM_QUEUE, challenge).await?;
        Ok(())
    }

    pub async fn current_user_count(&self) -> Result<u64> {
        Ok(self.store.scard(USERS).await?)
    }

    pub async fn assignment_for(&self, user: &str) -> Result<Option<String>> {
        Ok(self.store.get(&assignment_key(user)).await?)
    }

    pub async fn avoid_list_for(&self, user: &str) -> Result<Vec<String>> {
        Ok(self.store.smembers(&avoid_key(user)).await?)
    }

    /// Cumulative count of instances ever started, incremented by
    /// `start_instance` and never decremented.
    pub async fn total_instance_count(&self) -> Result<u64> {
        Ok(self
            .store
            .get("instance_count")
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    pub async fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }
}
