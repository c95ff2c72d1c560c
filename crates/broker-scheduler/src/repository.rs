//! Marshalled storage of [`Instance`] records and the index sets that let the
//! scheduler answer "which instances serve challenge X" and "is port P taken"
//! without scanning every record.

use broker_common::{BrokerError, Instance, Result};
use broker_store::{StateStore, StoreOp};
use std::sync::Arc;

const USED_PORTS: &str = "used_ports";
const ALL_INSTANCES: &str = "all_instances";

fn by_challenge_key(challenge: &str) -> String {
    format!("by_challenge:{challenge}")
}

fn instance_key(container_id: &str) -> String {
    format!("instance:{container_id}")
}

pub struct InstanceRepository {
    store: Arc<dyn StateStore>,
}

impl InstanceRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Atomically writes the record and all three index memberships.
    pub async fn save(&self, instance: &Instance) -> Result<()> {
        let serialized = serde_json::to_string(instance)
            .map_err(|e| BrokerError::Internal(format!("failed to serialize instance: {e}")))?;

        self.store
            .pipeline(vec![
                StoreOp::Set {
                    key: instance_key(&instance.container_id),
                    value: serialized,
                },
                StoreOp::Sadd {
                    key: USED_PORTS.to_string(),
                    member: instance.external_port.to_string(),
                },
                StoreOp::Sadd {
                    key: by_challenge_key(&instance.challenge),
                    member: instance.container_id.clone(),
                },
                StoreOp::Sadd {
                    key: ALL_INSTANCES.to_string(),
                    member: instance.container_id.clone(),
                },
            ])
            .await
            .map_err(Into::into)
    }

    /// Atomic inverse of `save`. Uses the instance's own `challenge` field for
    /// the index removal and removes `external_port`, not any internal-port
    /// mapping, from `used_ports`.
    pub async fn forget(&self, instance: &Instance) -> Result<()> {
        self.store
            .pipeline(vec![
                StoreOp::Del {
                    key: instance_key(&instance.container_id),
                },
                StoreOp::Srem {
                    key: USED_PORTS.to_string(),
                    member: instance.external_port.to_string(),
                },
                StoreOp::Srem {
                    key: by_challenge_key(&instance.challenge),
                    member: instance.container_id.clone(),
                },
                StoreOp::Srem {
                    key: ALL_INSTANCES.to_string(),
                    member: instance.container_id.clone(),
                },
            ])
            .await
            .map_err(Into::into)
    }

    pub async fn get(&self, container_id: &str) -> Result<Option<Instance>> {
        let raw = self.store.get(&instance_key(container_id)).await?;
        match raw {
            None => Ok(None),
            Some(s) => {
                let inst = serde_json::from_str(&s).map_err(|e| {
                    BrokerError::Internal(format!("corrupt instance record: {e}"))
                })?;
                Ok(Some(inst))
            }
        }
    }

    pub async fn by_challenge(&self, challenge: &str) -> Result<Vec<Instance>> {
        let ids = self.store.smembers(&by_challenge_key(challenge)).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(inst) = self.get(&id).await? {
                out.push(inst);
            }
        }
        Ok(out)
    }

    pub async fn is_port_used(&self, port: u16) -> Result<bool> {
        Ok(self.store.sismember(USED_PORTS, &port.to_string()).await?)
    }

    pub async fn used_port_count(&self) -> Result<u64> {
        Ok(self.store.scard(USED_PORTS).await?)
    }

    pub async fn all_instance_count(&self) -> Result<u64> {
        Ok(self.store.scard(ALL_INSTANCES).await?)
    }

    pub async fn all_instance_ids(&self) -> Result<Vec<String>> {
        Ok(self.store.smembers(ALL_INSTANCES).await?)
    }
}
