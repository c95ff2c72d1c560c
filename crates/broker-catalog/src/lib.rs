//! Loads challenge manifests from disk, builds their images, and holds the
//! read-mostly registry the scheduler consults to validate challenge names
//! and pull limits from.

use broker_common::Challenge;
use broker_runtime::ContainerRuntime;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("unknown challenge: {0}")]
    UnknownChallenge(String),

    #[error("failed to read challenge directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("build failed for {challenge}: {source}")]
    Build {
        challenge: String,
        #[source]
        source: broker_runtime::RuntimeError,
    },
}

pub type Result<T> = std::result::Result<T, CatalogError>;

impl From<CatalogError> for broker_common::BrokerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownChallenge(name) => {
                broker_common::BrokerError::UnknownChallenge(name)
            }
            other => broker_common::BrokerError::Config(other.to_string()),
        }
    }
}

/// On-disk shape of `challenges/<name>/challenge.json`.
#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    port: u16,
    mem_limit: u32,
    user_limit: u32,
    lifetime: u64,
    #[serde(default)]
    can_prestart: bool,
}

impl From<Manifest> for Challenge {
    fn from(m: Manifest) -> Self {
        Challenge {
            name: m.name,
            internal_port: m.port,
            mem_limit_mb: m.mem_limit,
            user_limit: m.user_limit,
            lifetime_seconds: m.lifetime,
            can_prestart: m.can_prestart,
        }
    }
}

/// Read-mostly registry of known challenges, keyed by name.
pub struct Catalog {
    challenges: RwLock<HashMap<String, Challenge>>,
    challenge_dir: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Catalog {
    pub fn new(challenge_dir: impl Into<PathBuf>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            challenges: RwLock::new(HashMap::new()),
            challenge_dir: challenge_dir.into(),
            runtime,
        }
    }

    fn discover(&self) -> Result<Vec<(Manifest, PathBuf)>> {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(&self.challenge_dir).map_err(|e| CatalogError::Io {
            path: self.challenge_dir.clone(),
            source: e,
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::Io {
                path: self.challenge_dir.clone(),
                source: e,
            })?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest_path = dir.join("challenge.json");
            if !manifest_path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&manifest_path).map_err(|e| CatalogError::Io {
                path: manifest_path.clone(),
                source: e,
            })?;
            let manifest: Manifest =
                serde_json::from_str(&raw).map_err(|e| CatalogError::Manifest {
                    path: manifest_path.clone(),
                    source: e,
                })?;
            found.push((manifest, dir));
        }
        Ok(found)
    }

    /// Discovers and builds every challenge under the challenge directory.
    /// Challenges whose image fails to build are logged and dropped; this is
    /// `build_error`, which never surfaces past this point. Returns the set
    /// of challenges that loaded successfully, for the caller to seed warm
    /// instances from.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Vec<Challenge>> {
        let manifests = self.discover()?;
        let mut loaded = Vec::new();

        for (manifest, dir) in manifests {
            let challenge: Challenge = manifest.into();
            match self.runtime.build_image(&challenge.name, &dir).await {
                Ok(()) => {
                    info!(challenge = %challenge.name, "catalog: loaded challenge");
                    self.challenges
                        .write()
                        .await
                        .insert(challenge.name.clone(), challenge.clone());
                    loaded.push(challenge);
                }
                Err(e) => {
                    warn!(challenge = %challenge.name, error = %e, "catalog: dropping challenge, build failed");
                }
            }
        }
        Ok(loaded)
    }

    /// Registers a challenge added at runtime via the admin endpoint. Builds
    /// the image first and only inserts into the registry once the build
    /// succeeds, so a concurrent lookup never observes a half-registered
    /// challenge (a lookup against a name whose build is still in flight
    /// gets `UnknownChallenge`, not a partially initialized entry).
    #[instrument(skip(self, context_path))]
    pub async fn register(&self, challenge: Challenge, context_path: &Path) -> Result<()> {
        self.runtime
            .build_image(&challenge.name, context_path)
            .await
            .map_err(|e| CatalogError::Build {
                challenge: challenge.name.clone(),
                source: e,
            })?;

        self.challenges
            .write()
            .await
            .insert(challenge.name.clone(), challenge);
        Ok(())
    }

    pub async fn remove(&self, name: &str) {
        self.challenges.write().await.remove(name);
    }

    pub async fn get(&self, name: &str) -> Option<Challenge> {
        self.challenges.read().await.get(name).cloned()
    }

    pub async fn require(&self, name: &str) -> Result<Challenge> {
        self.get(name)
            .await
            .ok_or_else(|| CatalogError::UnknownChallenge(name.to_string()))
    }

    pub async fn all(&self) -> Vec<Challenge> {
        self.challenges.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.challenges.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_runtime::fake::FakeRuntime;
    use std::fs;

    fn write_manifest(dir: &Path, name: &str, can_prestart: bool) {
        let challenge_dir = dir.join(name);
        fs::create_dir_all(&challenge_dir).unwrap();
        let manifest = serde_json::json!({
            "name": name,
            "port": 8000,
            "mem_limit": 64,
            "user_limit": 4,
            "lifetime": 600,
            "can_prestart": can_prestart,
        });
        fs::write(
            challenge_dir.join("challenge.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn loads_well_formed_challenges() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "echo", false);

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::default());
        let catalog = Catalog::new(dir.path(), runtime);
        let loaded = catalog.load().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert!(catalog.get("echo").await.is_some());
    }

    #[tokio::test]
    async fn build_failure_drops_challenge_from_catalog() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "broken", false);
        write_manifest(dir.path(), "echo", false);

        let fake = FakeRuntime::default();
        fake.fail_build_for("broken");
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(fake);

        let catalog = Catalog::new(dir.path(), runtime);
        let loaded = catalog.load().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert!(catalog.get("broken").await.is_none());
        assert!(catalog.get("echo").await.is_some());
        assert_eq!(catalog.len().await, 1);
    }

    #[tokio::test]
    async fn register_is_invisible_until_build_completes() {
        let dir = tempfile::tempdir().unwrap();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::default());
        let catalog = Catalog::new(dir.path(), runtime);

        assert!(catalog.get("newchal").await.is_none());

        let challenge = Challenge {
            name: "newchal".into(),
            internal_port: 9000,
            mem_limit_mb: 64,
            user_limit: 4,
            lifetime_seconds: 600,
            can_prestart: false,
        };
        catalog.register(challenge, dir.path()).await.unwrap();
        assert!(catalog.get("newchal").await.is_some());
    }
}
