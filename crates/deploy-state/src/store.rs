//! StateStore — redb-backed rollout history.
//!
//! Finalized [`RolloutRecord`]s are stored once and never rewritten. The
//! known-good set of an environment is replaced whenever a rollout to it
//! succeeds. The store supports both on-disk and in-memory backends (the
//! latter for testing and dry runs).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use deploy_core::{KnownGoodSet, RolloutRecord};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(kind: &'static str, key: &str, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Encode {
        kind,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(kind: &'static str, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        kind,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Storage))?;
        txn.open_table(KNOWN_GOOD).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Store a finalized rollout record.
    pub fn put_rollout(&self, record: &RolloutRecord) -> StateResult<()> {
        if !record.state.is_terminal() {
            return Err(StateError::NotFinalized(record.id.clone()));
        }
        let key = rollout_key(record.environment(), &record.id);
        let value = encode("rollout", &key, record)?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Storage))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%key, state = record.state.label(), "rollout stored");
        Ok(())
    }

    /// Get one rollout of an environment by id.
    pub fn get_rollout(
        &self,
        environment: &str,
        rollout_id: &str,
    ) -> StateResult<Option<RolloutRecord>> {
        let key = rollout_key(environment, rollout_id);
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Storage))?;
        match table.get(key.as_str()).map_err(map_err!(Storage))? {
            Some(guard) => Ok(Some(decode("rollout", &key, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Rollouts of exactly `environment`, with their keys, oldest first.
    fn scan_rollouts(&self, environment: &str) -> StateResult<Vec<(String, RolloutRecord)>> {
        let prefix = environment_prefix(environment);
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                continue;
            }
            let record: RolloutRecord = decode("rollout", key, value.value())?;
            // "prod/eu/x" shares the "prod/" prefix but belongs elsewhere.
            if record.environment() == environment {
                results.push((key.to_string(), record));
            }
        }
        results.sort_by(|(_, a), (_, b)| {
            a.started_at_ms
                .cmp(&b.started_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }

    /// All rollouts of an environment, oldest first.
    pub fn list_rollouts(&self, environment: &str) -> StateResult<Vec<RolloutRecord>> {
        Ok(self
            .scan_rollouts(environment)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// The most recent rollout of an environment.
    pub fn latest_rollout(&self, environment: &str) -> StateResult<Option<RolloutRecord>> {
        Ok(self.list_rollouts(environment)?.pop())
    }

    /// Delete all but the newest `keep` rollouts of an environment.
    /// Returns the number removed.
    pub fn prune_rollouts(&self, environment: &str, keep: usize) -> StateResult<usize> {
        let mut entries = self.scan_rollouts(environment)?;
        let excess = entries.len().saturating_sub(keep);
        if excess == 0 {
            return Ok(0);
        }
        entries.truncate(excess);

        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Storage))?;
            for (key, _) in &entries {
                if table.remove(key.as_str()).map_err(map_err!(Storage))?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(environment, removed, "rollout history pruned");
        Ok(removed)
    }

    // ── Known-good sets ────────────────────────────────────────────

    /// Replace the known-good set of its environment.
    pub fn put_known_good(&self, set: &KnownGoodSet) -> StateResult<()> {
        let value = encode("known-good set", &set.environment, set)?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(KNOWN_GOOD).map_err(map_err!(Storage))?;
            table
                .insert(set.environment.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(environment = %set.environment, rollout = %set.rollout_id, "known-good set stored");
        Ok(())
    }

    pub fn get_known_good(&self, environment: &str) -> StateResult<Option<KnownGoodSet>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(KNOWN_GOOD).map_err(map_err!(Storage))?;
        match table.get(environment).map_err(map_err!(Storage))? {
            Some(guard) => Ok(Some(decode("known-good set", environment, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Forget the known-good set of an environment. Returns true if it existed.
    pub fn delete_known_good(&self, environment: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let existed;
        {
            let mut table = txn.open_table(KNOWN_GOOD).map_err(map_err!(Storage))?;
            existed = table.remove(environment).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(environment, existed, "known-good set deleted");
        Ok(existed)
    }

    /// Store a finalized record and, if it succeeded, promote its resource
    /// set to known-good, in one transaction.
    pub fn record_outcome(&self, record: &RolloutRecord) -> StateResult<()> {
        if !record.state.is_terminal() {
            return Err(StateError::NotFinalized(record.id.clone()));
        }
        let key = rollout_key(record.environment(), &record.id);
        let value = encode("rollout", &key, record)?;
        let known_good = record
            .known_good()
            .map(|set| encode("known-good set", record.environment(), &set))
            .transpose()?;

        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Storage))?;
            rollouts
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
            if let Some(set) = &known_good {
                let mut table = txn.open_table(KNOWN_GOOD).map_err(map_err!(Storage))?;
                table
                    .insert(record.environment(), set.as_slice())
                    .map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(
            %key,
            state = record.state.label(),
            promoted = known_good.is_some(),
            "rollout outcome recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use deploy_core::{
        ArtifactRef, BuildContext, DeployTarget, DeploymentSpec, HealthCheckSpec,
        ResourceDescriptor, RolloutPolicy, RolloutState, SuccessCondition,
    };

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_record(environment: &str, id: &str, started: u64, state: RolloutState) -> RolloutRecord {
        RolloutRecord {
            id: id.to_string(),
            spec: DeploymentSpec {
                name: "chatbot".to_string(),
                target: DeployTarget {
                    environment: environment.to_string(),
                    namespace: format!("chatbot-{environment}"),
                },
                build: BuildContext {
                    path: ".".to_string(),
                    image: "chatbot".to_string(),
                },
                resources: vec![ResourceDescriptor::new("workload", "k8s/deployment.yaml")],
                health: HealthCheckSpec {
                    endpoint: "http://127.0.0.1:8000/health".to_string(),
                    expect: SuccessCondition::default(),
                    poll_interval: Duration::from_secs(5),
                    deadline: Duration::from_secs(60),
                    probe_timeout: Duration::from_secs(2),
                },
                policy: RolloutPolicy::default(),
            },
            state,
            stages: Vec::new(),
            applied: vec!["workload".to_string()],
            artifact: Some(ArtifactRef(format!("chatbot:{id}"))),
            rollback_target: None,
            reason: None,
            started_at_ms: started,
            finished_at_ms: Some(started + 10),
        }
    }

    #[test]
    fn rollout_roundtrip() {
        let store = test_store();
        let record = test_record("prod", "prod-1-0", 1, RolloutState::Succeeded);
        store.put_rollout(&record).unwrap();

        assert_eq!(store.get_rollout("prod", "prod-1-0").unwrap(), Some(record));
        assert!(store.get_rollout("staging", "prod-1-0").unwrap().is_none());
    }

    #[test]
    fn unfinished_rollout_is_rejected() {
        let store = test_store();
        let record = test_record("prod", "prod-1-0", 1, RolloutState::Applying);
        assert!(matches!(
            store.put_rollout(&record),
            Err(StateError::NotFinalized(_))
        ));
        assert!(store.list_rollouts("prod").unwrap().is_empty());
    }

    #[test]
    fn history_is_per_environment_and_oldest_first() {
        let store = test_store();
        store
            .put_rollout(&test_record("prod", "prod-30-2", 30, RolloutState::Failed))
            .unwrap();
        store
            .put_rollout(&test_record("prod", "prod-10-0", 10, RolloutState::Succeeded))
            .unwrap();
        store
            .put_rollout(&test_record("staging", "staging-20-1", 20, RolloutState::Succeeded))
            .unwrap();
        // An environment whose name extends another must not leak in.
        store
            .put_rollout(&test_record("prod-eu", "prod-eu-5-3", 5, RolloutState::Succeeded))
            .unwrap();

        let ids: Vec<String> = store
            .list_rollouts("prod")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["prod-10-0", "prod-30-2"]);
        assert_eq!(
            store.latest_rollout("prod").unwrap().unwrap().id,
            "prod-30-2"
        );
        assert!(store.latest_rollout("dev").unwrap().is_none());
    }

    #[test]
    fn nested_environment_names_stay_separate() {
        let store = test_store();
        store
            .put_rollout(&test_record("prod", "a", 1, RolloutState::Succeeded))
            .unwrap();
        store
            .put_rollout(&test_record("prod/eu", "b", 2, RolloutState::Succeeded))
            .unwrap();

        let ids: Vec<String> = store
            .list_rollouts("prod")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["a"]);
        assert_eq!(store.latest_rollout("prod").unwrap().unwrap().id, "a");

        assert_eq!(store.prune_rollouts("prod", 0).unwrap(), 1);
        assert!(store.list_rollouts("prod").unwrap().is_empty());
        assert_eq!(store.list_rollouts("prod/eu").unwrap().len(), 1);
    }

    #[test]
    fn prune_keeps_newest() {
        let store = test_store();
        for i in 0..5u64 {
            store
                .put_rollout(&test_record(
                    "dev",
                    &format!("dev-{i}-{i}"),
                    i,
                    RolloutState::Succeeded,
                ))
                .unwrap();
        }

        assert_eq!(store.prune_rollouts("dev", 2).unwrap(), 3);
        let ids: Vec<String> = store
            .list_rollouts("dev")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["dev-3-3", "dev-4-4"]);
        assert_eq!(store.prune_rollouts("dev", 2).unwrap(), 0);
    }

    #[test]
    fn known_good_crud() {
        let store = test_store();
        let set = test_record("prod", "prod-1-0", 1, RolloutState::Succeeded)
            .known_good()
            .unwrap();

        store.put_known_good(&set).unwrap();
        assert_eq!(store.get_known_good("prod").unwrap(), Some(set));
        assert!(store.delete_known_good("prod").unwrap());
        assert!(!store.delete_known_good("prod").unwrap());
        assert!(store.get_known_good("prod").unwrap().is_none());
    }

    #[test]
    fn only_success_promotes_known_good() {
        let store = test_store();
        store
            .record_outcome(&test_record("prod", "prod-1-0", 1, RolloutState::Succeeded))
            .unwrap();
        store
            .record_outcome(&test_record("prod", "prod-2-1", 2, RolloutState::RolledBack))
            .unwrap();

        let good = store.get_known_good("prod").unwrap().unwrap();
        assert_eq!(good.rollout_id, "prod-1-0");
        assert_eq!(good.artifact, Some(ArtifactRef("chatbot:prod-1-0".to_string())));
        assert_eq!(store.list_rollouts("prod").unwrap().len(), 2);
    }

    #[test]
    fn unreadable_record_names_its_key() {
        let store = test_store();
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(ROLLOUTS).unwrap();
            table.insert("prod/x", b"not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let err = store.get_rollout("prod", "x").unwrap_err();
        assert!(
            matches!(&err, StateError::Corrupt { key, .. } if key == "prod/x"),
            "{err}"
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store
                .record_outcome(&test_record("prod", "prod-1-0", 1, RolloutState::Succeeded))
                .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_rollouts("prod").unwrap().len(), 1);
        assert!(store.get_known_good("prod").unwrap().is_some());
    }
}
