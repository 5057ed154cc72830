//! Configuration loading from JSON files

use minirep::{
    ClientId, ClientMode, ClientService, Config, InMemoryProvider, ReplError, SimulationConfig,
    State, TransactionContext, TransactionId,
};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

struct Session;

impl ClientService for Session {
    fn id(&self) -> ClientId {
        ClientId(1)
    }

    fn mode(&self) -> ClientMode {
        ClientMode::Replicating
    }

    fn replay(&self, _txc: &TransactionContext) -> minirep::Result<()> {
        Ok(())
    }
}

#[test]
fn test_load_full_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("minirep.json");
    fs::write(
        &path,
        r#"{
            "transaction": { "state_history_limit": 4 },
            "provider": { "source_id": 3, "commit_order_timeout_ms": 500 },
            "simulation": { "clients": 2, "transactions_per_client": 10, "seed": 1 }
        }"#,
    )
    .unwrap();

    let config = Config::from_json_file(&path).unwrap();
    assert_eq!(config.transaction.state_history_limit, 4);
    assert_eq!(config.provider.source_id, 3);
    assert_eq!(config.provider.commit_order_timeout_ms, 500);
    assert_eq!(config.provider.max_write_set_bytes, 0);
    assert_eq!(config.simulation.clients, 2);
    assert_eq!(
        config.simulation.key_space,
        SimulationConfig::default().key_space
    );
}

#[test]
fn test_loaded_config_drives_context_and_provider() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("minirep.json");
    fs::write(
        &path,
        r#"{ "transaction": { "state_history_limit": 2 }, "provider": { "source_id": 7 } }"#,
    )
    .unwrap();
    let config = Config::from_json_file(&path).unwrap();

    let provider = Arc::new(InMemoryProvider::new(config.provider.clone()));
    let txc = TransactionContext::with_config(Arc::new(Session), provider.clone(), config.transaction);
    txc.start_transaction(TransactionId::new(1)).unwrap();
    txc.before_commit().unwrap();
    txc.after_commit().unwrap();

    assert_eq!(txc.state_history(), vec![State::OrderedCommit, State::Committed]);
    assert_eq!(txc.trx_meta().gtid.source, provider.source_id());
    assert_eq!(provider.source_id().0, 7);
}

#[test]
fn test_missing_file() {
    let dir = tempdir().unwrap();
    let result = Config::from_json_file(dir.path().join("absent.json"));
    assert!(matches!(result, Err(ReplError::Io(_))));
}

#[test]
fn test_malformed_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(&path, "{ \"provider\": ").unwrap();
    assert!(matches!(Config::from_json_file(&path), Err(ReplError::Json(_))));
}

#[test]
fn test_invalid_simulation_values_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(&path, r#"{ "simulation": { "bf_abort_probability": 2.0 } }"#).unwrap();
    assert!(matches!(Config::from_json_file(&path), Err(ReplError::Config(_))));
}
