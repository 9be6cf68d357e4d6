use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use tokio::sync::RwLock;

use crate::relay::session::RelaySession;

/// Single synchronized access point for all live sessions. Connect and
/// disconnect handling for different ids must not race on this table.
static SESSION_REGISTRY: LazyLock<RwLock<HashMap<String, Arc<RelaySession>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

pub(crate) async fn add_session(id: &str, session: Arc<RelaySession>) -> anyhow::Result<()> {
    let mut sessions = SESSION_REGISTRY.write().await;
    if sessions.contains_key(id) {
        return Err(anyhow::anyhow!("session {} already registered", id));
    }
    sessions.insert(id.to_string(), session);
    Ok(())
}

/// Idempotent: removing an absent id is a no-op, not an error.
pub(crate) async fn remove_session(id: &str) -> Option<Arc<RelaySession>> {
    SESSION_REGISTRY.write().await.remove(id)
}

pub(crate) async fn get_session(id: &str) -> Option<Arc<RelaySession>> {
    SESSION_REGISTRY.read().await.get(id).cloned()
}

/// Stable snapshot for the shutdown broadcast.
pub(crate) async fn snapshot() -> Vec<Arc<RelaySession>> {
    SESSION_REGISTRY.read().await.values().cloned().collect()
}

pub(crate) async fn active_count() -> usize {
    SESSION_REGISTRY.read().await.len()
}
