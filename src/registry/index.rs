// src/registry/index.rs
use dashmap::DashMap;

/// Advisory `sessionId -> backendId` map. Entries are a routing hint, not
/// ground truth: stale entries are tolerated and overwritten by later
/// observations (last writer wins).
#[derive(Debug, Default)]
pub struct SessionIndex {
    entries: DashMap<String, String>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous owner when the entry was overwritten.
    pub fn insert(&self, session_id: &str, backend_id: &str) -> Option<String> {
        self.entries
            .insert(session_id.to_string(), backend_id.to_string())
    }

    pub fn lookup(&self, session_id: &str) -> Option<String> {
        self.entries.get(session_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<String> {
        self.entries.remove(session_id).map(|(_, backend)| backend)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
