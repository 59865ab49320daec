//! Round-robin key rotation for the Google-style provider.
//!
//! The registry is process-wide, shared behind the gateway, and every
//! mutation happens inside one short critical section.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

pub const MAX_KEYS: usize = 10;

#[derive(Debug, Clone)]
struct KeyEntry {
    id: String,
    key: String,
    enabled: bool,
    cooldown_until: Option<Instant>,
    failures: u32,
}

#[derive(Debug)]
struct RotationState {
    keys: Vec<KeyEntry>,
    cursor: usize,
    next_id: usize,
}

impl RotationState {
    fn push_key(&mut self, key: String) {
        self.next_id += 1;
        self.keys.push(KeyEntry {
            id: format!("key-{}", self.next_id),
            key,
            enabled: true,
            cooldown_until: None,
            failures: 0,
        });
    }
}

/// Status row exposed over the API; never contains the raw key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub id: String,
    pub masked_key: String,
    pub enabled: bool,
    pub cooling_down: bool,
    pub failures: u32,
}

pub struct KeyRotation {
    state: Mutex<RotationState>,
    cooldown: Duration,
}

/// Show only the last four characters of a credential.
pub fn masked_key(key: &str) -> String {
    if key.len() > 4 {
        format!("****{}", &key[key.len() - 4..])
    } else {
        "****".to_string()
    }
}

impl KeyRotation {
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Self {
        let mut state = RotationState {
            keys: Vec::new(),
            cursor: 0,
            next_id: 0,
        };
        for key in keys.into_iter().take(MAX_KEYS) {
            state.push_key(key);
        }

        Self {
            state: Mutex::new(state),
            cooldown,
        }
    }

    /// Reconcile the pool with the configured key list: drop removed keys,
    /// add new ones, and keep cooldown state for the ones that stay. Lets a
    /// `/config` write take effect without a restart.
    pub fn sync_pool(&self, desired: &[String]) {
        let mut state = self.state.lock().expect("key rotation lock poisoned");
        state.keys.retain(|e| desired.contains(&e.key));
        for key in desired.iter().take(MAX_KEYS) {
            if state.keys.len() >= MAX_KEYS {
                break;
            }
            if !state.keys.iter().any(|e| &e.key == key) {
                state.push_key(key.clone());
            }
        }
        if state.cursor >= state.keys.len() {
            state.cursor = 0;
        }
    }

    /// Pick the next enabled, non-cooling key round-robin.
    pub fn next_key(&self) -> Option<String> {
        let mut state = self.state.lock().expect("key rotation lock poisoned");
        let now = Instant::now();
        let len = state.keys.len();
        if len == 0 {
            return None;
        }

        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            let usable = {
                let entry = &state.keys[idx];
                entry.enabled && entry.cooldown_until.map_or(true, |t| t <= now)
            };
            if usable {
                state.cursor = (idx + 1) % len;
                return Some(state.keys[idx].key.clone());
            }
        }
        None
    }

    /// Put a key on cooldown after a rate-limit or auth failure.
    pub fn mark_cooldown(&self, key: &str) {
        let mut state = self.state.lock().expect("key rotation lock poisoned");
        if let Some(entry) = state.keys.iter_mut().find(|e| e.key == key) {
            entry.cooldown_until = Some(Instant::now() + self.cooldown);
            entry.failures += 1;
        }
    }

    /// Add a pre-validated key; rejects duplicates and pool overflow.
    pub fn add_key(&self, key: String) -> Result<(), String> {
        let mut state = self.state.lock().expect("key rotation lock poisoned");
        if state.keys.len() >= MAX_KEYS {
            return Err(format!("key pool is full (max {MAX_KEYS})"));
        }
        if state.keys.iter().any(|e| e.key == key) {
            return Err("key already registered".to_string());
        }
        state.push_key(key);
        Ok(())
    }

    pub fn set_enabled(&self, key_id: &str, enabled: bool) -> bool {
        let mut state = self.state.lock().expect("key rotation lock poisoned");
        match state.keys.iter_mut().find(|e| e.id == key_id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn enabled_count(&self) -> usize {
        let state = self.state.lock().expect("key rotation lock poisoned");
        let now = Instant::now();
        state
            .keys
            .iter()
            .filter(|e| e.enabled && e.cooldown_until.map_or(true, |t| t <= now))
            .count()
    }

    pub fn status(&self) -> Vec<KeyStatus> {
        let state = self.state.lock().expect("key rotation lock poisoned");
        let now = Instant::now();
        state
            .keys
            .iter()
            .map(|e| KeyStatus {
                id: e.id.clone(),
                masked_key: masked_key(&e.key),
                enabled: e.enabled,
                cooling_down: e.cooldown_until.map_or(false, |t| t > now),
                failures: e.failures,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation(keys: &[&str]) -> KeyRotation {
        KeyRotation::new(
            keys.iter().map(|k| k.to_string()).collect(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn round_robin_cycles_through_enabled_keys() {
        let rot = rotation(&["a", "b", "c"]);
        assert_eq!(rot.next_key().as_deref(), Some("a"));
        assert_eq!(rot.next_key().as_deref(), Some("b"));
        assert_eq!(rot.next_key().as_deref(), Some("c"));
        assert_eq!(rot.next_key().as_deref(), Some("a"));
    }

    #[test]
    fn cooldown_skips_key_until_expiry() {
        let rot = rotation(&["a", "b"]);
        rot.mark_cooldown("a");
        assert_eq!(rot.next_key().as_deref(), Some("b"));
        assert_eq!(rot.next_key().as_deref(), Some("b"));
        assert_eq!(rot.enabled_count(), 1);
    }

    #[test]
    fn disabled_keys_are_never_returned() {
        let rot = rotation(&["a", "b"]);
        assert!(rot.set_enabled("key-1", false));
        assert_eq!(rot.next_key().as_deref(), Some("b"));
        assert_eq!(rot.next_key().as_deref(), Some("b"));
    }

    #[test]
    fn empty_or_exhausted_pool_returns_none() {
        let rot = rotation(&[]);
        assert!(rot.next_key().is_none());

        let rot = rotation(&["only"]);
        rot.mark_cooldown("only");
        assert!(rot.next_key().is_none());
    }

    #[test]
    fn add_key_rejects_duplicates() {
        let rot = rotation(&["a"]);
        assert!(rot.add_key("a".to_string()).is_err());
        assert!(rot.add_key("b".to_string()).is_ok());
        assert_eq!(rot.status().len(), 2);
    }

    #[test]
    fn sync_pool_keeps_state_for_surviving_keys() {
        let rot = rotation(&["a", "b"]);
        rot.mark_cooldown("a");

        rot.sync_pool(&["a".to_string(), "c".to_string()]);

        // "b" is gone, "a" keeps its cooldown, "c" is fresh.
        assert_eq!(rot.next_key().as_deref(), Some("c"));
        assert_eq!(rot.next_key().as_deref(), Some("c"));
        let status = rot.status();
        assert_eq!(status.len(), 2);
        assert!(status.iter().any(|k| k.cooling_down));
    }

    #[test]
    fn masking_keeps_only_tail() {
        assert_eq!(masked_key("AIzaSyExample1234"), "****1234");
        assert_eq!(masked_key("abc"), "****");
    }
}
