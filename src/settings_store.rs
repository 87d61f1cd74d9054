use crate::types::SettingsMap;
use std::cell::RefCell;
use std::collections::HashMap;

/// Remembers the SETTINGS a peer asked to persist, keyed by endpoint
/// (`host:port`). Values are opaque to the store.
pub trait SettingsStore {
    fn get_remembered_settings(&self, endpoint: &str) -> SettingsMap;
    fn set_remembered_settings(&self, endpoint: &str, settings: SettingsMap);
    fn clear_remembered_settings(&self, endpoint: &str);
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    entries: RefCell<HashMap<String, SettingsMap>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn get_remembered_settings(&self, endpoint: &str) -> SettingsMap {
        self.entries
            .borrow()
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    fn set_remembered_settings(&self, endpoint: &str, settings: SettingsMap) {
        self.entries
            .borrow_mut()
            .insert(endpoint.to_string(), settings);
    }

    fn clear_remembered_settings(&self, endpoint: &str) {
        self.entries.borrow_mut().remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_per_endpoint() {
        let store = InMemorySettingsStore::new();
        let mut settings = SettingsMap::new();
        settings.insert(0x3, 50);
        store.set_remembered_settings("example.com:443", settings.clone());

        assert_eq!(store.get_remembered_settings("example.com:443"), settings);
        assert!(store.get_remembered_settings("other.com:443").is_empty());

        store.clear_remembered_settings("example.com:443");
        assert!(store.get_remembered_settings("example.com:443").is_empty());
    }
}
