//! Capability tables.
//!
//! Both halves of the bouncer track capabilities the same way: a table of
//! advertised capabilities with optional values, plus the set currently
//! enabled on the connection.

use std::collections::{HashMap, HashSet};

/// Capability state for one connection.
#[derive(Clone, Debug, Default)]
pub struct Caps {
    available: HashMap<String, String>,
    enabled: HashSet<String>,
}

impl Caps {
    pub fn new() -> Self {
        Caps::default()
    }

    /// Digest a space-separated `CAP LS`/`CAP NEW` list of
    /// `name[=value]` entries. Names are lowercased.
    pub fn add_available(&mut self, caps: &str) {
        for item in caps.split_whitespace() {
            let (name, value) = match item.split_once('=') {
                Some((n, v)) => (n, v),
                None => (item, ""),
            };
            self.available
                .insert(name.to_ascii_lowercase(), value.to_owned());
        }
    }

    pub fn set_available(&mut self, name: &str, value: &str) {
        self.available
            .insert(name.to_ascii_lowercase(), value.to_owned());
    }

    /// Forget a capability entirely (CAP DEL).
    pub fn remove_available(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.available.remove(&name);
        self.enabled.remove(&name);
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.available.contains_key(name)
    }

    /// Advertised value of a capability, if any.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.available.get(name).map(String::as_str)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        let name = name.to_ascii_lowercase();
        if enabled {
            self.enabled.insert(name);
        } else {
            self.enabled.remove(&name);
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }

    pub fn available(&self) -> impl Iterator<Item = (&str, &str)> {
        self.available.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.enabled.iter().map(String::as_str)
    }

    pub fn clear_available(&mut self) {
        self.available.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ls_parsing_with_values() {
        let mut caps = Caps::new();
        caps.add_available("sasl=PLAIN,EXTERNAL server-time Batch");
        assert!(caps.is_available("sasl"));
        assert_eq!(caps.value("sasl"), Some("PLAIN,EXTERNAL"));
        assert_eq!(caps.value("server-time"), Some(""));
        assert!(caps.is_available("batch"), "names are lowercased");
    }

    #[test]
    fn enable_disable() {
        let mut caps = Caps::new();
        caps.add_available("message-tags");
        caps.set_enabled("message-tags", true);
        assert!(caps.is_enabled("message-tags"));
        caps.set_enabled("message-tags", false);
        assert!(!caps.is_enabled("message-tags"));
    }

    #[test]
    fn del_clears_enabled() {
        let mut caps = Caps::new();
        caps.add_available("away-notify");
        caps.set_enabled("away-notify", true);
        caps.remove_available("away-notify");
        assert!(!caps.is_available("away-notify"));
        assert!(!caps.is_enabled("away-notify"));
    }
}
