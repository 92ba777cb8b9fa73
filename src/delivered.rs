//! Per-client delivery receipts.
//!
//! For every conversation target the bouncer remembers, per client name,
//! the last internal message ID that client has acknowledged. Clients
//! without a persistent name leave no receipts.

use std::collections::{HashMap, HashSet};

use slbnc_proto::{Casemap, NameMap};

/// target -> client name -> last delivered internal message ID.
#[derive(Clone, Debug, Default)]
pub struct DeliveredStore {
    m: NameMap<HashMap<String, String>>,
}

impl DeliveredStore {
    pub fn new() -> Self {
        DeliveredStore::default()
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.m.has(target)
    }

    /// Last delivered ID for (target, client), or `None`.
    pub fn load_id(&self, target: &str, client_name: &str) -> Option<&str> {
        self.m
            .get(target)?
            .get(client_name)
            .map(String::as_str)
    }

    pub fn store_id(&mut self, target: &str, client_name: &str, msg_id: &str) {
        match self.m.get_mut(target) {
            Some(clients) => {
                clients.insert(client_name.to_owned(), msg_id.to_owned());
            }
            None => {
                let mut clients = HashMap::new();
                clients.insert(client_name.to_owned(), msg_id.to_owned());
                self.m.insert(target, clients);
            }
        }
    }

    /// Visit every known target, by original spelling.
    pub fn for_each_target(&self, mut f: impl FnMut(&str)) {
        for (target, _) in self.m.iter() {
            f(target);
        }
    }

    /// Visit the union of client names across all targets.
    pub fn for_each_client(&self, mut f: impl FnMut(&str)) {
        let mut clients = HashSet::new();
        for (_, per_client) in self.m.iter() {
            for name in per_client.keys() {
                clients.insert(name.clone());
            }
        }
        for name in clients {
            f(&name);
        }
    }

    pub fn set_casemap(&mut self, casemap: Casemap) {
        self.m.set_casemap(casemap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load() {
        let mut ds = DeliveredStore::new();
        assert_eq!(ds.load_id("#chan", "laptop"), None);
        ds.store_id("#chan", "laptop", "m1");
        ds.store_id("#chan", "phone", "m2");
        assert_eq!(ds.load_id("#chan", "laptop"), Some("m1"));
        assert_eq!(ds.load_id("#chan", "phone"), Some("m2"));
        ds.store_id("#chan", "laptop", "m3");
        assert_eq!(ds.load_id("#chan", "laptop"), Some("m3"));
    }

    #[test]
    fn casemap_aware_lookup() {
        let mut ds = DeliveredStore::new();
        ds.set_casemap(Casemap::Rfc1459);
        ds.store_id("#Chan[1]", "laptop", "m1");
        assert_eq!(ds.load_id("#chan{1}", "laptop"), Some("m1"));
        ds.set_casemap(Casemap::Ascii);
        assert_eq!(ds.load_id("#chan[1]", "laptop"), Some("m1"));
        assert_eq!(ds.load_id("#chan{1}", "laptop"), None);
    }

    #[test]
    fn client_union() {
        let mut ds = DeliveredStore::new();
        ds.store_id("#a", "laptop", "m1");
        ds.store_id("#b", "laptop", "m2");
        ds.store_id("#b", "phone", "m3");
        let mut clients = Vec::new();
        ds.for_each_client(|c| clients.push(c.to_owned()));
        clients.sort();
        assert_eq!(clients, ["laptop", "phone"]);
    }
}
