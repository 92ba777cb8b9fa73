//! In-process identd registry.
//!
//! Entries are keyed by the (remote, local) address pair of an upstream
//! socket and scoped to the connection's lifetime. The ident string sent
//! upstream is a stable pseudonymous digest of the user id so it never
//! leaks user metadata.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// Shared identd table. Safe to use from any task.
#[derive(Default)]
pub struct Identd {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl Identd {
    pub fn new() -> Self {
        Identd::default()
    }

    pub fn store(&self, remote_addr: &str, local_addr: &str, ident: String) {
        self.entries
            .lock()
            .unwrap()
            .insert((remote_addr.to_owned(), local_addr.to_owned()), ident);
    }

    pub fn delete(&self, remote_addr: &str, local_addr: &str) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(remote_addr.to_owned(), local_addr.to_owned()));
    }

    pub fn lookup(&self, remote_addr: &str, local_addr: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(&(remote_addr.to_owned(), local_addr.to_owned()))
            .cloned()
    }
}

/// Pseudonymous ident for a user: hex of the first 16 bytes of SHA-256
/// over the little-endian user id.
pub fn user_ident(user_id: i64) -> String {
    let mut buf = [0u8; 64];
    buf[..8].copy_from_slice(&(user_id as u64).to_le_bytes());
    let digest = Sha256::digest(buf);
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_is_stable_and_opaque() {
        let a = user_ident(42);
        let b = user_ident(42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(user_ident(43), a);
        assert!(!a.contains("42"));
    }

    #[test]
    fn store_and_delete() {
        let identd = Identd::new();
        identd.store("1.2.3.4:6697", "10.0.0.1:5000", "abc".into());
        assert_eq!(
            identd.lookup("1.2.3.4:6697", "10.0.0.1:5000").as_deref(),
            Some("abc")
        );
        identd.delete("1.2.3.4:6697", "10.0.0.1:5000");
        assert!(identd.lookup("1.2.3.4:6697", "10.0.0.1:5000").is_none());
    }
}
