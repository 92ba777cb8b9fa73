//! IRC case-mapping and case-mapping aware name indexes.
//!
//! Networks advertise their canonicalization rule via `ISUPPORT
//! CASEMAPPING`; every name-keyed table the bouncer holds for a network
//! must be interpreted under that rule, and re-interpreted when the rule
//! changes mid-connection.

use std::collections::HashMap;

/// Canonicalization rule for IRC identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Casemap {
    /// Plain ASCII lowercasing.
    Ascii,
    /// ASCII plus `{}|^` ↔ `[]\~`.
    #[default]
    Rfc1459,
    /// ASCII plus `{}|` ↔ `[]\` (without the `~` ↔ `^` rule).
    Rfc1459Strict,
}

impl Casemap {
    /// Parse an `ISUPPORT CASEMAPPING` token value.
    pub fn from_token(value: &str) -> Option<Casemap> {
        match value {
            "ascii" => Some(Casemap::Ascii),
            "rfc1459" => Some(Casemap::Rfc1459),
            "rfc1459-strict" => Some(Casemap::Rfc1459Strict),
            _ => None,
        }
    }

    fn map_byte(self, b: u8) -> u8 {
        match (self, b) {
            (_, b'A'..=b'Z') => b + b'a' - b'A',
            (Casemap::Ascii, _) => b,
            (_, b'{') => b'[',
            (_, b'}') => b']',
            (_, b'\\') => b'|',
            (Casemap::Rfc1459, b'~') => b'^',
            (_, _) => b,
        }
    }

    /// Canonical representation of `name` under this casemap.
    pub fn canonical(self, name: &str) -> String {
        let mut bytes = name.as_bytes().to_vec();
        for b in &mut bytes {
            *b = self.map_byte(*b);
        }
        // Only ASCII bytes are rewritten, so the result stays valid UTF-8.
        String::from_utf8(bytes).expect("casemap preserves UTF-8")
    }

    /// True when `a` and `b` are the same identifier under this casemap.
    pub fn eq(self, a: &str, b: &str) -> bool {
        a.len() == b.len()
            && a.bytes()
                .zip(b.bytes())
                .all(|(x, y)| self.map_byte(x) == self.map_byte(y))
    }

    /// Canonicalize only the non-alphabetic bytes of `name`.
    ///
    /// Applied to entity names before they hit the wire so that the special
    /// characters compare consistently while the letters keep whatever
    /// casing the user typed.
    pub fn partial(self, name: &str) -> String {
        let mut bytes = name.as_bytes().to_vec();
        for b in &mut bytes {
            if !b.is_ascii_alphabetic() {
                *b = self.map_byte(*b);
            }
        }
        String::from_utf8(bytes).expect("casemap preserves UTF-8")
    }
}

/// A map keyed by case-mapped names that remembers the original spelling
/// of each key and can be re-keyed under a different casemap.
#[derive(Clone, Debug, Default)]
pub struct NameMap<T> {
    casemap: Casemap,
    inner: HashMap<String, (String, T)>,
}

impl<T> NameMap<T> {
    pub fn new() -> Self {
        NameMap {
            casemap: Casemap::default(),
            inner: HashMap::new(),
        }
    }

    pub fn with_casemap(casemap: Casemap) -> Self {
        NameMap {
            casemap,
            inner: HashMap::new(),
        }
    }

    pub fn casemap(&self) -> Casemap {
        self.casemap
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(&self.casemap.canonical(name))
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.inner
            .get(&self.casemap.canonical(name))
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.inner
            .get_mut(&self.casemap.canonical(name))
            .map(|(_, v)| v)
    }

    /// The spelling the key was first inserted under.
    pub fn original_key(&self, name: &str) -> Option<&str> {
        self.inner
            .get(&self.casemap.canonical(name))
            .map(|(k, _)| k.as_str())
    }

    /// Insert or replace, keeping the original key of an existing entry.
    pub fn insert(&mut self, name: &str, value: T) {
        let key = self.casemap.canonical(name);
        match self.inner.get_mut(&key) {
            Some(entry) => entry.1 = value,
            None => {
                self.inner.insert(key, (name.to_owned(), value));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.inner
            .remove(&self.casemap.canonical(name))
            .map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Iterate over `(original key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.inner.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.inner.values_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Swap the casemap and re-key every entry under the new rule.
    pub fn set_casemap(&mut self, casemap: Casemap) {
        self.casemap = casemap;
        let entries = std::mem::take(&mut self.inner);
        for (_, (original, value)) in entries {
            self.inner
                .insert(casemap.canonical(&original), (original, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_is_idempotent() {
        for cm in [Casemap::Ascii, Casemap::Rfc1459, Casemap::Rfc1459Strict] {
            for s in ["FOO{}", "nick\\away", "Test~Name", "#Chan[1]"] {
                let once = cm.canonical(s);
                assert_eq!(cm.canonical(&once), once);
            }
        }
    }

    #[test]
    fn rfc1459_brackets() {
        assert_eq!(
            Casemap::Rfc1459.canonical("FOO{}"),
            Casemap::Rfc1459.canonical("foo[]")
        );
        assert!(Casemap::Rfc1459.eq("Nick~", "nick^"));
        assert!(!Casemap::Rfc1459Strict.eq("Nick~", "nick^"));
        assert!(Casemap::Rfc1459Strict.eq("a{|}", "A[\\]"));
    }

    #[test]
    fn ascii_leaves_specials() {
        assert_eq!(Casemap::Ascii.canonical("A{}"), "a{}");
    }

    #[test]
    fn partial_preserves_letters() {
        assert_eq!(Casemap::Rfc1459.partial("FooBar{X}"), "FooBar[X]");
    }

    #[test]
    fn name_map_lookup() {
        let mut m = NameMap::with_casemap(Casemap::Rfc1459);
        m.insert("#Chan[1]", 7);
        assert_eq!(m.get("#chan{1}"), Some(&7));
        assert_eq!(m.original_key("#CHAN{1}"), Some("#Chan[1]"));
        assert!(m.has("#chan[1]"));
        assert_eq!(m.remove("#CHAN[1]"), Some(7));
        assert!(m.is_empty());
    }

    #[test]
    fn set_casemap_preserves_entries() {
        let mut m = NameMap::with_casemap(Casemap::Rfc1459);
        m.insert("Nick~", 1);
        m.insert("#chan", 2);
        m.set_casemap(Casemap::Ascii);
        assert_eq!(m.get("nick~"), Some(&1));
        assert_eq!(m.get("#CHAN"), Some(&2));
        // Under ascii, ^ no longer aliases ~.
        assert_eq!(m.get("nick^"), None);
    }
}
