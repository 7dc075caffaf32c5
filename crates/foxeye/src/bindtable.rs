//! Bindtables: named registries of `(pattern, userflags, callback)` rows.
//!
//! Protocol modules register callbacks here at runtime; the core consults a
//! table by key and user flags to route work (connchain filter growth,
//! login, password checks, transfer-completion hooks). Patterns use the
//! same scored wildcard matcher as interface names; rows are checked in
//! registration order.

use std::sync::Mutex;

use crate::peer::UserFlag;
use crate::util::glob;

/// One registered row.
#[derive(Clone)]
pub struct Binding<F: Clone> {
    pub pattern: String,
    /// User flags that admit this binding; empty admits everyone.
    pub flags: UserFlag,
    pub func: F,
}

/// A registry of bindings sharing one callback type.
pub struct BindTable<F: Clone> {
    name: &'static str,
    rows: Mutex<Vec<Binding<F>>>,
}

impl<F: Clone> BindTable<F> {
    pub fn new(name: &'static str) -> Self {
        BindTable { name, rows: Mutex::new(Vec::new()) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, pattern: &str, flags: UserFlag, func: F) {
        self.rows
            .lock()
            .unwrap()
            .push(Binding { pattern: pattern.to_owned(), flags, func });
    }

    /// Drop every row with the given pattern.
    pub fn remove(&self, pattern: &str) {
        self.rows.lock().unwrap().retain(|b| b.pattern != pattern);
    }

    /// All bindings whose pattern matches `key` and whose flags admit `uf`,
    /// in registration order. Clones the rows so no lock is held while the
    /// caller runs them.
    pub fn lookup(&self, key: &str, uf: UserFlag) -> Vec<Binding<F>> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|b| glob::match_score(&b.pattern, key).is_some())
            .filter(|b| b.flags.is_empty() || uf.admits(b.flags))
            .cloned()
            .collect()
    }

    /// First admitted binding for `key`.
    pub fn first(&self, key: &str, uf: UserFlag) -> Option<Binding<F>> {
        self.lookup(key, uf).into_iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_pattern() {
        let t: BindTable<u32> = BindTable::new("test");
        t.add("x", UserFlag::empty(), 1);
        t.add("y", UserFlag::empty(), 2);
        let got = t.lookup("x", UserFlag::empty());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].func, 1);
    }

    #[test]
    fn test_flag_admission() {
        let t: BindTable<u32> = BindTable::new("test");
        t.add("*", UserFlag::OWNER, 1);
        t.add("*", UserFlag::empty(), 2);
        let anon = t.lookup("key", UserFlag::empty());
        assert_eq!(anon.iter().map(|b| b.func).collect::<Vec<_>>(), [2]);
        let owner = t.lookup("key", UserFlag::OWNER);
        assert_eq!(owner.iter().map(|b| b.func).collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn test_remove() {
        let t: BindTable<u32> = BindTable::new("test");
        t.add("x", UserFlag::empty(), 1);
        t.remove("x");
        assert!(t.is_empty());
    }
}
