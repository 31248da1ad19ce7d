//! Global string interning for KTC.
//!
//! Opcodes and axis names recur constantly across a computation graph, so
//! they are interned once and passed around as copyable [`Symbol`] handles.
//! Interned strings live for the remainder of the process; equality and
//! hashing on `Symbol` are integer operations.

#![warn(missing_docs)]

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

/// An interned string handle.
///
/// Two symbols compare equal iff they were interned from equal strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

struct Interner {
    names: FxHashMap<&'static str, Symbol>,
    strings: Vec<&'static str>,
}

impl Interner {
    fn intern(&mut self, s: &str) -> Symbol {
        if let Some(&sym) = self.names.get(s) {
            return sym;
        }
        let sym = Symbol(self.strings.len() as u32);
        // Interned strings are never freed; the leak is bounded by the set
        // of distinct names in the process.
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        self.names.insert(leaked, sym);
        self.strings.push(leaked);
        sym
    }
}

fn interner() -> &'static RwLock<Interner> {
    static INTERNER: OnceLock<RwLock<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| {
        RwLock::new(Interner {
            names: FxHashMap::default(),
            strings: Vec::new(),
        })
    })
}

impl Symbol {
    /// Interns a string, returning its handle.
    pub fn intern(s: &str) -> Self {
        // Fast path: already interned, read lock only.
        if let Some(&sym) = interner().read().names.get(s) {
            return sym;
        }
        interner().write().intern(s)
    }

    /// Returns the interned string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        interner().read().strings[self.0 as usize]
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::intern(s)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::intern(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let a = Symbol::intern("add");
        let b = Symbol::intern("add");
        let c = Symbol::intern("mul");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "add");
    }

    #[test]
    fn test_intern_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| Symbol::intern("shared")))
            .collect();
        let syms: Vec<Symbol> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(syms.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_display() {
        let s = Symbol::intern("batch");
        assert_eq!(format!("{s}"), "batch");
    }
}
