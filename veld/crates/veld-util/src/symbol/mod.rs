//! Symbol module - String interning for the Veld runtime.
//!
//! This module provides the [`Symbol`] type, a compact (4-byte) handle to an
//! interned string. The runtime embeds symbol ids directly into its tagged
//! value words, so a symbol must stay a plain `u32` with a stable mapping
//! for the lifetime of the process.
//!
//! # Overview
//!
//! - **Memory efficiency**: each unique string is stored only once
//! - **Fast comparison**: symbol comparison is O(1) via index comparison
//! - **Thread safety**: safe to use across worker threads and the collector
//! - **Stable handles**: symbols remain valid for the program lifetime
//!
//! # Thread Safety
//!
//! The symbol interner is fully thread-safe (`Sync + Send`). Interpreter
//! workers and native functions can intern strings concurrently without
//! blocking each other, thanks to DashMap's sharded design.
//!
//! # Memory Model
//!
//! Interned strings are allocated on the heap with `'static` lifetime and
//! never deallocated. The total usage is bounded by the set of distinct
//! identifiers a program touches, which is acceptable for a runtime that
//! owns the whole process.
//!
//! # Examples
//!
//! ```
//! use veld_util::symbol::Symbol;
//!
//! let s1 = Symbol::intern("counter");
//! let s2 = Symbol::intern("counter");
//! let s3 = Symbol::intern("other");
//!
//! assert_eq!(s1, s2);
//! assert_ne!(s1, s3);
//! assert_eq!(s1.as_str(), "counter");
//! ```

mod interner;

pub use interner::STRING_TABLE;

/// Statistics about the string interner for profiling
///
/// # Fields
///
/// * `count` - Number of unique interned strings
/// * `collisions` - Number of hash collisions encountered
/// * `hits` - Number of times an already-interned string was requested
/// * `misses` - Number of times a new string was allocated
#[derive(Clone, Copy, Debug, Default)]
pub struct InternerStats {
    /// Number of interned strings
    pub count: usize,
    /// Number of hash collisions encountered
    pub collisions: usize,
    /// Number of cache hits (string already interned)
    pub hits: usize,
    /// Number of cache misses (new string allocation)
    pub misses: usize,
}

impl InternerStats {
    /// Calculate the hit rate (hits / (hits + misses))
    ///
    /// Returns 0.0 if no lookups have been performed.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A 4-byte handle to an interned string.
///
/// Two symbols are equal iff they were interned from equal strings. The
/// inner index is public to the workspace through [`Symbol::index`] /
/// [`Symbol::from_index`] so the runtime can pack it into value words and
/// unpack it again without a table lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    pub(crate) index: u32,
}

impl Symbol {
    /// Intern a string, returning its symbol.
    #[inline]
    pub fn intern(string: &str) -> Symbol {
        STRING_TABLE.intern(string)
    }

    /// The raw 32-bit id of this symbol.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Rebuild a symbol from a raw id previously obtained via
    /// [`Symbol::index`].
    ///
    /// The id must have been produced by this process's interner; an
    /// arbitrary id resolves to `"<unknown>"`.
    #[inline]
    pub const fn from_index(index: u32) -> Symbol {
        Symbol { index }
    }

    /// Resolve the symbol back to its string.
    #[inline]
    pub fn as_str(self) -> &'static str {
        STRING_TABLE.resolve(self)
    }

    /// Interner statistics snapshot.
    pub fn stats() -> InternerStats {
        STRING_TABLE.stats()
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({}, {:?})", self.index, self.as_str())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_string_same_symbol() {
        let a = Symbol::intern("spawn");
        let b = Symbol::intern("spawn");
        assert_eq!(a, b);
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn test_distinct_strings_distinct_symbols() {
        let a = Symbol::intern("alpha_sym");
        let b = Symbol::intern("beta_sym");
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_round_trip() {
        let a = Symbol::intern("round_trip_check");
        assert_eq!(a.as_str(), "round_trip_check");
        assert_eq!(Symbol::from_index(a.index()), a);
    }

    #[test]
    fn test_empty_string() {
        let a = Symbol::intern("");
        assert_eq!(a.as_str(), "");
        assert_eq!(Symbol::intern(""), a);
    }

    #[test]
    fn test_concurrent_interning() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let shared = Symbol::intern("shared_between_threads");
                    let own = Symbol::intern(&format!("thread_{}", i));
                    (shared, own)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first_shared = results[0].0;
        for (shared, _) in &results {
            assert_eq!(*shared, first_shared);
        }

        let own: std::collections::HashSet<_> =
            results.iter().map(|(_, own)| own.index()).collect();
        assert_eq!(own.len(), 8);
    }
}
