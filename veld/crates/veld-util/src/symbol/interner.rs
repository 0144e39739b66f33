//! String interner implementation using DashMap for concurrent access.
//!
//! The runtime interns every identifier, attribute name and string symbol a
//! program uses. Unlike a batch compiler, a runtime resolves symbols back to
//! strings on hot paths (error messages, dict keys, reflection), so the
//! table keeps a reverse index alongside the forward map instead of doing a
//! linear scan.
//!
//! # Thread Safety
//!
//! The interner is fully thread-safe (`Sync + Send`). Interpreter workers,
//! native functions and the collector thread may intern and resolve
//! concurrently without blocking each other.

use ahash::AHasher;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::LazyLock;

use super::{InternerStats, Symbol};

/// Global string table instance using DashMap for concurrent access
///
/// Initialized on first use via `LazyLock`. Well-known runtime symbols are
/// pre-interned during initialization so they have stable, predictable ids.
pub static STRING_TABLE: LazyLock<StringTable> = LazyLock::new(|| {
    let table = StringTable::new();
    table.initialize_known_symbols();
    table
});

/// Number of ids reserved for well-known runtime symbols
const RESERVED_SYMBOLS_END: u32 = 64;

/// Well-known symbols pre-interned at startup, in id order.
///
/// These cover the names the runtime itself reaches for: entry points,
/// standard attribute names on built-in shapes, and exception fields.
const KNOWN_SYMBOLS: &[&str] = &[
    "main",
    "constructor",
    "length",
    "message",
    "value",
    "name",
    "self",
    "klass",
    "push",
    "pop",
    "insert",
    "remove",
    "get",
    "set",
    "keys",
    "values",
    "spawn",
    "await",
    "yield",
    "exception",
    "stack_overflow",
    "type_error",
    "division_by_zero",
    "out_of_bounds",
    "not_found",
    "read_only",
    "too_many_arguments",
];

/// Thread-safe string table using DashMap
///
/// Holds all interned strings. The forward map is keyed by string hash for
/// O(1) interning; the reverse map is keyed by id for O(1) resolution.
///
/// # Memory Layout
///
/// Strings are allocated on the heap and leaked (intentionally) to obtain
/// `'static` lifetime references. Interned strings are never removed, and
/// the table lives for the entire process.
pub struct StringTable {
    /// Maps string hash to (string, symbol id) for fast interning
    map: DashMap<u64, (&'static str, u32)>,

    /// Maps symbol id back to its string for fast resolution
    reverse: DashMap<u32, &'static str>,

    /// Counter for the next id (atomic for lock-free increment)
    next_index: AtomicU32,

    /// Number of hash collisions encountered
    collisions: AtomicUsize,

    /// Number of cache hits (string already interned)
    hits: AtomicUsize,

    /// Number of cache misses (new string allocation)
    misses: AtomicUsize,
}

impl StringTable {
    fn new() -> Self {
        Self {
            map: DashMap::with_capacity(256),
            reverse: DashMap::with_capacity(256),
            next_index: AtomicU32::new(RESERVED_SYMBOLS_END),
            collisions: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Pre-intern the well-known runtime symbols.
    ///
    /// Called exactly once during initialization; ids are assigned in table
    /// order and stay below `RESERVED_SYMBOLS_END`.
    fn initialize_known_symbols(&self) {
        debug_assert!(KNOWN_SYMBOLS.len() <= RESERVED_SYMBOLS_END as usize);

        for (idx, symbol) in KNOWN_SYMBOLS.iter().enumerate() {
            let id = idx as u32;
            let interned: &'static str = Box::leak(symbol.to_string().into_boxed_str());
            let hash = Self::hash_string(symbol);
            self.map.insert(hash, (interned, id));
            self.reverse.insert(id, interned);
        }
    }

    /// Intern a string, returning its symbol.
    ///
    /// Thread-safe; multiple threads can intern concurrently. If the string
    /// is already interned the existing symbol is returned.
    pub fn intern(&self, string: &str) -> Symbol {
        let hash = Self::hash_string(string);

        // Fast path: string already interned
        if let Some(entry) = self.map.get(&hash) {
            if entry.value().0 == string {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Symbol {
                    index: entry.value().1,
                };
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.map.entry(hash) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                if entry.get().0 == string {
                    return Symbol {
                        index: entry.get().1,
                    };
                }
                let index = self.handle_collision(string, hash);
                Symbol { index }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let interned: &'static str = Box::leak(string.to_string().into_boxed_str());
                let idx = self.next_index.fetch_add(1, Ordering::Relaxed);
                entry.insert((interned, idx));
                self.reverse.insert(idx, interned);
                Symbol { index: idx }
            }
        }
    }

    /// Handle hash collisions by probing with modified hashes.
    ///
    /// Linear probing with a prime-based offset; bounded so a pathological
    /// hash cannot loop forever.
    fn handle_collision(&self, string: &str, original_hash: u64) -> u32 {
        const MAX_PROBES: u64 = 32;
        const PROBE_PRIME: u64 = 0x9e3779b97f4a7c15;

        for i in 1u64..=MAX_PROBES {
            let probe_hash = original_hash.wrapping_add(i.wrapping_mul(PROBE_PRIME));

            if let Some(entry) = self.map.get(&probe_hash) {
                if entry.value().0 == string {
                    return entry.value().1;
                }
            } else {
                self.collisions.fetch_add(1, Ordering::Relaxed);
                let interned: &'static str = Box::leak(string.to_string().into_boxed_str());
                let idx = self.next_index.fetch_add(1, Ordering::Relaxed);
                self.map.insert(probe_hash, (interned, idx));
                self.reverse.insert(idx, interned);
                return idx;
            }
        }

        // Probe chain exhausted. Allocate a fresh id anyway so the caller
        // still receives a unique symbol; only the forward fast path is lost.
        self.collisions.fetch_add(1, Ordering::Relaxed);
        let interned: &'static str = Box::leak(string.to_string().into_boxed_str());
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.reverse.insert(idx, interned);
        idx
    }

    /// Resolve a symbol back to its string.
    ///
    /// Unknown ids resolve to `"<unknown>"` rather than panicking; the
    /// runtime surfaces those in diagnostics only.
    pub fn resolve(&self, symbol: Symbol) -> &'static str {
        self.reverse
            .get(&symbol.index)
            .map(|entry| *entry.value())
            .unwrap_or("<unknown>")
    }

    /// Snapshot of interner statistics.
    pub fn stats(&self) -> InternerStats {
        InternerStats {
            count: self.reverse.len(),
            collisions: self.collisions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn hash_string(string: &str) -> u64 {
        let mut hasher = AHasher::default();
        string.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_symbols_have_reserved_ids() {
        let main = STRING_TABLE.intern("main");
        assert!(main.index() < RESERVED_SYMBOLS_END);
        assert_eq!(STRING_TABLE.resolve(main), "main");

        let message = STRING_TABLE.intern("message");
        assert!(message.index() < RESERVED_SYMBOLS_END);
    }

    #[test]
    fn test_dynamic_symbols_above_reserved_range() {
        let sym = STRING_TABLE.intern("definitely_not_a_keyword_xyz");
        assert!(sym.index() >= RESERVED_SYMBOLS_END);
    }

    #[test]
    fn test_unknown_id_resolution() {
        let bogus = Symbol::from_index(u32::MAX);
        assert_eq!(STRING_TABLE.resolve(bogus), "<unknown>");
    }

    #[test]
    fn test_stats_track_hits() {
        let before = STRING_TABLE.stats();
        let _ = STRING_TABLE.intern("stats_probe");
        let _ = STRING_TABLE.intern("stats_probe");
        let after = STRING_TABLE.stats();
        assert!(after.hits > before.hits);
    }
}
