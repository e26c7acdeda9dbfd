//! Centralized VM limits and configuration constants.
//!
//! All magic numbers that control runtime-memory behavior are collected
//! here for easy tuning.

// ===== Strings =====

/// Maximum length for "short" strings (hash-consed in the string table).
/// Longer strings are allocated individually and never interned.
pub const MAX_SHORT_LEN: usize = 40;

/// Initial (and minimum) size of the string table. Always a power of two.
pub const MIN_STRTAB_SIZE: usize = 64;

/// Number of rows in the static-string address cache.
pub const STRCACHE_N: usize = 53;

/// Associativity of each address-cache row (small LRU depth).
pub const STRCACHE_M: usize = 2;

/// The string hash samples at most ~2^HASH_SAMPLE_LOG bytes of its input;
/// longer strings are folded with a proportionally larger stride.
pub const HASH_SAMPLE_LOG: usize = 5;

/// Message of the permanent out-of-memory string. Interned and fixed at
/// boot so reporting an allocation failure never allocates.
pub const MEMERR_MSG: &str = "not enough memory";

// ===== Stacks =====

/// Initial stack size for new threads (in value slots).
pub const BASIC_STACK_SIZE: usize = 40;

/// Hard cap on a single thread's stack (number of slots).
pub const MAX_STACK_SIZE: usize = 1_000_000;

// ===== Type tags =====

/// Number of basic value types that can carry a per-type metatable:
/// nil, boolean, integer, number, string, table, function, userdata,
/// thread.
pub const NUM_TYPE_TAGS: usize = 9;


