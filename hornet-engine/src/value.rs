//! Minimal typed value and row model moved between executors and the engine.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// One typed field inside a row or a parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    BigInt(i64),
    /// UTF-8 string.
    Varchar(String),
    /// Raw bytes.
    Varbinary(Vec<u8>),
}

/// Input parameters for one statement invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParameterSet {
    /// Positional parameter values.
    pub values: Vec<Value>,
}

impl ParameterSet {
    /// Creates a parameter set from positional values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Stable hash used as the prefetch-cache key component.
    #[must_use]
    pub fn param_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// An ordered collection of rows produced by one fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    /// Row-major data.
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Creates an empty row set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a one-row, one-column integer result, the shape most write
    /// fragments report their modified-tuple count in.
    #[must_use]
    pub fn single_bigint(value: i64) -> Self {
        Self {
            rows: vec![vec![Value::BigInt(value)]],
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
