//! Connection-string parsing.

use ahash::RandomState;
use std::collections::HashMap;

/// Parsed view of a semicolon-separated `key=value` connection string,
/// e.g. `host=127.0.0.1;port=3306;user=app;passwd=secret;dbname=prod;`.
///
/// A terminating semicolon is tolerated and tokens without `=` are
/// skipped. The pool itself never interprets the string; this type is a
/// convenience for connection implementations.
#[derive(Debug, Clone, Default)]
pub struct ConnStr {
    pairs: HashMap<String, String, RandomState>,
}

impl ConnStr {
    pub fn parse(input: &str) -> Self {
        let mut pairs: HashMap<String, String, RandomState> = HashMap::default();
        for token in input.split(';') {
            if token.is_empty() {
                continue;
            }
            if let Some((key, value)) = token.split_once('=') {
                pairs.insert(key.to_string(), value.to_string());
            }
        }
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
