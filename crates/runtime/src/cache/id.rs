use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_error::Result;

use crate::types::Value;

/// Who may share a cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeKey {
    /// Private to one session.
    Connection { session_id: u64 },
    /// Shared by every session on the same virtual database version.
    Schema { vdb: String, version: String },
}

/// Canonical form of a query text: runs of whitespace outside quoted
/// literals collapse to one space and the ends are trimmed.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

/// Fingerprint of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(String);

impl CacheId {
    pub fn compute(sql: &str, params: &[Value], scope: &ScopeKey) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(normalize_sql(sql).as_bytes());
        hasher.update([0u8]);
        hasher.update(bincode::serialize(params)?);
        hasher.update([0u8]);
        hasher.update(bincode::serialize(scope)?);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to tell entries apart in logs
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ScopeKey {
        ScopeKey::Schema {
            vdb: "sales".into(),
            version: "1".into(),
        }
    }

    #[test]
    fn test_normalize_collapses_whitespace_outside_literals() {
        assert_eq!(
            normalize_sql("  SELECT  a,\n\tb FROM t  WHERE s = 'x   y' "),
            "SELECT a, b FROM t WHERE s = 'x   y'"
        );
        assert_eq!(normalize_sql("select \"a  b\"   from t"), "select \"a  b\" from t");
    }

    #[test]
    fn test_equal_requests_produce_equal_ids() {
        let a = CacheId::compute("SELECT 1", &[Value::Int64(1)], &scope()).unwrap();
        let b = CacheId::compute("  SELECT   1 ", &[Value::Int64(1)], &scope()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_params_and_scope_change_id() {
        let base = CacheId::compute("SELECT ?", &[Value::Int64(1)], &scope()).unwrap();
        let other_param = CacheId::compute("SELECT ?", &[Value::Int64(2)], &scope()).unwrap();
        let other_scope = CacheId::compute(
            "SELECT ?",
            &[Value::Int64(1)],
            &ScopeKey::Connection { session_id: 7 },
        )
        .unwrap();
        assert_ne!(base, other_param);
        assert_ne!(base, other_scope);
    }

    #[test]
    fn test_literal_whitespace_is_significant() {
        let a = CacheId::compute("SELECT 'a b'", &[], &scope()).unwrap();
        let b = CacheId::compute("SELECT 'a  b'", &[], &scope()).unwrap();
        assert_ne!(a, b);
    }
}
