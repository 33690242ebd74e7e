//! Definition checks run before any query touches the store
//!
//! `validate_query` is a textual allowlist/denylist check, not a SQL parser.
//! It is the single trust boundary for every statement a pool definition
//! carries, in both the SQL and unified strategies.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::unified_pool::UnifiedPoolDefinition;

/// Keywords rejected as whitespace-delimited tokens anywhere in a query.
const DENIED_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "EXEC", "EXECUTE",
];

/// Reject anything that is not a plain SELECT.
///
/// The text is upper-cased and split on whitespace; the first token must be
/// `SELECT` and no token may be a denied keyword. Keywords glued to
/// punctuation (`;DROP`) are not caught.
pub fn validate_query(sql: &str) -> Result<()> {
    let canonical = sql.to_uppercase();
    let mut tokens = canonical.split_whitespace();

    match tokens.next() {
        Some("SELECT") => {}
        Some(_) => return Err(Error::UnsafeQuery("query must start with SELECT".into())),
        None => return Err(Error::UnsafeQuery("query is empty".into())),
    }

    if let Some(keyword) = tokens.find(|token| DENIED_KEYWORDS.contains(token)) {
        return Err(Error::UnsafeQuery(format!(
            "query contains forbidden keyword {keyword}"
        )));
    }
    Ok(())
}

/// Check a unified definition, returning non-fatal warnings.
///
/// Unsafe queries and invalid policy are errors. An ID that is both
/// included and excluded, or a definition with no sources at all, only
/// produces a warning: exclusion wins at discovery time.
pub fn validate_unified(definition: &UnifiedPoolDefinition) -> Result<Vec<String>> {
    definition.config.validate()?;
    for query in &definition.queries {
        validate_query(&query.sql).map_err(|e| match e {
            Error::UnsafeQuery(reason) => Error::UnsafeQuery(format!("{}: {reason}", query.name)),
            other => other,
        })?;
    }

    let mut warnings = Vec::new();

    let excluded: HashSet<&str> = definition.exclude.iter().map(String::as_str).collect();
    let mut conflicts: Vec<&str> = definition
        .include
        .iter()
        .map(String::as_str)
        .filter(|id| excluded.contains(id))
        .collect();
    conflicts.sort_unstable();
    conflicts.dedup();
    for id in conflicts {
        warnings.push(format!(
            "account {id} is both included and excluded; exclusion wins"
        ));
    }

    if definition.queries.is_empty()
        && definition.include.is_empty()
        && definition.watched_paths.is_empty()
    {
        warnings.push("pool has no queries, includes or watched paths".to_string());
    }

    Ok(warnings)
}
