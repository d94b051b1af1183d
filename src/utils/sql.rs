// SQL identifier handling and statement rewriting for index builds.
//
// Every identifier that reaches a DDL statement goes through validation and
// quoting here. Index definitions are never interpolated from user input
// without passing the rewrite below.

use regex::Regex;

use crate::error::{CreationFailure, CuratorError, Result};

/// PostgreSQL truncates identifiers beyond NAMEDATALEN-1 bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that a name is a safe PostgreSQL identifier (unquoted form).
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return false;
    }
    let identifier_regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap();
    identifier_regex.is_match(name)
}

/// Quote an identifier for interpolation into DDL, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualify and quote a relation name.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Split an optionally schema-qualified name into (schema, name).
/// Bare names resolve to the `public` schema.
pub fn split_qualified(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((schema, rest)) => (schema.to_string(), rest.to_string()),
        None => ("public".to_string(), name.to_string()),
    }
}

/// Derive a session advisory lock key from a resource name.
///
/// Folds the md5 digest of the name down to its first 8 bytes so concurrent
/// engine instances pointed at the same database contend on the same key.
pub fn advisory_lock_key(resource: &str) -> i64 {
    let digest = md5::compute(resource.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    i64::from_be_bytes(prefix)
}

/// Rewrite a `CREATE INDEX` template into its non-blocking canonical form:
/// `CREATE [UNIQUE] INDEX CONCURRENTLY IF NOT EXISTS <rest>`.
///
/// Rejects statements that are not index creations or that do not name
/// `index_name` as the index being created.
pub fn rewrite_create_index_concurrently(sql: &str, index_name: &str) -> Result<String> {
    let create_regex = Regex::new(
        r"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?(.+)$",
    )
    .unwrap();

    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let captures = create_regex.captures(trimmed).ok_or_else(|| invalid(
        index_name,
        "statement is not a CREATE INDEX",
    ))?;

    let unique = if captures.get(1).is_some() { "UNIQUE " } else { "" };
    let rest = captures
        .get(2)
        .map(|m| m.as_str().trim())
        .unwrap_or_default();

    if !names_index(rest, index_name) {
        return Err(invalid(
            index_name,
            "statement does not create the requested index",
        ));
    }

    let on_regex = Regex::new(r"(?i)\bON\b").unwrap();
    if !on_regex.is_match(rest) {
        return Err(invalid(index_name, "statement has no ON <table> clause"));
    }

    Ok(format!(
        "CREATE {}INDEX CONCURRENTLY IF NOT EXISTS {}",
        unique,
        collapse_newlines(rest)
    ))
}

/// True when the body of a CREATE INDEX starts with the expected index name,
/// quoted or not. Unquoted names compare case-insensitively since the server
/// folds them to lowercase.
fn names_index(rest: &str, index_name: &str) -> bool {
    let leading = match rest.strip_prefix('"') {
        Some(quoted) => match quoted.split_once('"') {
            Some((name, _)) => return name == index_name,
            None => return false,
        },
        None => rest,
    };
    let token: String = leading
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '(')
        .collect();
    token.eq_ignore_ascii_case(index_name)
}

fn collapse_newlines(sql: &str) -> String {
    let parts: Vec<&str> = sql.split_whitespace().collect();
    parts.join(" ")
}

fn invalid(index_name: &str, detail: &str) -> CuratorError {
    CuratorError::IndexCreation {
        index_name: index_name.to_string(),
        cause: CreationFailure::InvalidDefinition,
        detail: detail.to_string(),
    }
}
