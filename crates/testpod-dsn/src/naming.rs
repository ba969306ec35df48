//! Logical database names derived from test names.

use sha2::{Digest, Sha256};

/// Longest identifier accepted by both PostgreSQL and MySQL.
pub const MAX_NAME_LEN: usize = 63;

const TRUNCATED_LEN: usize = 54;
const HASH_CHARS: usize = 8;
const FALLBACK_NAME: &str = "testdb";

/// Turns an arbitrary string (usually a test name) into a safe database name.
///
/// The result is lowercase, contains only `[a-z0-9_]`, never starts with a
/// digit, and is at most [`MAX_NAME_LEN`] characters. Long inputs keep a
/// hash suffix so distinct tests stay distinct.
#[must_use]
pub fn database_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    if name.len() > MAX_NAME_LEN {
        let digest = Sha256::digest(raw.as_bytes());
        let hash: String = digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
            .chars()
            .take(HASH_CHARS)
            .collect();
        name.truncate(TRUNCATED_LEN);
        name.push('_');
        name.push_str(&hash);
    }
    name
}
