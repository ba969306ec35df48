//! Container names and identity labels.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use testpod_common::constants::MAX_LABEL_VALUE_LEN;
use uuid::Uuid;

const NAME_TEST_PART_LEN: usize = 40;

/// Makes `value` acceptable as a label value.
#[must_use]
pub fn sanitize_label_value(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' => '_',
            ':' => '-',
            other => other,
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect()
}

/// Unique container name: `<prefix>-<test>-<8 hex chars>`.
#[must_use]
pub fn container_name(prefix: &str, test: &str) -> String {
    let mut part: String = test
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(NAME_TEST_PART_LEN)
        .collect();
    if part.is_empty() {
        part.push_str("test");
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{part}-{}", &suffix[..8])
}

/// Labels identifying a container's owner, for cleanup and debugging.
#[must_use]
pub fn identity_labels(
    prefix: &str,
    test: &str,
    image: &str,
    created: DateTime<Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (prefix.to_string(), "true".to_string()),
        (format!("{prefix}.test"), sanitize_label_value(test)),
        (format!("{prefix}.image"), sanitize_label_value(image)),
        (
            format!("{prefix}.timestamp"),
            sanitize_label_value(&created.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ),
    ])
}
