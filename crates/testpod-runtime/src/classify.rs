//! Classification of runtime output text.
//!
//! Container CLIs report most conditions only as prose on stderr. All
//! substring matching against that prose lives here so the rest of the
//! workspace works with [`OutputClass`] values instead of raw text.

use testpod_common::error::TestpodError;

/// What a piece of runtime or in-container output indicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClass {
    /// The container does not exist (never did, or already removed).
    NotFound,
    /// The container exists but is stopped, dead, or being removed.
    NotRunning,
    /// A resource the command tried to create already exists.
    AlreadyExists,
    /// Nothing recognizable; treat as a generic failure.
    Other,
}

const NOT_FOUND_PATTERNS: [&str; 4] = [
    "no such container",
    "no container with name or id",
    "no such object",
    "not found: container",
];

const NOT_RUNNING_PATTERNS: [&str; 5] = [
    "is not running",
    "dead or marked for removal",
    "removal of container",
    "is already in progress",
    "container state improper",
];

const ALREADY_EXISTS_PATTERNS: [&str; 2] = ["already exists", "database exists"];

/// Classifies runtime or in-container output.
#[must_use]
pub fn classify(output: &str) -> OutputClass {
    let lower = output.to_ascii_lowercase();
    if NOT_FOUND_PATTERNS.iter().any(|p| lower.contains(p)) {
        OutputClass::NotFound
    } else if NOT_RUNNING_PATTERNS.iter().any(|p| lower.contains(p)) {
        OutputClass::NotRunning
    } else if ALREADY_EXISTS_PATTERNS.iter().any(|p| lower.contains(p)) {
        OutputClass::AlreadyExists
    } else {
        OutputClass::Other
    }
}

/// Converts a failed runtime command into a classified error.
#[must_use]
pub fn command_error(command: &str, id: &str, output: &str) -> TestpodError {
    match classify(output) {
        OutputClass::NotFound => TestpodError::NotFound {
            kind: "container",
            id: id.to_string(),
        },
        OutputClass::NotRunning => TestpodError::NotRunning { id: id.to_string() },
        OutputClass::AlreadyExists | OutputClass::Other => TestpodError::Command {
            command: command.to_string(),
            message: output.trim().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_missing_container() {
        let out = "Error response from daemon: No such container: 4f1c2a";
        assert_eq!(classify(out), OutputClass::NotFound);
    }

    #[test]
    fn podman_missing_container() {
        let out = "Error: no container with name or ID \"abc\" found: no such container";
        assert_eq!(classify(out), OutputClass::NotFound);
    }

    #[test]
    fn inspect_missing_object() {
        assert_eq!(classify("Error: No such object: abc"), OutputClass::NotFound);
    }

    #[test]
    fn stopped_container() {
        let out = "Error response from daemon: container 4f1c is not running";
        assert_eq!(classify(out), OutputClass::NotRunning);
        let out = "Error response from daemon: container is dead or marked for removal";
        assert_eq!(classify(out), OutputClass::NotRunning);
        let out = "Error: removal of container abc is already in progress";
        assert_eq!(classify(out), OutputClass::NotRunning);
    }

    #[test]
    fn existing_databases() {
        let pg = "createdb: error: database creation failed: ERROR:  database \"x\" already exists";
        assert_eq!(classify(pg), OutputClass::AlreadyExists);
        let my = "ERROR 1007 (HY000): Can't create database 'x'; database exists";
        assert_eq!(classify(my), OutputClass::AlreadyExists);
    }

    #[test]
    fn unrelated_output_is_other() {
        assert_eq!(classify("permission denied"), OutputClass::Other);
        assert_eq!(classify(""), OutputClass::Other);
    }

    #[test]
    fn command_error_maps_classes() {
        assert!(command_error("rm", "abc", "No such container: abc").is_not_found());
        assert!(matches!(
            command_error("exec", "abc", "container abc is not running"),
            TestpodError::NotRunning { .. }
        ));
        assert!(matches!(
            command_error("start", "abc", "boom"),
            TestpodError::Command { .. }
        ));
    }
}
