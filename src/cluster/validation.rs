//! Validation of names that become store path segments.
//!
//! Cluster names and sequence names are embedded verbatim in store paths
//! (`<root>/clusters/<name>`, `<root>/sequences/<name>`), so they are checked
//! before any path is built.
//!
//! # Usage
//!
//! ```
//! use shardherd::cluster::{validate_cluster_name, validate_sequence_name};
//!
//! assert!(validate_cluster_name("orders").is_ok());
//! assert!(validate_sequence_name("nodes").is_ok());
//!
//! assert!(validate_cluster_name("").is_err());
//! assert!(validate_sequence_name("a/b").is_err());
//! ```
//!
//! # Validation Rules
//!
//! All names must:
//! - Not be empty
//! - Not exceed [`MAX_NAME_LENGTH`] characters
//! - Contain only ASCII alphanumeric characters, dots (`.`), underscores (`_`), and hyphens (`-`)
//! - Not be "." or ".."

use super::error::{ClusterError, ClusterResult};
use crate::constants::MAX_NAME_LENGTH;

/// Validate a cluster name.
pub fn validate_cluster_name(name: &str) -> ClusterResult<()> {
    validate_segment(name, "Cluster name")
}

/// Validate a node-id sequence name.
pub fn validate_sequence_name(name: &str) -> ClusterResult<()> {
    validate_segment(name, "Sequence name")
}

/// Validate a root path such as `/discovery`.
pub fn validate_root_path(path: &str) -> ClusterResult<()> {
    if !path.starts_with('/') {
        return Err(ClusterError::Config(format!(
            "Root path '{}' must be absolute",
            truncate_for_display(path, 50)
        )));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(ClusterError::Config(format!(
            "Root path '{}' must not end with '/'",
            truncate_for_display(path, 50)
        )));
    }
    for segment in path[1..].split('/') {
        validate_segment(segment, "Root path segment")?;
    }
    Ok(())
}

fn validate_segment(value: &str, field_name: &str) -> ClusterResult<()> {
    if value.is_empty() {
        return Err(ClusterError::Config(format!("{} cannot be empty", field_name)));
    }

    if value.len() > MAX_NAME_LENGTH {
        return Err(ClusterError::Config(format!(
            "{} '{}' is too long ({} chars, max {} chars)",
            field_name,
            truncate_for_display(value, 50),
            value.len(),
            MAX_NAME_LENGTH
        )));
    }

    if value == "." || value == ".." {
        return Err(ClusterError::Config(format!(
            "{} cannot be '.' or '..' (reserved names)",
            field_name
        )));
    }

    for (i, c) in value.chars().enumerate() {
        let is_valid = c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-';
        if !is_valid {
            return Err(ClusterError::Config(format!(
                "Invalid character '{}' (U+{:04X}) in {} at position {}. \
                 Only ASCII letters, digits, '.', '_', and '-' are allowed.",
                c.escape_default(),
                c as u32,
                field_name,
                i
            )));
        }
    }

    Ok(())
}

fn truncate_for_display(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
