use crate::error::{AppError, Result};

const MAX_REPO_ID_LEN: usize = 128;

/// A repository id must be non-empty, printable, free of path separators and
/// yield a route name containing at least one alphanumeric character.
pub fn validate_repo_id(repo_id: &str) -> Result<()> {
    let is_valid = !repo_id.is_empty()
        && repo_id.len() <= MAX_REPO_ID_LEN
        && repo_id != "."
        && repo_id != ".."
        && !repo_id
            .chars()
            .any(|c| c.is_control() || matches!(c, '/' | '\\'))
        && route_name(repo_id)
            .chars()
            .any(|c| c.is_ascii_alphanumeric());

    if !is_valid {
        return Err(AppError::invalid_repository_id(repo_id));
    }
    Ok(())
}

/// Deterministic path segment for a repository: lower-cased, every character
/// outside `[a-z0-9-_]` replaced with `-`.
pub fn route_name(repo_id: &str) -> String {
    repo_id
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn is_route_safe(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
