// User identifier parsing
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("user id is empty")]
    Empty,

    #[error("invalid user id '{0}': expected a positive integer")]
    Invalid(String),
}

/// Parses a user id as it arrives from a path segment.
///
/// Ids are generated by storage starting at 1, so zero and negative
/// values are rejected along with anything non-numeric.
pub fn parse_user_id(raw: &str) -> Result<i64, IdError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdError::Empty);
    }
    match trimmed.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(IdError::Invalid(trimmed.to_string())),
    }
}
