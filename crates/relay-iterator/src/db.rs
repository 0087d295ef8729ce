use crate::error::{IteratorError, Result};

/// Check that `name` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
///
/// Table and column names are spliced into SQL text, so anything else is
/// rejected up front.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(IteratorError::InvalidIdentifier(name.to_string()))
    }
}

/// Quote an already-validated identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}
