//! # Backend Credentials
//!
//! Loads the API token used to authenticate the streaming connection to the
//! recognition backend. Token material lives on the filesystem; the path comes
//! from configuration and accepts an optional `file:` prefix for parity with
//! deployment configs that spell paths as URIs.

use crate::error::AppError;
use std::fs;

/// Read and sanity-check the backend API token from `path`.
///
/// A blank path, an unreadable file or an empty token all fail with
/// `CredentialsUnavailable` — session creation must abort before any backend
/// stream is opened.
pub fn load_api_token(path: &str) -> Result<String, AppError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(AppError::CredentialsUnavailable(
            "Credentials path is empty".to_string(),
        ));
    }

    let file_path = trimmed.strip_prefix("file:").unwrap_or(trimmed);

    let token = fs::read_to_string(file_path).map_err(|e| {
        AppError::CredentialsUnavailable(format!(
            "Failed to read credentials from {}: {}",
            file_path, e
        ))
    })?;

    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::CredentialsUnavailable(format!(
            "Credentials file {} is empty",
            file_path
        )));
    }

    Ok(token.to_string())
}
