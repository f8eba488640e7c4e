//! APIC client errors

use thiserror::Error;

/// Errors that can occur when interacting with the APIC REST API
#[derive(Debug, Error)]
pub enum ApicError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// APIC returned an error object in `imdata`
    #[error("APIC API error {code}: {text}")]
    Api {
        /// APIC error code (e.g. "103", "400")
        code: String,
        /// Human readable error text
        text: String,
    },

    /// Non-success HTTP status without a decodable APIC error body
    #[error("Unexpected APIC response: {status} - {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Raw response body
        body: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Login rejected or signature refused
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Private key could not be parsed or used for signing
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Managed object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g. missing required configuration)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApicError {
    /// True when APIC reports that the queried parent object is absent
    ///
    /// Class queries scoped under a DN that does not exist fail with
    /// "... may not exists" rather than returning an empty list.
    #[must_use]
    pub fn is_missing_parent(&self) -> bool {
        self.to_string().contains("may not exists")
    }
}
