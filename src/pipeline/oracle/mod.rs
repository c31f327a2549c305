//! Extraction oracle boundary.
//!
//! The oracle is an external inference service that reads raw clinical text
//! and proposes chart changes. Everything it returns is untrusted: responses
//! are sanitized, parsed leniently, and validated into `ProposedChange`
//! before the consolidation engine sees them. Records that fail validation
//! are quarantined, never passed on.

pub mod client;
pub mod ollama;
pub mod parser;
pub mod prompt;
pub mod sanitize;
pub mod types;

pub use client::LlmExtractionOracle;
pub use ollama::{MockLlmClient, OllamaClient};
pub use parser::{parse_proposals, ParseOptions};
pub use types::*;

use thiserror::Error;

/// Oracle call failed as a whole. Fatal to the batch, safe to retry.
#[derive(Error, Debug)]
pub enum ExtractionFailure {
    #[error("Oracle service is not reachable at {0}")]
    Connection(String),

    #[error("Oracle request timed out after {0}s")]
    Timeout(u64),

    #[error("Oracle returned error (status {status}): {body}")]
    Service { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed oracle response: {0}")]
    MalformedResponse(String),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),
}
