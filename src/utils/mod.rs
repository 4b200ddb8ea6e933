//! Cross-cutting helpers: structured logging setup and token sanitization.
//!
//! Retry-hint parsing lives in the top-level `retry` module, generalized to
//! also cover the OAuth refresh and SSE retry paths.

pub mod logging;
