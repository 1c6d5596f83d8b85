//! Error Types for Pivotlog
//!
//! This module defines the error types shared by the encoding crates.
//!
//! ## Error Categories
//!
//! ### Resource Limits
//! - `ResourceExhausted`: too many records in one chunk, or the cumulative
//!   decoded data size would overflow a u64
//!
//! ### Propagated Failures
//! - `BufferWrite`: a data buffer sink rejected a write
//! - `Compression`: the compression backend failed
//! - `DestWrite`: the final destination writer rejected a write
//!
//! ### Lifecycle
//! - `Closed`: an operation was attempted on an encoder that already failed
//!   or was closed by a successful `encode_and_close`
//!
//! ## Usage
//! All encoding operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows using the `?` operator for error
//! propagation. Any error leaves the encoder in a terminal state; only
//! `reset` brings it back.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("buffer write failed: {0}")]
    BufferWrite(String),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("writing to destination failed: {0}")]
    DestWrite(String),

    #[error("encoder is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
