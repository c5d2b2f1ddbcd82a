//! # ripple-core
//!
//! Core types for the ripple event loop.
//!
//! This crate carries the pieces shared between the runtime, the helper
//! threads and external consumers: the error taxonomy, handle kind and
//! flag definitions, the IPC wire framing, and the log macros. It has no
//! runtime state of its own.
//!
//! ## Modules
//!
//! - `error` - Closed error-code taxonomy and errno translation
//! - `handle` - Handle kinds and lifecycle flag bits
//! - `frame` - IPC frame header codec (RAW_DATA / STREAM)
//! - `log` - Kernel-style log macros (rerror!/rwarn!/rinfo!/rdebug!/rtrace!)

#![allow(dead_code)]

pub mod error;
pub mod frame;
pub mod handle;
pub mod log;

// Re-exports for convenience
pub use error::{code_from_errno, Code, Error, Result};
pub use frame::{Frame, FRAME_HEADER_LEN, OP_RAW_DATA, OP_STREAM};
pub use handle::{HandleFlags, HandleKind};

/// Runtime constants
pub mod constants {
    /// How long a shut-down pipe waits for the peer to close before the
    /// read side is forced to EOF, in milliseconds.
    pub const PIPE_EOF_TIMEOUT_MS: u64 = 50;

    /// How long a pipe connect retries while every server instance is
    /// busy, in milliseconds.
    pub const PIPE_CONNECT_WAIT_MS: u64 = 30_000;

    /// Worker threads in the filesystem pool.
    pub const FS_POOL_THREADS: usize = 4;

    /// Default listen/accept backlog.
    pub const DEFAULT_BACKLOG: i32 = 128;
}
