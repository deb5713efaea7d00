//! Typed error hierarchy for the controller core.
//!
//! Programming invariants are fatal (logged, then the process aborts),
//! transient I/O is handled inline on the hot path and never surfaces as
//! an `Err`, and everything else (peer disconnect, configuration,
//! handshake rejection) is a typed value the caller can match on.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring buffer overflow: need {need} bytes, only {remaining} writable")]
    Overflow { need: usize, remaining: usize },
    #[error("ring buffer read out of bounds: asked for {len} bytes, only {available} readable")]
    OutOfBounds { len: usize, available: usize },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("frame too short: got {len} bytes, header alone needs {min}")]
    TooShort { len: usize, min: usize },
    #[error("unknown wire message type {0}")]
    UnknownType(i32),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid transition: {from:?} --{event}--> (rejected)")]
    InvalidTransition { from: &'static str, event: &'static str },
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?} as JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path:?} references node {node} which is not declared in the blueprint")]
    UnknownNode { path: PathBuf, node: u32 },
    #[error("hosts.json has no entry matching self_id {0}")]
    MissingSelfHost(u32),
    #[error("partition.json must declare at least the cut partition")]
    EmptyPartitions,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fatal syscall failure during {op}: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}
