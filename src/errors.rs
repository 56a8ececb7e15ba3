/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Error type shared by every stream operation.
//!
//! Every fallible operation in this crate returns a [`StreamError`]. Variants carry the structured context
//! (stream id, miniblock numbers and hashes, counts) needed to diagnose a failure without re-deriving state.
//! Callers that only need to classify an error should use [`StreamError::code`].

use std::fmt::{self, Display, Formatter};

use crate::storage::pluggables::KVGetError;
use crate::types::data_types::{Address, CryptoHash, MiniblockRef, StreamId};

/// Flat classification of a [`StreamError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DuplicateEvent,
    BadPrevMiniblockHash,
    MiniblockTooNew,
    MiniblockTooOld,
    BadBlock,
    BadEvent,
    BadEventHash,
    BadEventSignature,
    QuorumFailed,
    StreamReconciliationRequired,
    Unavailable,
    DownstreamNetworkError,
    NotFound,
    AlreadyExists,
    DataLoss,
    InvalidArgument,
    ResourceExhausted,
    DeadlineExceeded,
    Canceled,
    Internal,
    Storage,
}

#[derive(Debug)]
pub enum StreamError {
    /// The event is already in the minipool or in a recent miniblock.
    DuplicateEvent {
        stream_id: StreamId,
        event: CryptoHash,
    },

    /// The event or request references a miniblock that is unknown, too old, or not recent enough.
    BadPrevMiniblockHash {
        stream_id: StreamId,
        requested_hash: CryptoHash,
        requested_num: Option<i64>,
        last: MiniblockRef,
        reason: String,
    },

    /// The referenced miniblock is ahead of the last miniblock known locally.
    MiniblockTooNew {
        stream_id: StreamId,
        requested: i64,
        local: i64,
    },

    /// The referenced miniblock is behind the current generation.
    MiniblockTooOld {
        stream_id: StreamId,
        requested: i64,
        local: i64,
    },

    BadBlock {
        reason: String,
    },

    BadEvent {
        reason: String,
    },

    BadEventHash {
        expected: CryptoHash,
        actual: CryptoHash,
    },

    BadEventSignature {
        event: CryptoHash,
        reason: String,
    },

    /// Not enough tasks of a quorum fan-out succeeded. Carries every task error.
    QuorumFailed {
        name: String,
        needed: usize,
        succeeded: usize,
        total: usize,
        errors: Vec<StreamError>,
    },

    /// The operation cannot be completed locally and the stream must be reconciled from peers.
    StreamReconciliationRequired {
        stream_id: StreamId,
        reason: String,
    },

    /// Every peer failed. Carries the per-peer errors.
    Unavailable {
        reason: String,
        errors: Vec<StreamError>,
    },

    DownstreamNetworkError {
        node: Address,
        reason: String,
    },

    NotFound {
        what: String,
    },

    AlreadyExists {
        what: String,
    },

    DataLoss {
        reason: String,
    },

    InvalidArgument {
        reason: String,
    },

    ResourceExhausted {
        reason: String,
    },

    DeadlineExceeded,

    Canceled,

    Internal {
        reason: String,
    },

    Storage(KVGetError),
}

impl StreamError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::DuplicateEvent { .. } => ErrorCode::DuplicateEvent,
            StreamError::BadPrevMiniblockHash { .. } => ErrorCode::BadPrevMiniblockHash,
            StreamError::MiniblockTooNew { .. } => ErrorCode::MiniblockTooNew,
            StreamError::MiniblockTooOld { .. } => ErrorCode::MiniblockTooOld,
            StreamError::BadBlock { .. } => ErrorCode::BadBlock,
            StreamError::BadEvent { .. } => ErrorCode::BadEvent,
            StreamError::BadEventHash { .. } => ErrorCode::BadEventHash,
            StreamError::BadEventSignature { .. } => ErrorCode::BadEventSignature,
            StreamError::QuorumFailed { .. } => ErrorCode::QuorumFailed,
            StreamError::StreamReconciliationRequired { .. } => ErrorCode::StreamReconciliationRequired,
            StreamError::Unavailable { .. } => ErrorCode::Unavailable,
            StreamError::DownstreamNetworkError { .. } => ErrorCode::DownstreamNetworkError,
            StreamError::NotFound { .. } => ErrorCode::NotFound,
            StreamError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            StreamError::DataLoss { .. } => ErrorCode::DataLoss,
            StreamError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            StreamError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            StreamError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            StreamError::Canceled => ErrorCode::Canceled,
            StreamError::Internal { .. } => ErrorCode::Internal,
            StreamError::Storage(_) => ErrorCode::Storage,
        }
    }

    /// Transient peer or network failures that are worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), ErrorCode::Unavailable | ErrorCode::DownstreamNetworkError)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.code() == ErrorCode::AlreadyExists
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.code(), ErrorCode::Canceled | ErrorCode::DeadlineExceeded)
    }

    /// True if this error, or any error it aggregates, has the given code.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        if self.code() == code {
            return true;
        }
        match self {
            StreamError::QuorumFailed { errors, .. } | StreamError::Unavailable { errors, .. } => {
                errors.iter().any(|err| err.has_code(code))
            }
            _ => false,
        }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> StreamError {
        StreamError::Internal { reason: reason.into() }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> StreamError {
        StreamError::NotFound { what: what.into() }
    }

    pub(crate) fn bad_block(reason: impl Into<String>) -> StreamError {
        StreamError::BadBlock { reason: reason.into() }
    }

    pub(crate) fn bad_event(reason: impl Into<String>) -> StreamError {
        StreamError::BadEvent { reason: reason.into() }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> StreamError {
        StreamError::InvalidArgument { reason: reason.into() }
    }
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::DuplicateEvent { stream_id, event } => {
                write!(f, "Duplicate event {} in stream {}", event, stream_id)
            }
            StreamError::BadPrevMiniblockHash { stream_id, requested_hash, requested_num, last, reason } => write!(
                f,
                "Bad prev miniblock hash {} (num {:?}) in stream {}, last miniblock {}: {}",
                requested_hash, requested_num, stream_id, last, reason
            ),
            StreamError::MiniblockTooNew { stream_id, requested, local } => write!(
                f,
                "Miniblock {} is too new for stream {}, last local miniblock is {}",
                requested, stream_id, local
            ),
            StreamError::MiniblockTooOld { stream_id, requested, local } => write!(
                f,
                "Miniblock {} is too old for stream {}, current generation is {}",
                requested, stream_id, local
            ),
            StreamError::BadBlock { reason } => write!(f, "Bad block: {}", reason),
            StreamError::BadEvent { reason } => write!(f, "Bad event: {}", reason),
            StreamError::BadEventHash { expected, actual } => {
                write!(f, "Bad event hash, expected {} but computed {}", expected, actual)
            }
            StreamError::BadEventSignature { event, reason } => {
                write!(f, "Bad signature on event {}: {}", event, reason)
            }
            StreamError::QuorumFailed { name, needed, succeeded, total, errors } => {
                write!(f, "Quorum failed for {}: {} of {} succeeded, {} needed", name, succeeded, total, needed)?;
                for err in errors {
                    write!(f, "; {}", err)?;
                }
                Ok(())
            }
            StreamError::StreamReconciliationRequired { stream_id, reason } => {
                write!(f, "Stream {} requires reconciliation: {}", stream_id, reason)
            }
            StreamError::Unavailable { reason, errors } => {
                write!(f, "Unavailable: {}", reason)?;
                for err in errors {
                    write!(f, "; {}", err)?;
                }
                Ok(())
            }
            StreamError::DownstreamNetworkError { node, reason } => {
                write!(f, "Network error talking to {}: {}", node, reason)
            }
            StreamError::NotFound { what } => write!(f, "Not found: {}", what),
            StreamError::AlreadyExists { what } => write!(f, "Already exists: {}", what),
            StreamError::DataLoss { reason } => write!(f, "Data loss: {}", reason),
            StreamError::InvalidArgument { reason } => write!(f, "Invalid argument: {}", reason),
            StreamError::ResourceExhausted { reason } => write!(f, "Resource exhausted: {}", reason),
            StreamError::DeadlineExceeded => write!(f, "Deadline exceeded"),
            StreamError::Canceled => write!(f, "Canceled"),
            StreamError::Internal { reason } => write!(f, "Internal error: {}", reason),
            StreamError::Storage(err) => write!(f, "Storage error: {:?}", err),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<KVGetError> for StreamError {
    fn from(value: KVGetError) -> Self {
        StreamError::Storage(value)
    }
}
