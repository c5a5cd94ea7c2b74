// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

use std::fmt;

use crate::bitmap::BitmapError;
use crate::mbox::MboxError;

/// Detailed command status reported to the requester.
///
/// The numeric values are part of the device's command ABI.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum Status {
    Success = 0,
    NameExists,
    DomainUnavailable,
    LdbPortsUnavailable,
    DirPortsUnavailable,
    LdbQueuesUnavailable,
    LdbCreditsUnavailable,
    DirCreditsUnavailable,
    SequenceNumbersUnavailable,
    InvalidDomainId,
    InvalidQidInflightAllocation,
    AtomicInflightsUnavailable,
    HistListEntriesUnavailable,
    InvalidLdbQueueId,
    InvalidCqDepth,
    InvalidCqVirtAddr,
    InvalidPortId,
    InvalidQid,
    InvalidPriority,
    NoQidSlotsAvailable,
    InvalidDirQueueId,
    DirQueuesUnavailable,
    DomainNotConfigured,
    InternalError,
    DomainInUse,
    DomainNotFound,
    QueueNotFound,
    DomainStarted,
    DomainNotStarted,
    LdbPortRequiredForLdbQueues,
    DomainResetFailed,
    MboxError,
    InvalidHistListDepth,
    NoMemory,
    InvalidLockIdCompLevel,
    InvalidCosId,
}

/// Errors returned by resource manager operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The owner lacks the resources to satisfy the request
    #[error("resources unavailable: {0}")]
    Unavailable(Status),

    /// An identifier or parameter in the request is not acceptable
    #[error("invalid request: {0}")]
    Invalid(Status),

    /// A parameter was rejected for which there is no detailed status
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The target is locked against reconfiguration
    #[error("{0} is locked")]
    Permission(Locked),

    /// Bookkeeping was found in an inconsistent state
    #[error("internal error: {0}")]
    Internal(String),

    /// A VF failed to answer a mailbox request in time
    #[error("mailbox request to vf{0} timed out")]
    Timeout(u8),

    #[error("mailbox failure: {0}")]
    Mailbox(#[from] MboxError),
}

/// Something which refuses reconfiguration while it is in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locked {
    Vf(u8),
    SnGroup(u32),
}

impl fmt::Display for Locked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locked::Vf(v) => write!(f, "vf{v}"),
            Locked::SnGroup(g) => write!(f, "sequence number group {g}"),
        }
    }
}

impl Error {
    /// The detailed status surfaced to the requester, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Unavailable(st) | Error::Invalid(st) => Some(*st),
            Error::Internal(_) => Some(Status::InternalError),
            Error::Mailbox(_) => Some(Status::MboxError),
            Error::InvalidArgument(_)
            | Error::Permission(_)
            | Error::Timeout(_) => None,
        }
    }

    /// Is this rejection due to exhausted resources?
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

impl From<BitmapError> for Error {
    fn from(err: BitmapError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Status {
    /// Classify a non-success status into the error kind it is reported as.
    pub(crate) fn reject(self) -> Error {
        match self {
            Status::DomainUnavailable
            | Status::LdbPortsUnavailable
            | Status::DirPortsUnavailable
            | Status::LdbQueuesUnavailable
            | Status::LdbCreditsUnavailable
            | Status::DirCreditsUnavailable
            | Status::SequenceNumbersUnavailable
            | Status::AtomicInflightsUnavailable
            | Status::HistListEntriesUnavailable
            | Status::NoQidSlotsAvailable
            | Status::DirQueuesUnavailable
            | Status::LdbPortRequiredForLdbQueues => Error::Unavailable(self),
            _ => Error::Invalid(self),
        }
    }
}
