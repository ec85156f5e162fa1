//! Status codes for lookups and wire responses
//!
//! A `Status` is the outcome of a single request. Negative lookup results are
//! ordinary statuses, never errors.

use std::fmt;

/// Status code returned by lookups and carried as the first byte of every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Status {
    /// Request succeeded
    #[default]
    Ok = 0,
    /// Key was not found in the index
    NotFound = 1,
    /// Index is configured but not built for the current generation
    UnavailableIndex = 2,
    /// Table id does not exist or has no generation yet
    UnknownTable = 3,
    /// Request was malformed
    BadRequest = 4,
    /// Response payload exceeds the configured maximum
    TooLarge = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the request itself was at fault
    #[inline]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Status::BadRequest | Status::TooLarge)
    }

    /// Wire representation
    #[inline]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Parse a wire status byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::Ok),
            1 => Some(Status::NotFound),
            2 => Some(Status::UnavailableIndex),
            3 => Some(Status::UnknownTable),
            4 => Some(Status::BadRequest),
            5 => Some(Status::TooLarge),
            _ => None,
        }
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::UnavailableIndex => "UnavailableIndex",
            Status::UnknownTable => "UnknownTable",
            Status::BadRequest => "BadRequest",
            Status::TooLarge => "TooLarge",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
