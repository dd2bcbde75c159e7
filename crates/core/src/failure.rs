//! Failure taxonomy shared by the delivery client and the retry scheduler.

use core::fmt;

use serde::{Deserialize, Serialize};

/// How a failed delivery should be treated by whoever owns the record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Will never succeed on a later attempt (client-side 4xx, bad payload).
    Terminal,
    /// Network errors, timeouts, 5xx, 429, rejected tokens.
    Transient,
    /// The call was not attempted: circuit open or rate limited.
    CapacityRejected,
}

impl FailureClass {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureClass::Terminal)
    }

    /// Classify a non-success HTTP status. 429 is back-pressure, not a client bug.
    pub fn for_http_status(status: u16) -> Self {
        if (400..500).contains(&status) && status != 429 && status != 401 {
            FailureClass::Terminal
        } else {
            FailureClass::Transient
        }
    }
}

/// Error code persisted on a delivery record (`error_code` column).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Network,
    /// Rejected response; rendered as the numeric status.
    HttpStatus(u16),
    CircuitOpen,
    RateLimited,
    Deserialization,
    Authentication,
    LeaseExpired,
    Unknown,
}

impl ErrorCode {
    pub const NETWORK_ERROR: &'static str = "NETWORK_ERROR";
    pub const CIRCUIT_BREAKER_OPEN: &'static str = "CIRCUIT_BREAKER_OPEN";
    pub const RATE_LIMIT_EXCEEDED: &'static str = "RATE_LIMIT_EXCEEDED";
    pub const DESERIALIZATION_ERROR: &'static str = "DESERIALIZATION_ERROR";
    pub const AUTHENTICATION_ERROR: &'static str = "AUTHENTICATION_ERROR";
    pub const LEASE_EXPIRED: &'static str = "LEASE_EXPIRED";
    pub const UNKNOWN_ERROR: &'static str = "UNKNOWN_ERROR";

    /// Parse a persisted code. Anything unrecognised maps to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            Self::NETWORK_ERROR => ErrorCode::Network,
            Self::CIRCUIT_BREAKER_OPEN => ErrorCode::CircuitOpen,
            Self::RATE_LIMIT_EXCEEDED => ErrorCode::RateLimited,
            Self::DESERIALIZATION_ERROR => ErrorCode::Deserialization,
            Self::AUTHENTICATION_ERROR => ErrorCode::Authentication,
            Self::LEASE_EXPIRED => ErrorCode::LeaseExpired,
            other => other
                .parse::<u16>()
                .ok()
                .filter(|s| (100..600).contains(s))
                .map(ErrorCode::HttpStatus)
                .unwrap_or(ErrorCode::Unknown),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Network => f.write_str(Self::NETWORK_ERROR),
            ErrorCode::HttpStatus(status) => write!(f, "{status}"),
            ErrorCode::CircuitOpen => f.write_str(Self::CIRCUIT_BREAKER_OPEN),
            ErrorCode::RateLimited => f.write_str(Self::RATE_LIMIT_EXCEEDED),
            ErrorCode::Deserialization => f.write_str(Self::DESERIALIZATION_ERROR),
            ErrorCode::Authentication => f.write_str(Self::AUTHENTICATION_ERROR),
            ErrorCode::LeaseExpired => f.write_str(Self::LEASE_EXPIRED),
            ErrorCode::Unknown => f.write_str(Self::UNKNOWN_ERROR),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
