//! Terminal statuses reported to connection, client and server callbacks
//!
//! Every connect, start and send attempt resolves to exactly one of these.

use std::fmt;

/// Outcome of a client connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStatus {
    Success,
    /// The connect timer fired before the handshake completed
    FailTimeOut,
    /// The client already has a live (or pending) connection
    FailAlreadyConnected,
    FailSocketError,
}

/// Outcome of a server start attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartStatus {
    Success,
    FailAlreadyStarted,
    FailSocketError,
}

/// Outcome of a single send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStatus {
    Success,
    FailSocketError,
    FailNotConnected,
    /// Payload was empty or too large to frame
    FailInvalidPacket,
    /// The peer stopped accepting bytes mid-frame
    FailConnectionClosing,
}

impl ConnectStatus {
    pub fn is_success(self) -> bool {
        self == ConnectStatus::Success
    }
}

impl StartStatus {
    pub fn is_success(self) -> bool {
        self == StartStatus::Success
    }
}

impl SendStatus {
    pub fn is_success(self) -> bool {
        self == SendStatus::Success
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectStatus::Success => "success",
            ConnectStatus::FailTimeOut => "timed out",
            ConnectStatus::FailAlreadyConnected => "already connected",
            ConnectStatus::FailSocketError => "socket error",
        };
        f.write_str(s)
    }
}

impl fmt::Display for StartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StartStatus::Success => "success",
            StartStatus::FailAlreadyStarted => "already started",
            StartStatus::FailSocketError => "socket error",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendStatus::Success => "success",
            SendStatus::FailSocketError => "socket error",
            SendStatus::FailNotConnected => "not connected",
            SendStatus::FailInvalidPacket => "invalid packet",
            SendStatus::FailConnectionClosing => "connection closing",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_success_is_success() {
        assert!(SendStatus::Success.is_success());
        assert!(!SendStatus::FailNotConnected.is_success());
        assert!(ConnectStatus::Success.is_success());
        assert!(!ConnectStatus::FailTimeOut.is_success());
        assert!(!StartStatus::FailAlreadyStarted.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(SendStatus::FailConnectionClosing.to_string(), "connection closing");
        assert_eq!(ConnectStatus::FailAlreadyConnected.to_string(), "already connected");
        assert_eq!(StartStatus::FailSocketError.to_string(), "socket error");
    }
}
