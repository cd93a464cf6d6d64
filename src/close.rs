//! Close codes for the WebSocket close handshake.
//!
//! A Close frame carries an optional status code in its first two payload
//! bytes (network byte order), followed by a UTF-8 reason. This module
//! defines the registry values the endpoint references, per
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).

/// Status code carried in a Close frame.
///
/// The named variants cover the codes the endpoint itself emits or
/// interprets; any other value decodes as [`CloseCode::Other`] and is passed
/// through untouched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000 — normal closure; the purpose for which the connection was
    /// established has been fulfilled.
    Normal,
    /// 1001 — the endpoint is going away (server shutdown, browser
    /// navigation, or a failed liveness check).
    Away,
    /// 1002 — a protocol error was detected.
    Protocol,
    /// 1003 — the endpoint received data of a type it cannot accept
    /// (e.g. binary frames on a text-only endpoint).
    Unsupported,
    /// 1005 — reserved; indicates no status code was present. Never sent on
    /// the wire.
    Status,
    /// 1006 — reserved; the connection was dropped without a close
    /// handshake. Never sent on the wire by a conforming peer.
    Abnormal,
    /// 1007 — a message's payload was inconsistent with its type
    /// (non-UTF-8 data in a text message).
    Invalid,
    /// 1008 — a message violated the endpoint's policy.
    Policy,
    /// 1009 — a frame or message was too large to process.
    Size,
    /// 1010 — the client expected an extension the server did not negotiate.
    Extension,
    /// 1011 — the server encountered an unexpected condition.
    Error,
    /// Any other status code.
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Other(other) => other,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_codes_round_trip() {
        for code in [1000u16, 1001, 1002, 1003, 1005, 1006, 1007, 1008, 1009, 1010, 1011] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn unknown_codes_pass_through() {
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
        assert_eq!(u16::from(CloseCode::Other(4000)), 4000);
    }

    #[test]
    fn display_shows_numeric_value() {
        assert_eq!(CloseCode::Normal.to_string(), "1000");
        assert_eq!(CloseCode::Other(3999).to_string(), "3999");
    }
}
