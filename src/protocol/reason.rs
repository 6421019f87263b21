//! MQTT v3.1/v3.1.1 return codes carried by CONNACK and SUBACK

use std::fmt;

use super::QoS;

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0x00,
    /// The server does not support the requested protocol level
    UnacceptableProtocolVersion = 0x01,
    /// Client identifier rejected (missing id, or non-clean session requested)
    IdentifierRejected = 0x02,
    /// Server unavailable
    ServerUnavailable = 0x03,
    /// Malformed user name or password
    BadUsernameOrPassword = 0x04,
    /// Not authorized
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ConnectReturnCode::Accepted),
            0x01 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            0x02 => Some(ConnectReturnCode::IdentifierRejected),
            0x03 => Some(ConnectReturnCode::ServerUnavailable),
            0x04 => Some(ConnectReturnCode::BadUsernameOrPassword),
            0x05 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                write!(f, "unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => write!(f, "identifier rejected"),
            ConnectReturnCode::ServerUnavailable => write!(f, "server unavailable"),
            ConnectReturnCode::BadUsernameOrPassword => write!(f, "bad username or password"),
            ConnectReturnCode::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

/// Per-filter SUBACK status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubAckReturnCode {
    /// Subscription accepted with the granted QoS
    Granted(QoS),
    /// Subscription refused (0x80)
    Failure,
}

impl SubAckReturnCode {
    pub const FAILURE: u8 = 0x80;

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            Self::FAILURE => Some(SubAckReturnCode::Failure),
            _ => QoS::from_u8(code).map(SubAckReturnCode::Granted),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubAckReturnCode::Granted(qos) => qos as u8,
            SubAckReturnCode::Failure => Self::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_return_code_wire_values() {
        assert_eq!(ConnectReturnCode::Accepted as u8, 0x00);
        assert_eq!(ConnectReturnCode::UnacceptableProtocolVersion as u8, 0x01);
        assert_eq!(ConnectReturnCode::IdentifierRejected as u8, 0x02);
        assert_eq!(ConnectReturnCode::BadUsernameOrPassword as u8, 0x04);
        assert_eq!(ConnectReturnCode::from_u8(0x06), None);
    }

    #[test]
    fn test_suback_return_codes() {
        assert_eq!(SubAckReturnCode::Granted(QoS::AtMostOnce).to_u8(), 0x00);
        assert_eq!(SubAckReturnCode::Failure.to_u8(), 0x80);
        assert_eq!(
            SubAckReturnCode::from_u8(0x01),
            Some(SubAckReturnCode::Granted(QoS::AtLeastOnce))
        );
        assert_eq!(SubAckReturnCode::from_u8(0x80), Some(SubAckReturnCode::Failure));
        assert_eq!(SubAckReturnCode::from_u8(0x03), None);
    }
}
