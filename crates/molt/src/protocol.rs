//! Control-channel vocabulary and the bootstrap fd map.

use std::collections::HashMap;
use std::os::fd::RawFd;

/// Listener name to inherited fd number, as seen inside the child.
pub type TcpFdMap = HashMap<String, RawFd>;

/// The complete set of messages exchanged over the control channel.
///
/// Payloads are short ASCII strings inside length-prefixed frames. Receivers
/// ignore anything they do not recognize and keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// child to parent: business logic is serving
    ReadyOk,
    /// child to parent: business logic failed to start
    ReadyError,
    /// parent to child: drain and terminate; child to parent: drain complete
    Exit,
}

impl ControlFrame {
    /// Wire form of the frame payload.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::ReadyOk => b"ReadyOK",
            Self::ReadyError => b"ReadyError",
            Self::Exit => b"Exit",
        }
    }

    /// Decode a frame payload. Unknown payloads return `None`.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"ReadyOK" => Some(Self::ReadyOk),
            b"ReadyError" => Some(Self::ReadyError),
            b"Exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Encode the fd map for transport in a single command-line flag.
pub fn encode_fd_map(map: &TcpFdMap) -> Result<String, serde_json::Error> {
    serde_json::to_string(map)
}

/// Decode the fd map from the bootstrap flag value.
pub fn decode_fd_map(raw: &str) -> Result<TcpFdMap, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_their_wire_form() {
        for frame in [
            ControlFrame::ReadyOk,
            ControlFrame::ReadyError,
            ControlFrame::Exit,
        ] {
            assert_eq!(ControlFrame::parse(frame.as_bytes()), Some(frame));
        }
    }

    #[test]
    fn unknown_payloads_are_not_frames() {
        assert_eq!(ControlFrame::parse(b""), None);
        assert_eq!(ControlFrame::parse(b"readyok"), None);
        assert_eq!(ControlFrame::parse(b"Exit "), None);
    }

    #[test]
    fn fd_map_round_trips_as_json() {
        let mut map = TcpFdMap::new();
        map.insert("web".to_string(), 5);
        map.insert("admin".to_string(), 6);

        let encoded = encode_fd_map(&map).unwrap();
        let decoded = decode_fd_map(&encoded).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(decode_fd_map("not json").is_err());
        assert!(decode_fd_map("").is_err());
    }
}
