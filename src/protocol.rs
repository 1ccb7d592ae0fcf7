//! The request opcodes and response tags that make up the store's wire
//! protocol. Each is a one-byte discriminant on the wire; see [`frame`] for
//! how the surrounding arguments are encoded.
//!
//! [`frame`]: ../frame/index.html

use std::convert::TryFrom;

use crate::StoreError;

/// The request types a client can send. The opcode byte is followed by the
/// operation's typed arguments.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// key, value; no reply
    Set = 0,
    /// key, expected, desired; replies with the value stored after the call
    CompareSet = 1,
    /// key; replies with the stored value
    Get = 2,
    /// key, i64 delta; replies with the new total
    Add = 3,
    /// key count, keys; replies READY or NOT_READY
    Check = 4,
    /// key count, keys; replies STOP_WAITING once every key has a value
    Wait = 5,
    /// no arguments; replies with the key count
    GetNumKeys = 6,
    /// key; no reply, updates are pushed on this socket
    WatchKey = 7,
    /// key; replies 1 if the key existed, else 0
    DeleteKey = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = StoreError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Opcode::Set),
            1 => Ok(Opcode::CompareSet),
            2 => Ok(Opcode::Get),
            3 => Ok(Opcode::Add),
            4 => Ok(Opcode::Check),
            5 => Ok(Opcode::Wait),
            6 => Ok(Opcode::GetNumKeys),
            7 => Ok(Opcode::WatchKey),
            8 => Ok(Opcode::DeleteKey),
            _ => Err(StoreError::Protocol(format!("unknown opcode: {}", raw))),
        }
    }
}

/// reply tags for a CHECK request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CheckResponse {
    Ready = 0,
    NotReady = 1,
}

impl TryFrom<u8> for CheckResponse {
    type Error = StoreError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(CheckResponse::Ready),
            1 => Ok(CheckResponse::NotReady),
            _ => Err(StoreError::Protocol(format!(
                "READY or NOT_READY response expected, got: {}",
                raw
            ))),
        }
    }
}

/// reply tag for a WAIT request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaitResponse {
    StopWaiting = 0,
}

impl TryFrom<u8> for WaitResponse {
    type Error = StoreError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(WaitResponse::StopWaiting),
            _ => Err(StoreError::Protocol(format!(
                "STOP_WAITING response expected, got: {}",
                raw
            ))),
        }
    }
}

/// tag on every notification pushed to a watching socket
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WatchResponse {
    KeyUpdated = 0,
}

impl TryFrom<u8> for WatchResponse {
    type Error = StoreError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(WatchResponse::KeyUpdated),
            _ => Err(StoreError::Protocol(format!(
                "KEY_UPDATED response expected, got: {}",
                raw
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_discriminants_match_the_wire() {
        let table = [
            (Opcode::Set, 0u8),
            (Opcode::CompareSet, 1),
            (Opcode::Get, 2),
            (Opcode::Add, 3),
            (Opcode::Check, 4),
            (Opcode::Wait, 5),
            (Opcode::GetNumKeys, 6),
            (Opcode::WatchKey, 7),
            (Opcode::DeleteKey, 8),
        ];
        for (op, raw) in table.iter() {
            assert_eq!(*op as u8, *raw);
            assert_eq!(Opcode::try_from(*raw).unwrap(), *op);
        }
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        assert!(Opcode::try_from(9).is_err());
        assert!(Opcode::try_from(0xff).is_err());
    }

    #[test]
    fn response_tags_reject_garbage() {
        assert!(CheckResponse::try_from(2).is_err());
        assert!(WaitResponse::try_from(1).is_err());
        assert!(WatchResponse::try_from(1).is_err());
    }
}
