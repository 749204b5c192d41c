//! Explicit, versioned binary encoding for everything this crate persists.
//!
//! Every record starts with a little-endian ABI version tag. Decoding is an
//! explicit match on that tag; unknown future versions and retired past
//! versions are rejected up front instead of being misinterpreted.

use crate::log::{Command, Index, LogEntry, Term};
use crate::persist::{ElectionState, Snapshot};
use crate::replica::{MemberId, MemberInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire/storage format version advertised by each member and stamped on each
/// persisted record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbiVersion(u16);

impl AbiVersion {
    /// Version 1 encoded snapshot membership without payload versions; it was
    /// retired when rolling-upgrade support landed.
    pub const MIN_SUPPORTED: AbiVersion = AbiVersion(2);
    pub const CURRENT: AbiVersion = AbiVersion(2);

    pub fn new(version: u16) -> Self {
        AbiVersion(version)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Reject versions outside the supported window.
    pub fn check(&self) -> Result<(), AbiError> {
        if *self > Self::CURRENT {
            Err(AbiError::FutureVersion {
                version: *self,
                current: Self::CURRENT,
            })
        } else if *self < Self::MIN_SUPPORTED {
            Err(AbiError::PastVersion {
                version: *self,
                min_supported: Self::MIN_SUPPORTED,
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("version {version:?} is from the future; this build reads up to {current:?}")]
    FutureVersion { version: AbiVersion, current: AbiVersion },
    #[error("version {version:?} has been retired; this build reads {min_supported:?} and newer")]
    PastVersion { version: AbiVersion, min_supported: AbiVersion },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("record truncated while reading {0}")]
    Truncated(&'static str),
    #[error("unknown command tag {0}")]
    UnknownCommandTag(u8),
    #[error("member id is not valid UTF-8")]
    InvalidMemberId,
}

const COMMAND_TAG_NOOP: u8 = 0;
const COMMAND_TAG_CLIENT: u8 = 1;

fn need(buf: &impl Buf, len: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < len {
        Err(CodecError::Truncated(what))
    } else {
        Ok(())
    }
}

fn decode_version(buf: &mut impl Buf, what: &'static str) -> Result<AbiVersion, CodecError> {
    need(buf, 2, what)?;
    let version = AbiVersion::new(buf.get_u16_le());
    version.check()?;
    Ok(version)
}

fn put_member(buf: &mut BytesMut, member: &MemberInfo) {
    let id = member.id.as_str().as_bytes();
    buf.put_u16_le(id.len() as u16);
    buf.put_slice(id);
    buf.put_u16_le(member.payload_version.as_u16());
}

fn get_member_id(buf: &mut impl Buf) -> Result<MemberId, CodecError> {
    need(buf, 2, "member id length")?;
    let len = buf.get_u16_le() as usize;
    need(buf, len, "member id")?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw)
        .map(MemberId::new)
        .map_err(|_| CodecError::InvalidMemberId)
}

pub fn encode_entry(entry: &LogEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + 8 + 8 + 1 + 4 + entry.command.len());
    buf.put_u16_le(AbiVersion::CURRENT.as_u16());
    buf.put_u64_le(entry.term.as_u64());
    buf.put_u64_le(entry.index.as_u64());
    match &entry.command {
        Command::Noop => {
            buf.put_u8(COMMAND_TAG_NOOP);
            buf.put_u32_le(0);
        }
        Command::Client(data) => {
            buf.put_u8(COMMAND_TAG_CLIENT);
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(data);
        }
    }
    buf.freeze()
}

pub fn decode_entry(buf: &mut impl Buf) -> Result<LogEntry, CodecError> {
    decode_version(buf, "entry version")?;
    need(buf, 8 + 8 + 1 + 4, "entry header")?;
    let term = Term::new(buf.get_u64_le());
    let index = Index::new(buf.get_u64_le());
    let tag = buf.get_u8();
    let len = buf.get_u32_le() as usize;
    need(buf, len, "entry command")?;
    let data = buf.copy_to_bytes(len);
    let command = match tag {
        COMMAND_TAG_NOOP => Command::Noop,
        COMMAND_TAG_CLIENT => Command::Client(data),
        other => return Err(CodecError::UnknownCommandTag(other)),
    };

    Ok(LogEntry { term, index, command })
}

pub fn encode_election_state(state: &ElectionState) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + 8 + 1 + 2 + 64);
    buf.put_u16_le(AbiVersion::CURRENT.as_u16());
    buf.put_u64_le(state.current_term.as_u64());
    match &state.voted_for {
        None => buf.put_u8(0),
        Some(id) => {
            buf.put_u8(1);
            let raw = id.as_str().as_bytes();
            buf.put_u16_le(raw.len() as u16);
            buf.put_slice(raw);
        }
    }
    buf.freeze()
}

pub fn decode_election_state(buf: &mut impl Buf) -> Result<ElectionState, CodecError> {
    decode_version(buf, "election state version")?;
    need(buf, 8 + 1, "election state header")?;
    let current_term = Term::new(buf.get_u64_le());
    let voted_for = match buf.get_u8() {
        0 => None,
        _ => Some(get_member_id(buf)?),
    };

    Ok(ElectionState { current_term, voted_for })
}

pub fn encode_snapshot(snapshot: &Snapshot) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + 8 + 8 + 2 + 4 + snapshot.data.len());
    buf.put_u16_le(AbiVersion::CURRENT.as_u16());
    buf.put_u64_le(snapshot.last_included_index.as_u64());
    buf.put_u64_le(snapshot.last_included_term.as_u64());
    buf.put_u16_le(snapshot.membership.len() as u16);
    for member in &snapshot.membership {
        put_member(&mut buf, member);
    }
    buf.put_u32_le(snapshot.data.len() as u32);
    buf.put_slice(&snapshot.data);
    buf.freeze()
}

pub fn decode_snapshot(buf: &mut impl Buf) -> Result<Snapshot, CodecError> {
    decode_version(buf, "snapshot version")?;
    need(buf, 8 + 8 + 2, "snapshot header")?;
    let last_included_index = Index::new(buf.get_u64_le());
    let last_included_term = Term::new(buf.get_u64_le());
    let member_count = buf.get_u16_le() as usize;
    let mut membership = Vec::with_capacity(member_count);
    for _ in 0..member_count {
        let id = get_member_id(buf)?;
        need(buf, 2, "member payload version")?;
        let payload_version = AbiVersion::new(buf.get_u16_le());
        membership.push(MemberInfo { id, payload_version });
    }
    need(buf, 4, "snapshot data length")?;
    let data_len = buf.get_u32_le() as usize;
    need(buf, data_len, "snapshot data")?;
    let data = buf.copy_to_bytes(data_len);

    Ok(Snapshot {
        last_included_index,
        last_included_term,
        data,
        membership,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_window() {
        assert!(AbiVersion::CURRENT.check().is_ok());
        assert!(matches!(
            AbiVersion::new(AbiVersion::CURRENT.as_u16() + 1).check(),
            Err(AbiError::FutureVersion { .. })
        ));
        assert!(matches!(
            AbiVersion::new(AbiVersion::MIN_SUPPORTED.as_u16() - 1).check(),
            Err(AbiError::PastVersion { .. })
        ));
    }

    #[test]
    fn entry_round_trip() {
        let entry = LogEntry {
            term: Term::new(7),
            index: Index::new(42),
            command: Command::Client(Bytes::from_static(b"set x=1")),
        };
        let mut encoded = encode_entry(&entry);
        assert_eq!(decode_entry(&mut encoded).unwrap(), entry);

        let noop = LogEntry {
            term: Term::new(8),
            index: Index::new(43),
            command: Command::Noop,
        };
        let mut encoded = encode_entry(&noop);
        assert_eq!(decode_entry(&mut encoded).unwrap(), noop);
    }

    #[test]
    fn election_state_round_trip() {
        let unvoted = ElectionState {
            current_term: Term::new(3),
            voted_for: None,
        };
        let mut encoded = encode_election_state(&unvoted);
        assert_eq!(decode_election_state(&mut encoded).unwrap(), unvoted);

        let voted = ElectionState {
            current_term: Term::new(4),
            voted_for: Some(MemberId::new("member-2")),
        };
        let mut encoded = encode_election_state(&voted);
        assert_eq!(decode_election_state(&mut encoded).unwrap(), voted);
    }

    #[test]
    fn snapshot_round_trip() {
        let snapshot = Snapshot {
            last_included_index: Index::new(1000),
            last_included_term: Term::new(5),
            data: Bytes::from_static(b"state machine bytes"),
            membership: vec![
                MemberInfo {
                    id: MemberId::new("a"),
                    payload_version: AbiVersion::CURRENT,
                },
                MemberInfo {
                    id: MemberId::new("b"),
                    payload_version: AbiVersion::CURRENT,
                },
            ],
        };
        let mut encoded = encode_snapshot(&snapshot);
        assert_eq!(decode_snapshot(&mut encoded).unwrap(), snapshot);
    }

    #[test]
    fn future_version_is_rejected_not_misread() {
        let entry = LogEntry {
            term: Term::new(1),
            index: Index::new(1),
            command: Command::Noop,
        };
        let mut tampered = BytesMut::from(&encode_entry(&entry)[..]);
        tampered[0] = 0xFF;
        tampered[1] = 0xFF;
        let mut buf = tampered.freeze();
        assert!(matches!(
            decode_entry(&mut buf),
            Err(CodecError::Abi(AbiError::FutureVersion { .. }))
        ));
    }

    #[test]
    fn truncated_record_is_detected() {
        let entry = LogEntry {
            term: Term::new(1),
            index: Index::new(1),
            command: Command::Client(Bytes::from_static(b"payload")),
        };
        let encoded = encode_entry(&entry);
        let mut cut = encoded.slice(0..encoded.len() - 3);
        assert!(matches!(decode_entry(&mut cut), Err(CodecError::Truncated(_))));
    }
}
