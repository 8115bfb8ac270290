//! Binary sync frames.
//!
//! Every frame is a varint tag followed by a type-specific payload:
//! tag 0 carries the substrate's three-step sync protocol, tag 1 an
//! awareness update, tag 3 an awareness query, and tag 102 the
//! sync-status extension (a varint-length-prefixed buffer whose inner
//! bytes are a varint `localVersion`, echoed back by the server
//! unmodified). Custom tags ≥ 100 are reserved for server commands;
//! unknown ones surface as [`Frame::Unknown`] and are dropped.

use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Custom tag for the sync-status (local version echo) extension.
pub const TAG_SYNC_STATUS: u8 = 102;

/// A decoded sync frame.
#[derive(Debug)]
pub enum Frame {
    /// Sender's state vector; answered with a `SyncStep2` diff.
    SyncStep1(Vec<u8>),
    /// Update covering everything the step-1 sender was missing.
    SyncStep2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
    Awareness(AwarenessUpdate),
    QueryAwareness,
    /// Permission verdict; `Some` carries the denial reason.
    AuthDenied(Option<String>),
    /// Local version probe/echo.
    SyncStatus(u64),
    /// Reserved/unknown custom tag; ignored by both ends.
    Unknown(u8),
}

pub fn decode_frame(bytes: &[u8]) -> anyhow::Result<Frame> {
    let message =
        Message::decode_v1(bytes).map_err(|e| anyhow::anyhow!("malformed sync frame: {e}"))?;
    Ok(match message {
        Message::Sync(SyncMessage::SyncStep1(sv)) => Frame::SyncStep1(sv.encode_v1()),
        Message::Sync(SyncMessage::SyncStep2(update)) => Frame::SyncStep2(update),
        Message::Sync(SyncMessage::Update(update)) => Frame::Update(update),
        Message::Awareness(update) => Frame::Awareness(update),
        Message::AwarenessQuery => Frame::QueryAwareness,
        Message::Auth(deny) => Frame::AuthDenied(deny),
        Message::Custom(TAG_SYNC_STATUS, payload) => Frame::SyncStatus(
            decode_version(&payload)
                .ok_or_else(|| anyhow::anyhow!("malformed sync-status payload"))?,
        ),
        Message::Custom(tag, _) => Frame::Unknown(tag),
    })
}

pub fn sync_step1(state_vector: &[u8]) -> anyhow::Result<Vec<u8>> {
    let sv = StateVector::decode_v1(state_vector)
        .map_err(|e| anyhow::anyhow!("invalid state vector: {e}"))?;
    Ok(Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1())
}

pub fn sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

pub fn update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

pub fn query_awareness() -> Vec<u8> {
    Message::AwarenessQuery.encode_v1()
}

pub fn sync_status(version: u64) -> Vec<u8> {
    Message::Custom(TAG_SYNC_STATUS, encode_version(version)).encode_v1()
}

/// LEB128-style varint used inside the sync-status payload.
fn encode_version(mut version: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    loop {
        let byte = (version & 0x7F) as u8;
        version >>= 7;
        if version == 0 {
            bytes.push(byte);
            return bytes;
        }
        bytes.push(byte | 0x80);
    }
}

fn decode_version(bytes: &[u8]) -> Option<u64> {
    let mut version: u64 = 0;
    let mut shift = 0u32;
    for byte in bytes {
        version |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(version);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ActorId;
    use crate::substrate::{CommitOrigin, Substrate};

    #[test]
    fn test_version_varint_round_trip() {
        for version in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let encoded = encode_version(version);
            assert_eq!(decode_version(&encoded), Some(version));
        }
    }

    #[test]
    fn test_sync_status_round_trip() {
        for version in [0u64, 7, 500_000] {
            let frame = decode_frame(&sync_status(version)).unwrap();
            let Frame::SyncStatus(decoded) = frame else {
                panic!("expected sync-status frame, got {frame:?}");
            };
            assert_eq!(decoded, version);
        }
    }

    #[test]
    fn test_sync_step1_round_trips_state_vector() {
        let substrate = Substrate::new(ActorId::generate());
        let array = substrate.array("kv");
        substrate.transact(CommitOrigin::Local, |txn| {
            use yrs::Array;
            array.push_back(txn, yrs::Any::BigInt(1));
        });
        let sv = substrate.state_vector();
        let frame = decode_frame(&sync_step1(&sv).unwrap()).unwrap();
        let Frame::SyncStep1(decoded) = frame else {
            panic!("expected step-1 frame, got {frame:?}");
        };
        assert_eq!(decoded, sv);
    }

    #[test]
    fn test_sync_messages_round_trip() {
        let update_bytes = vec![1u8, 2, 3];
        let Frame::SyncStep2(decoded) = decode_frame(&sync_step2(update_bytes.clone())).unwrap()
        else {
            panic!("expected step-2 frame");
        };
        assert_eq!(decoded, update_bytes);

        let Frame::Update(decoded) = decode_frame(&update(update_bytes.clone())).unwrap() else {
            panic!("expected update frame");
        };
        assert_eq!(decoded, update_bytes);

        assert!(matches!(
            decode_frame(&query_awareness()).unwrap(),
            Frame::QueryAwareness
        ));
    }

    #[test]
    fn test_unknown_custom_tags_are_preserved_not_errors() {
        let encoded = yrs::sync::Message::Custom(120, vec![9, 9]).encode_v1();
        assert!(matches!(decode_frame(&encoded).unwrap(), Frame::Unknown(120)));
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(decode_frame(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
