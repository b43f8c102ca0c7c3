//! CBOR-based FrameCodec implementation.

use crate::application::ports::FrameCodec;
use crate::domain::frame::RoomFrame;

/// Encodes / decodes [`RoomFrame`] using CBOR (via `serde_cbor`).
pub struct CborFrameCodec;

impl FrameCodec for CborFrameCodec {
    fn encode(&self, frame: &RoomFrame) -> anyhow::Result<Vec<u8>> {
        serde_cbor::to_vec(frame).map_err(Into::into)
    }

    fn decode(&self, data: &[u8]) -> anyhow::Result<RoomFrame> {
        serde_cbor::from_slice(data).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::member::{ChatMessage, RoomMember};

    #[test]
    fn chat_frame_survives_encoding() {
        let codec = CborFrameCodec;
        let frame = RoomFrame::Chat {
            message: ChatMessage {
                sequence: 7,
                sender: "Ana".into(),
                content: "héllo".into(),
                timestamp_ms: 1_700_000_000_000,
            },
        };
        let bytes = codec.encode(&frame).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn user_list_keeps_order() {
        let codec = CborFrameCodec;
        let frame = RoomFrame::UserList {
            users: vec![
                RoomMember::new("b".into(), "Bo"),
                RoomMember::new("a".into(), "Al"),
            ],
        };
        let decoded = codec.decode(&codec.encode(&frame).unwrap()).unwrap();
        assert!(matches!(decoded, RoomFrame::UserList { ref users } if users[0].display_name == "Bo"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CborFrameCodec.decode(&[0xff, 0x00, 0x13]).is_err());
        assert!(CborFrameCodec.decode(&[]).is_err());
    }
}
