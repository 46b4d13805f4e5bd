pub mod codec;
pub mod entry;
pub mod policy;
pub mod protocol;

pub use codec::{decode_value, encode_value, CodecError, PacketCodec};
pub use entry::{DataEntry, Entry, Key, Payload, PolicyEntry, OFFLINE_KEY};
pub use policy::{PolicyOption, TopicPolicy};
pub use protocol::{Packet, SessionInfo, DEFAULT_PORT, PROTOCOL_VERSION};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_serialization_join() {
        let packet = Packet::Join {
            protocol_version: PROTOCOL_VERSION,
            game_id: Some("table".to_string()),
            credential: None,
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Join {
                protocol_version,
                game_id,
                credential,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(game_id.as_deref(), Some("table"));
                assert!(credential.is_none());
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_update() {
        let packet = Packet::Update {
            entries: vec![
                Entry::policy("spectators", PolicyOption::WriteProtected(true)),
                Entry::data("spectators", "p1", Some(encode_value(&"alice").unwrap())),
                Entry::data("spectators", "p2", None),
            ],
            full: true,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Update { entries, full } => {
                assert!(full);
                assert_eq!(entries.len(), 3);
                assert!(matches!(entries[0], Entry::Policy(_)));
                assert!(entries[2].is_deletion());
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_session_info_equality() {
        let a = SessionInfo {
            game_id: "g".to_string(),
            player_id: "p1".to_string(),
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
