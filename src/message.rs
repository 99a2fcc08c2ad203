//! Wire messages exchanged between peers.
//!
//! Every message is a JSON object whose `type` field selects the
//! variant. Binary payloads (signatures, deltas, file bytes) travel as
//! base64 strings.

use serde::{Deserialize, Serialize};

/// One file's entry in a [`Message::DirState`] snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the monitored root, forward-slash separated.
    pub path: String,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: f64,
    /// File size in bytes.
    pub size: u64,
    /// Serialized signature of the file's current content.
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

/// Protocol messages.
///
/// `Beacon` travels as a bare UDP datagram; `Hello` opens every TCP
/// session in both directions; the rest flow over established sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Presence announcement carrying the sender's TCP listen port.
    Beacon {
        /// TCP port the sender accepts sessions on.
        port: u16,
    },
    /// Session opener carrying the sender's advertised listen port, so
    /// the accepting side can derive the dialable peer identity (the
    /// connection's source port is ephemeral).
    Hello {
        /// TCP port the sender accepts sessions on.
        port: u16,
    },
    /// Full directory snapshot with per-file signatures, sent once at
    /// the start of every session.
    DirState {
        /// Every regular file under the sender's monitored root.
        files: Vec<FileEntry>,
    },
    /// Full-content transfer for a file the receiver has no base for.
    Create {
        /// Target path.
        path: String,
        /// Modification time to stamp on the received file.
        mtime: f64,
        /// Complete file content.
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
    /// Delta transfer against the receiver's last-known content.
    Modify {
        /// Target path.
        path: String,
        /// Modification time to stamp on the patched file.
        mtime: f64,
        /// Delta computed against the receiver's prior signature.
        #[serde(with = "b64")]
        delta: Vec<u8>,
    },
    /// File removal.
    Delete {
        /// Target path.
        path: String,
        /// Event time; older local content wins over a stale delete.
        mtime: f64,
    },
    /// File rename.
    Rename {
        /// Source path.
        src: String,
        /// Destination path.
        dst: String,
        /// Event time; a newer file at the destination wins.
        mtime: f64,
    },
}

impl Message {
    /// Short tag for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Beacon { .. } => "BEACON",
            Self::Hello { .. } => "HELLO",
            Self::DirState { .. } => "DIR_STATE",
            Self::Create { .. } => "CREATE",
            Self::Modify { .. } => "MODIFY",
            Self::Delete { .. } => "DELETE",
            Self::Rename { .. } => "RENAME",
        }
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_wire_names() {
        let cases = [
            (Message::Beacon { port: 5000 }, "BEACON"),
            (Message::Hello { port: 6000 }, "HELLO"),
            (Message::DirState { files: vec![] }, "DIR_STATE"),
            (
                Message::Create {
                    path: "a".into(),
                    mtime: 1.0,
                    bytes: vec![],
                },
                "CREATE",
            ),
            (
                Message::Modify {
                    path: "a".into(),
                    mtime: 1.0,
                    delta: vec![],
                },
                "MODIFY",
            ),
            (
                Message::Delete {
                    path: "a".into(),
                    mtime: 1.0,
                },
                "DELETE",
            ),
            (
                Message::Rename {
                    src: "a".into(),
                    dst: "b".into(),
                    mtime: 1.0,
                },
                "RENAME",
            ),
        ];
        for (msg, tag) in cases {
            assert_eq!(msg.kind(), tag);
            let json = serde_json::to_string(&msg).unwrap();
            assert!(
                json.contains(&format!("\"type\":\"{tag}\"")),
                "missing tag {tag} in {json}"
            );
        }
    }

    #[test]
    fn create_round_trip() {
        let msg = Message::Create {
            path: "docs/readme.md".into(),
            mtime: 1700000000.25,
            bytes: b"hello world".to_vec(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn bytes_are_base64_on_the_wire() {
        let msg = Message::Create {
            path: "x".into(),
            mtime: 0.0,
            bytes: vec![0xFF, 0x00, 0x7F],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"bytes\":\"/wB/\""));
    }

    #[test]
    fn dir_state_round_trip() {
        let msg = Message::DirState {
            files: vec![
                FileEntry {
                    path: "a.txt".into(),
                    mtime: 100.5,
                    size: 3,
                    sig: vec![1, 2, 3],
                },
                FileEntry {
                    path: "b/c.txt".into(),
                    mtime: 200.0,
                    size: 0,
                    sig: vec![],
                },
            ],
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn rename_field_names() {
        let msg = Message::Rename {
            src: "old".into(),
            dst: "new".into(),
            mtime: 400.0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"src\":\"old\""));
        assert!(json.contains("\"dst\":\"new\""));
    }

    #[test]
    fn rejects_unknown_type() {
        let json = r#"{"type":"NONSENSE","port":1}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn rejects_invalid_base64() {
        let json = r#"{"type":"CREATE","path":"a","mtime":1.0,"bytes":"@@@"}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }
}
