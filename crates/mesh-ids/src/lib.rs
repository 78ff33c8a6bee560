//! 128-bit identifiers used throughout the messaging fabric and blob transfer
//! pipeline: peers, channels, chunks, sessions, metadata artifacts and entries.
//!
//! Every id is a `Uuid` newtype so the different identifier spaces can never
//! be confused with one another at the type level (a `ChunkId` cannot be
//! passed where a `PeerId` is expected).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil id (all-zero UUID). Used as the "unset" sentinel for
            /// fields that spec.md calls out as "nil" (e.g. a command
            /// block's `chunkId` for non-chunk operations).
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub const fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(PeerId, "Identifies a logical participant in the messaging fabric.");
uuid_id!(
    ChannelId,
    "Identifies one outgoing connection from a proxy to the real broker. Never nil in practice: \
     the proxy backend treats a nil channel id as a programming error (see spec.md §9 Open \
     Questions), so `ChannelId` intentionally has no \"unset\" call site outside tests."
);
uuid_id!(ChunkId, "Identifies a contiguous slice of a file's content.");
uuid_id!(SessionId, "Identifies one connection instance on the block-transfer server.");
uuid_id!(ArtifactId, "Identifies a finalised filesystem-metadata artifact.");
uuid_id!(EntryId, "Identifies a file, directory, or symlink entry within an artifact.");
uuid_id!(ConversationId, "Correlates a request/response pair or logical exchange.");
uuid_id!(MessageId, "Uniquely identifies one broker-protocol message.");

/// Computes the CRC32 (IEEE polynomial) of a byte slice, used both for
/// per-chunk and file-level checksums.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Folds a sequence of per-chunk CRC32 words into the file-level checksum
/// described in spec.md §3: "a file-level CRC32 computed over the
/// concatenation of per-chunk CRC32 words".
pub fn fold_chunk_crcs<I: IntoIterator<Item = u32>>(crcs: I) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for crc in crcs {
        hasher.update(&crc.to_be_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_uuid() {
        let id = PeerId::new();
        let uuid: Uuid = id.into();
        assert_eq!(PeerId::from(uuid), id);
    }

    #[test]
    fn distinct_id_kinds_do_not_collide_in_type() {
        // This is a compile-time property; the test just exercises nil/new.
        assert!(ChunkId::nil().is_nil());
        assert!(!ChunkId::new().is_nil());
        assert_ne!(ChunkId::new(), ChunkId::new());
    }

    #[test]
    fn fold_chunk_crcs_is_order_sensitive() {
        let a = fold_chunk_crcs([1, 2, 3]);
        let b = fold_chunk_crcs([3, 2, 1]);
        assert_ne!(a, b);
        assert_eq!(fold_chunk_crcs([1, 2, 3]), a);
    }

    #[test]
    fn crc32_matches_known_vector() {
        // "123456789" is the standard CRC32/IEEE check vector.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
