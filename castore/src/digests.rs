use bytes::Bytes;
use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// A content-addressed object identifier, SHA-1 shaped.
///
/// Ordering is byte-lexicographic. Display renders lowercase hex.
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Bytes);

pub const OBJECT_ID_LEN: usize = 20;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid object id length: {0}")]
    InvalidIdLen(usize),
    #[error("invalid hex object id: {0}")]
    InvalidHex(String),
}

impl ObjectId {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Computes the id of a byte sequence, which is also how stored objects
    /// are verified after a round-trip through an untrusted cache.
    pub fn sha1_of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; OBJECT_ID_LEN] = hasher.finalize().into();
        Self::from(&digest)
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .map_err(|_| Error::InvalidHex(s.to_string()))?;
        bytes.try_into()
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<ObjectId> for Bytes {
    fn from(val: ObjectId) -> Self {
        val.0
    }
}

impl TryFrom<Vec<u8>> for ObjectId {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != OBJECT_ID_LEN {
            Err(Error::InvalidIdLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<Bytes> for ObjectId {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != OBJECT_ID_LEN {
            Err(Error::InvalidIdLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<&[u8; OBJECT_ID_LEN]> for ObjectId {
    fn from(value: &[u8; OBJECT_ID_LEN]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<ObjectId> for [u8; OBJECT_ID_LEN] {
    fn from(value: ObjectId) -> Self {
        value.0.to_vec().try_into().unwrap()
    }
}

impl Clone for ObjectId {
    fn clone(&self) -> Self {
        Self(self.0.to_owned())
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha1_of_known_vector() {
        // sha1("hello\n")
        let id = ObjectId::sha1_of(b"hello\n");
        assert_eq!(
            id.as_slice(),
            hex!("f572d396fae9206628714fb2ce00f72e94f2258f")
        );
        assert_eq!(id.to_hex(), "f572d396fae9206628714fb2ce00f72e94f2258f");
    }

    #[test]
    fn hex_roundtrip() {
        let id = ObjectId::sha1_of(b"abc");
        assert_eq!(ObjectId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            ObjectId::try_from(vec![0u8; 19]),
            Err(Error::InvalidIdLen(19))
        );
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn ordering_is_byte_lexicographic() {
        let a = ObjectId::from(&[0u8; OBJECT_ID_LEN]);
        let mut raw = [0u8; OBJECT_ID_LEN];
        raw[0] = 1;
        let b = ObjectId::from(&raw);
        assert!(a < b);
    }
}
