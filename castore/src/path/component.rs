use bstr::ByteSlice;
use std::fmt::{self, Debug, Display};
use thiserror::Error;

/// A validated single name inside a directory.
/// Internally uses a [bytes::Bytes], but disallows
/// slashes and null bytes to be present, as well as
/// '.', '..' and the empty string.
#[repr(transparent)]
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathComponent {
    pub(super) inner: bytes::Bytes,
}

#[derive(Error, Debug, PartialEq)]
pub enum PathError {
    #[error("invalid name: {}", .0.as_bstr())]
    InvalidName(bytes::Bytes),
    #[error("path would exceed the component limit")]
    TooDeep,
}

pub fn is_valid_name<B: AsRef<[u8]>>(name: B) -> bool {
    let v = name.as_ref();

    !v.is_empty() && v != *b".." && v != *b"." && !v.contains(&0x00) && !v.contains(&b'/')
}

impl PathComponent {
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_ref()
    }

    pub fn into_bytes(self) -> bytes::Bytes {
        self.inner
    }
}

impl AsRef<[u8]> for PathComponent {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_ref()
    }
}

impl From<PathComponent> for bytes::Bytes {
    fn from(value: PathComponent) -> Self {
        value.inner
    }
}

impl TryFrom<bytes::Bytes> for PathComponent {
    type Error = PathError;

    fn try_from(value: bytes::Bytes) -> Result<Self, Self::Error> {
        if !is_valid_name(&value) {
            return Err(PathError::InvalidName(value));
        }

        Ok(Self { inner: value })
    }
}

impl TryFrom<&[u8]> for PathComponent {
    type Error = PathError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if !is_valid_name(value) {
            return Err(PathError::InvalidName(bytes::Bytes::copy_from_slice(
                value,
            )));
        }
        Ok(Self {
            inner: bytes::Bytes::copy_from_slice(value),
        })
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

impl TryFrom<&std::ffi::CStr> for PathComponent {
    type Error = PathError;

    fn try_from(value: &std::ffi::CStr) -> Result<Self, Self::Error> {
        value.to_bytes().try_into()
    }
}

impl Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        for name in ["a", "src", ".keep", "a b", "münchen"] {
            assert!(PathComponent::try_from(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_invalid_names() {
        for name in &[&b""[..], b".", b"..", b"a/b", b"a\0b"] {
            assert!(PathComponent::try_from(*name).is_err());
        }
    }
}
