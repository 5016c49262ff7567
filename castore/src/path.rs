//! Path types for locations inside the working copy.
//!
//! A [RepoPath] is always relative to the mount root and platform
//! independent, which distinguishes it from the ones provided in the
//! standard library. Host-side locations (mount points, state directories)
//! use `std::path::PathBuf` instead.
use bstr::ByteSlice;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

mod component;
pub use component::{is_valid_name, PathComponent, PathError};

/// A relative path inside the working copy: zero or more [PathComponent]s
/// joined by `/`. The empty path is the mount root.
#[derive(Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RepoPath {
    // Component names cannot contain slashes, so a plain byte buffer with
    // '/' separators is unambiguous.
    inner: Vec<u8>,
}

impl RepoPath {
    pub const fn root() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Parses a byte sequence, validating every component.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PathError> {
        if bytes.is_empty() {
            return Ok(Self::root());
        }
        for component in bytes.split_str(b"/") {
            if !component::is_valid_name(component) {
                return Err(PathError::InvalidName(bytes::Bytes::copy_from_slice(
                    component,
                )));
            }
        }
        Ok(Self {
            inner: bytes.to_vec(),
        })
    }

    /// Returns the path without its final component, if there is one.
    ///
    /// The parent of a bare file name is the root; the root has no parent.
    pub fn parent(&self) -> Option<RepoPath> {
        if self.inner.is_empty() {
            return None;
        }

        Some(match self.inner.rsplit_once_str(b"/") {
            Some((parent, _file_name)) => Self {
                inner: parent.to_vec(),
            },
            None => Self::root(),
        })
    }

    /// Creates a new path with `name` adjoined to self.
    pub fn join(&self, name: &PathComponent) -> RepoPath {
        let mut inner = Vec::with_capacity(self.inner.len() + 1 + name.as_bytes().len());
        inner.extend_from_slice(&self.inner);
        if !inner.is_empty() {
            inner.push(b'/');
        }
        inner.extend_from_slice(name.as_bytes());
        Self { inner }
    }

    /// Appends a validated name in place.
    pub fn try_push(&mut self, name: &[u8]) -> Result<(), PathError> {
        let component: PathComponent = name.try_into()?;
        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }
        self.inner.extend_from_slice(component.as_bytes());
        Ok(())
    }

    /// Iterates over the individual [PathComponent]s.
    /// The root yields an empty iterator.
    pub fn components(&self) -> impl Iterator<Item = PathComponent> + '_ {
        let mut iter = self.inner.split_str(&b"/");

        // Don't yield an empty element for the root.
        if self.inner.is_empty() {
            let _ = iter.next();
        }

        iter.map(|b| PathComponent {
            inner: bytes::Bytes::copy_from_slice(b),
        })
    }

    /// Returns the final component, if there is one.
    pub fn file_name(&self) -> Option<PathComponent> {
        self.components().last()
    }
}

impl FromStr for RepoPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, PathError> {
        Self::from_bytes(s.as_bytes())
    }
}

impl Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

impl Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::root("", vec![])]
    #[case::single("a", vec!["a"])]
    #[case::nested("a/b/c", vec!["a", "b", "c"])]
    fn parse_and_components(#[case] input: &str, #[case] expected: Vec<&str>) {
        let p: RepoPath = input.parse().expect("must parse");
        let components: Vec<_> = p.components().map(|c| c.to_string()).collect();
        assert_eq!(expected, components);
        assert_eq!(input, p.to_string());
    }

    #[rstest]
    #[case::empty_component("a//b")]
    #[case::dot("a/./b")]
    #[case::dotdot("a/../b")]
    #[case::leading_slash("/a")]
    #[case::trailing_slash("a/")]
    fn parse_rejects(#[case] input: &str) {
        assert!(input.parse::<RepoPath>().is_err(), "{input:?}");
    }

    #[test]
    fn parent_chain() {
        let p: RepoPath = "a/b/c".parse().unwrap();
        let parent = p.parent().unwrap();
        assert_eq!("a/b", parent.to_string());
        assert_eq!("a", parent.parent().unwrap().to_string());
        assert_eq!(RepoPath::root(), parent.parent().unwrap().parent().unwrap());
        assert!(RepoPath::root().parent().is_none());
    }

    #[test]
    fn join_and_file_name() {
        let base: RepoPath = "src".parse().unwrap();
        let name: PathComponent = "lib.rs".try_into().unwrap();
        let joined = base.join(&name);
        assert_eq!("src/lib.rs", joined.to_string());
        assert_eq!(Some(name), joined.file_name());
        assert!(RepoPath::root().file_name().is_none());
    }
}
