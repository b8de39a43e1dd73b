//! Structural query keys.
//!
//! A [`QueryKey`] is an ordered tuple of segments naming one cacheable remote
//! resource, e.g. `["repositories"]` or `["slides", "r1"]`. Keys compare and
//! hash by value, so two call sites that build the same tuple share one cache
//! entry, one in-flight fetch and one mutation queue.

use std::fmt;

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
    Str(String),
    Int(i64),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

/// Ordered, structurally compared identifier of a cacheable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Creates a key from any sequence of segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Returns the segments of this key.
    #[must_use]
    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{segment}")?;
        }
        f.write_str("]")
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(vec![value.into()])
    }
}

/// Builds a [`QueryKey`] from a list of segments.
///
/// ```
/// use slide_sync::query_key;
///
/// let repository_id = "r1";
/// let key = query_key!["slides", repository_id];
/// assert_eq!(key.to_string(), r#"["slides", "r1"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::key::QueryKey::new(
            ::std::vec![$($crate::key::KeySegment::from($segment)),*]
        )
    };
}
