#![forbid(unsafe_code)]

//! Sorted key-value streams and the cursors composed over them.
//!
//! Keys follow the layout of a sorted wide-column store: `row`,
//! `column_family`, `column_qualifier`, `visibility`, then `timestamp`
//! (newest first). Every stream implements [`SortedKeyValueIterator`] and
//! must be [`seek`](SortedKeyValueIterator::seek)ed before any accessor is
//! used.

mod ancestor;
mod equality;

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

pub use ancestor::AncestorChildExpansionIterator;
pub use equality::{AncestorEquality, Equality};

/// Separator between the parts of a field-index column qualifier.
pub const NULL_BYTE: u8 = 0;

/// Misuse or failure of a sorted stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IteratorError {
    /// An accessor was used before the first seek.
    #[error("iterator used before seek")]
    NotSeeked,
    /// The stream has no top entry.
    #[error("iterator has no top entry")]
    NoSuchElement,
    /// The underlying source failed.
    #[error("iterator source: {0}")]
    Source(String),
}

/// Result alias for iterator operations.
pub type IterResult<T> = std::result::Result<T, IteratorError>;

/// A sorted-store key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Row, typically a shard id.
    pub row: Bytes,
    /// Column family, `fi\0FIELD` for field index keys.
    pub column_family: Bytes,
    /// `value\0datatype\0uid` for field index keys.
    pub column_qualifier: Bytes,
    /// Column visibility expression.
    pub visibility: Bytes,
    /// Newer entries sort first.
    pub timestamp: i64,
}

impl Key {
    /// Builds a key from its parts.
    pub fn new(
        row: impl Into<Bytes>,
        column_family: impl Into<Bytes>,
        column_qualifier: impl Into<Bytes>,
        visibility: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            row: row.into(),
            column_family: column_family.into(),
            column_qualifier: column_qualifier.into(),
            visibility: visibility.into(),
            timestamp,
        }
    }

    /// The hierarchical identifier of a field-index key: the qualifier
    /// suffix after its last NUL byte, or the whole qualifier without one.
    pub fn uid(&self) -> &[u8] {
        let cq = self.column_qualifier.as_ref();
        match cq.iter().rposition(|b| *b == NULL_BYTE) {
            Some(idx) => &cq[idx + 1..],
            None => cq,
        }
    }

    /// Copy of this key with the identifier suffix replaced by `uid`.
    pub fn with_uid(&self, uid: &[u8]) -> Key {
        let cq = self.column_qualifier.as_ref();
        let prefix_len = cq.len() - self.uid().len();
        let mut qualifier = Vec::with_capacity(prefix_len + uid.len());
        qualifier.extend_from_slice(&cq[..prefix_len]);
        qualifier.extend_from_slice(uid);
        Key {
            row: self.row.clone(),
            column_family: self.column_family.clone(),
            column_qualifier: Bytes::from(qualifier),
            visibility: self.visibility.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column_family.cmp(&other.column_family))
            .then_with(|| self.column_qualifier.cmp(&other.column_qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |b: &Bytes| String::from_utf8_lossy(b).replace('\0', "\\x00");
        write!(
            f,
            "{} {}:{} [{}] {}",
            show(&self.row),
            show(&self.column_family),
            show(&self.column_qualifier),
            show(&self.visibility),
            self.timestamp
        )
    }
}

/// Opaque cell value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Value(pub Bytes);

impl From<&'static [u8]> for Value {
    fn from(bytes: &'static [u8]) -> Self {
        Value(Bytes::from_static(bytes))
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value(Bytes::from(bytes))
    }
}

/// Key range: `start` inclusive, `end` exclusive, either side unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Range {
    /// Inclusive lower bound.
    pub start: Option<Key>,
    /// Exclusive upper bound.
    pub end: Option<Key>,
}

impl Range {
    /// The unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    /// Range between two optional bounds.
    pub fn new(start: Option<Key>, end: Option<Key>) -> Self {
        Self { start, end }
    }

    /// Whether `key` sorts below the start bound.
    pub fn before_start(&self, key: &Key) -> bool {
        self.start.as_ref().is_some_and(|start| key < start)
    }

    /// Whether `key` sorts at or past the end bound.
    pub fn after_end(&self, key: &Key) -> bool {
        self.end.as_ref().is_some_and(|end| key >= end)
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        !self.before_start(key) && !self.after_end(key)
    }
}

/// A forward-only cursor over entries in [`Key`] order.
pub trait SortedKeyValueIterator {
    /// Positions the cursor on the first entry inside `range`.
    fn seek(&mut self, range: &Range) -> IterResult<()>;

    /// Whether a top entry is available.
    fn has_top(&self) -> IterResult<bool>;

    /// Key of the top entry.
    fn top_key(&self) -> IterResult<&Key>;

    /// Value of the top entry.
    fn top_value(&self) -> IterResult<&Value>;

    /// Advances past the current top entry.
    fn next(&mut self) -> IterResult<()>;
}

/// Drains `iter` from its current position.
pub fn collect_entries<I>(iter: &mut I) -> IterResult<Vec<(Key, Value)>>
where
    I: SortedKeyValueIterator + ?Sized,
{
    let mut out = Vec::new();
    while iter.has_top()? {
        out.push((iter.top_key()?.clone(), iter.top_value()?.clone()));
        iter.next()?;
    }
    Ok(out)
}

/// An in-memory sorted stream.
#[derive(Clone, Debug)]
pub struct VecIterator {
    entries: Vec<(Key, Value)>,
    range: Option<Range>,
    pos: usize,
}

impl VecIterator {
    /// Builds a stream over `entries`, sorting them by key.
    pub fn new(mut entries: Vec<(Key, Value)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entries,
            range: None,
            pos: 0,
        }
    }

    fn current(&self) -> IterResult<&(Key, Value)> {
        let range = self.range.as_ref().ok_or(IteratorError::NotSeeked)?;
        self.entries
            .get(self.pos)
            .filter(|(key, _)| !range.after_end(key))
            .ok_or(IteratorError::NoSuchElement)
    }
}

impl SortedKeyValueIterator for VecIterator {
    fn seek(&mut self, range: &Range) -> IterResult<()> {
        self.pos = self
            .entries
            .partition_point(|(key, _)| range.before_start(key));
        self.range = Some(range.clone());
        Ok(())
    }

    fn has_top(&self) -> IterResult<bool> {
        match self.current() {
            Ok(_) => Ok(true),
            Err(IteratorError::NoSuchElement) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn top_key(&self) -> IterResult<&Key> {
        self.current().map(|(key, _)| key)
    }

    fn top_value(&self) -> IterResult<&Value> {
        self.current().map(|(_, value)| value)
    }

    fn next(&mut self) -> IterResult<()> {
        self.current()?;
        self.pos += 1;
        Ok(())
    }
}
