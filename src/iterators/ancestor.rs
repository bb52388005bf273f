//! Expansion of field-index hits onto their hierarchy descendants.

use tracing::trace;

use super::{
    AncestorEquality, Equality, IterResult, IteratorError, Key, Range, SortedKeyValueIterator,
    Value,
};

/// Base hit whose descendant run is being emitted.
struct Hit {
    key: Key,
    value: Value,
}

/// Expands every hit of a base stream onto the identifiers in a sorted
/// descendant list that the hit covers.
///
/// For a hit on `X` the descendant cursor moves forward to the first
/// identifier `>= X` and one entry is synthesized per consecutive identifier
/// covered by `X`, carrying the hit's value, visibility and timestamp. The
/// cursor never moves backward, so a hit inside a run already emitted for an
/// earlier ancestor produces nothing new and the output stays strictly
/// sorted.
///
/// The cursor is shared by every hit of one seek. A seek range spanning
/// several rows or field values is treated as one sorted run: a later hit
/// whose identifier sorts before an identifier already passed yields
/// nothing. Seek one row and field value at a time to expand each
/// independently.
pub struct AncestorChildExpansionIterator<I, E = AncestorEquality> {
    base: I,
    descendants: Vec<Vec<u8>>,
    equality: E,
    cursor: usize,
    hit: Option<Hit>,
    top: Option<(Key, Value)>,
    seeked: bool,
}

impl<I, E> AncestorChildExpansionIterator<I, E>
where
    I: SortedKeyValueIterator,
    E: Equality,
{
    /// `descendants` is sorted and deduplicated bytewise on construction.
    pub fn new<S>(base: I, descendants: impl IntoIterator<Item = S>, equality: E) -> Self
    where
        S: AsRef<[u8]>,
    {
        let mut descendants: Vec<Vec<u8>> = descendants
            .into_iter()
            .map(|id| id.as_ref().to_vec())
            .collect();
        descendants.sort();
        descendants.dedup();
        Self {
            base,
            descendants,
            equality,
            cursor: 0,
            hit: None,
            top: None,
            seeked: false,
        }
    }

    fn top(&self) -> IterResult<&(Key, Value)> {
        if !self.seeked {
            return Err(IteratorError::NotSeeked);
        }
        self.top.as_ref().ok_or(IteratorError::NoSuchElement)
    }

    /// Finds the next synthesized entry, pulling base hits as runs end.
    fn advance(&mut self) -> IterResult<()> {
        loop {
            if let Some(hit) = &self.hit {
                if let Some(candidate) = self.descendants.get(self.cursor) {
                    if self.equality.covers(hit.key.uid(), candidate) {
                        self.top = Some((hit.key.with_uid(candidate), hit.value.clone()));
                        self.cursor += 1;
                        return Ok(());
                    }
                }
                self.hit = None;
            }

            if !self.base.has_top()? {
                self.top = None;
                return Ok(());
            }
            let key = self.base.top_key()?.clone();
            let value = self.base.top_value()?.clone();
            self.base.next()?;

            let uid = key.uid();
            let skip = self.descendants[self.cursor..].partition_point(|id| id.as_slice() < uid);
            self.cursor += skip;
            trace!(cursor = self.cursor, skipped = skip, "iterators.ancestor.hit");
            self.hit = Some(Hit { key, value });
        }
    }
}

impl<I, E> SortedKeyValueIterator for AncestorChildExpansionIterator<I, E>
where
    I: SortedKeyValueIterator,
    E: Equality,
{
    fn seek(&mut self, range: &Range) -> IterResult<()> {
        self.base.seek(range)?;
        self.seeked = true;
        self.cursor = 0;
        self.hit = None;
        self.top = None;
        self.advance()
    }

    fn has_top(&self) -> IterResult<bool> {
        if !self.seeked {
            return Err(IteratorError::NotSeeked);
        }
        Ok(self.top.is_some())
    }

    fn top_key(&self) -> IterResult<&Key> {
        self.top().map(|(key, _)| key)
    }

    fn top_value(&self) -> IterResult<&Value> {
        self.top().map(|(_, value)| value)
    }

    fn next(&mut self) -> IterResult<()> {
        self.top()?;
        self.advance()
    }
}
