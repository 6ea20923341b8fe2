//! # Key-Set Codec
//!
//! Range encoding of primary-key sets ("1,3-7,9") and the reconciliation
//! merge that diffs a client's known keys against the keys that exist.
//!
//! A known-set must be strictly ascending: every token starts after the
//! previous token ends, and ranges are written `start-end` with `start < end`.
//! Keys are positive.

use std::fmt::Write;

use super::errors::{StreamError, StreamResult};

/// Lazily parsed known-key runs.
///
/// Yields each token as an inclusive `(start, end)` run without expanding
/// it, so the cost of walking a known-set is linear in its token count.
#[derive(Debug, Clone)]
pub struct KnownRanges<'a> {
    tokens: Option<std::str::Split<'a, char>>,
    last: Option<i64>,
}

impl<'a> KnownRanges<'a> {
    /// Start parsing a range-encoded string.
    pub fn new(encoded: &'a str) -> Self {
        let tokens = if encoded.is_empty() {
            None
        } else {
            Some(encoded.split(','))
        };
        Self { tokens, last: None }
    }

    fn parse_token(&self, token: &str) -> StreamResult<(i64, i64)> {
        let (start, end) = match token.split_once('-') {
            Some((start, end)) => {
                let start = parse_key(start, token)?;
                let end = parse_key(end, token)?;
                if start >= end {
                    return Err(StreamError::InvalidKeySet(format!(
                        "range {} must have start < end",
                        token
                    )));
                }
                (start, end)
            }
            None => {
                let key = parse_key(token, token)?;
                (key, key)
            }
        };

        if let Some(last) = self.last {
            if start <= last {
                return Err(StreamError::InvalidKeySet(format!(
                    "token {} is not ascending after {}",
                    token, last
                )));
            }
        }
        Ok((start, end))
    }
}

// Keys are positive; the empty string is the only way to say "none"
fn parse_key(text: &str, token: &str) -> StreamResult<i64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StreamError::InvalidKeySet(format!(
            "token {:?} is not an integer or range",
            token
        )));
    }
    let key = text
        .parse::<i64>()
        .map_err(|e| StreamError::InvalidKeySet(format!("token {:?}: {}", token, e)))?;
    if key < 1 {
        return Err(StreamError::InvalidKeySet(format!(
            "token {:?}: keys start at 1",
            token
        )));
    }
    Ok(key)
}

impl Iterator for KnownRanges<'_> {
    type Item = StreamResult<(i64, i64)>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.tokens.as_mut()?.next()?;
        match self.parse_token(token) {
            Ok(run) => {
                self.last = Some(run.1);
                Some(Ok(run))
            }
            Err(e) => {
                // Stop after the first error
                self.tokens = None;
                Some(Err(e))
            }
        }
    }
}

/// Incremental range encoder; keys and runs must be pushed in ascending
/// order. Adjacent runs are merged.
#[derive(Debug, Default)]
pub struct RangeEncoder {
    out: String,
    run: Option<(i64, i64)>,
}

impl RangeEncoder {
    /// Create an empty encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one key
    pub fn push(&mut self, key: i64) {
        self.push_range(key, key);
    }

    /// Append the inclusive run `start..=end`
    pub fn push_range(&mut self, start: i64, end: i64) {
        debug_assert!(start <= end, "run {}-{} is inverted", start, end);
        match self.run {
            Some((run_start, run_end)) if run_end.checked_add(1) == Some(start) => {
                self.run = Some((run_start, end));
            }
            Some(run) => {
                debug_assert!(start > run.1, "runs must be pushed in ascending order");
                self.flush(run);
                self.run = Some((start, end));
            }
            None => self.run = Some((start, end)),
        }
    }

    fn flush(&mut self, (start, end): (i64, i64)) {
        if !self.out.is_empty() {
            self.out.push(',');
        }
        // Writing to a String cannot fail
        let _ = if start == end {
            write!(self.out, "{}", start)
        } else {
            write!(self.out, "{}-{}", start, end)
        };
    }

    /// Finish encoding and return the range string
    pub fn finish(mut self) -> String {
        if let Some(run) = self.run.take() {
            self.flush(run);
        }
        self.out
    }
}

/// Decode a range string into an ascending key list.
///
/// Expands every range, so only use it on sets of known, bounded size.
/// Client input goes through [`normalize`] or [`reconcile`] instead.
pub fn decode(encoded: &str) -> StreamResult<Vec<i64>> {
    let mut keys = Vec::new();
    for run in KnownRanges::new(encoded) {
        let (start, end) = run?;
        keys.extend(start..=end);
    }
    Ok(keys)
}

/// Encode an ascending, deduplicated key list with maximal run compaction.
pub fn encode(keys: &[i64]) -> String {
    let mut encoder = RangeEncoder::new();
    for &key in keys {
        encoder.push(key);
    }
    encoder.finish()
}

/// Validate a known-set and re-encode it with maximal run compaction.
pub fn normalize(encoded: &str) -> StreamResult<String> {
    let mut encoder = RangeEncoder::new();
    for run in KnownRanges::new(encoded) {
        let (start, end) = run?;
        encoder.push_range(start, end);
    }
    Ok(encoder.finish())
}

/// Reconciliation outcome for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reconciled {
    /// Known keys that no longer exist, range-encoded
    pub removed: String,
    /// Existing keys the client did not know about, in `exists` order
    pub appeared: Vec<i64>,
}

/// Diff a client's known-set against the ascending list of keys that exist.
///
/// Known runs are clipped around each existing key rather than expanded, so
/// the walk is linear in the number of tokens plus the length of `exists`.
pub fn reconcile(known: &str, exists: &[i64]) -> StreamResult<Reconciled> {
    let mut runs = KnownRanges::new(known);
    let mut removed = RangeEncoder::new();
    let mut appeared = Vec::new();

    let mut current = runs.next().transpose()?;
    let mut previous_exists: Option<i64> = None;

    for &key in exists {
        // Skip repeated exists values so appeared never holds duplicates
        if previous_exists == Some(key) {
            continue;
        }
        previous_exists = Some(key);

        // Every run that ends before this key is gone entirely
        while let Some((start, end)) = current {
            if end >= key {
                break;
            }
            removed.push_range(start, end);
            current = runs.next().transpose()?;
        }

        match current {
            Some((start, end)) if start <= key => {
                if start < key {
                    removed.push_range(start, key - 1);
                }
                current = if key < end {
                    Some((key + 1, end))
                } else {
                    runs.next().transpose()?
                };
            }
            _ => appeared.push(key),
        }
    }

    while let Some((start, end)) = current {
        removed.push_range(start, end);
        current = runs.next().transpose()?;
    }

    Ok(Reconciled {
        removed: removed.finish(),
        appeared,
    })
}
