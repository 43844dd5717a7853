//! Per-connection factory that parses `seqN` requests and creates the
//! (at most three) sequences live on a connection.

use std::collections::BTreeMap;
use std::fmt;

use crate::sequence::Sequence;

/// Errors `SequenceFactory::create` can report. Each variant's `Display`
/// text is the exact message the wire protocol sends back in an
/// `ERR: <message>` response, matched character for character against
/// what `original_source/Sequence.cpp`'s `createSeq` throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryError {
    BadRequest,
    IdOutOfRange,
    InvalidStart,
    InvalidStep,
    AlreadyExists,
}

impl fmt::Display for FactoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FactoryError::BadRequest => "Bad request",
            FactoryError::IdOutOfRange => "Sequence number must be in range [1;3]",
            FactoryError::InvalidStart => "Start parameter not valid",
            FactoryError::InvalidStep => "Step parameter not valid",
            FactoryError::AlreadyExists => "Sequence already exists",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FactoryError {}

/// Per-connection `{1,2,3} -> Sequence}` map. Keys are kept in a
/// `BTreeMap` so iteration (for `row()`) is always in ascending id
/// order, giving a deterministic row layout.
#[derive(Default)]
pub struct SequenceFactory {
    sequences: BTreeMap<u8, Sequence>,
}

impl SequenceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a line of the exact shape `seq<D> <START> <STEP>` and, on
    /// success, registers a new sequence. `<D>` is a single decimal
    /// digit, `<START>`/`<STEP>` are decimal `u64` with exactly one
    /// space between each token.
    pub fn create(&mut self, line: &str) -> Result<(), FactoryError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (id, start, step) = parse_seq_line(line).ok_or(FactoryError::BadRequest)?;

        if !(1..=3).contains(&id) {
            return Err(FactoryError::IdOutOfRange);
        }
        if start == 0 {
            return Err(FactoryError::InvalidStart);
        }
        if step == 0 {
            return Err(FactoryError::InvalidStep);
        }
        if self.sequences.contains_key(&id) {
            return Err(FactoryError::AlreadyExists);
        }

        self.sequences.insert(id, Sequence::new(start, step));
        Ok(())
    }

    /// Returns a tab-separated row of `next()` values in ascending id
    /// order, or the empty string when no sequences are registered.
    pub fn row(&self) -> String {
        let mut row = String::new();
        for seq in self.sequences.values() {
            if !row.is_empty() {
                row.push('\t');
            }
            row.push_str(&seq.next().to_string());
        }
        row
    }

    /// Whether any sequence has been registered on this connection.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Tokenizes `seq<D> <U> <U>`. Returns `None` on any mismatch: missing
/// `seq` prefix, a digit run of length != 1, wrong token count (no
/// extra or missing spaces tolerated), or a non-decimal `<U>`.
fn parse_seq_line(line: &str) -> Option<(u8, u64, u64)> {
    let mut tokens = line.split(' ');

    let head = tokens.next()?;
    let digits = head.strip_prefix("seq")?;
    if digits.len() != 1 || !digits.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    let id: u8 = digits.parse().ok()?;

    let start: u64 = tokens.next()?.parse().ok()?;
    let step: u64 = tokens.next()?.parse().ok()?;

    if tokens.next().is_some() {
        return None;
    }

    Some((id, start, step))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_sequence_and_appears_in_row() {
        let mut f = SequenceFactory::new();
        f.create("seq1 1 2").unwrap();
        assert_eq!(f.row(), "1");
        assert_eq!(f.row(), "3");
    }

    #[test]
    fn three_sequences_row_in_ascending_key_order() {
        let mut f = SequenceFactory::new();
        f.create("seq3 3 4").unwrap();
        f.create("seq1 1 2").unwrap();
        f.create("seq2 2 3").unwrap();
        assert_eq!(f.row(), "1\t2\t3");
        assert_eq!(f.row(), "3\t5\t7");
    }

    #[test]
    fn empty_factory_row_is_empty_string() {
        let f = SequenceFactory::new();
        assert_eq!(f.row(), "");
    }

    #[test]
    fn rejects_bad_tokenization() {
        let mut f = SequenceFactory::new();
        assert_eq!(f.create("hello"), Err(FactoryError::BadRequest));
        assert_eq!(f.create("seq1 1"), Err(FactoryError::BadRequest));
        assert_eq!(f.create("seq1 1 2 3"), Err(FactoryError::BadRequest));
        assert_eq!(f.create("seq1  1 2"), Err(FactoryError::BadRequest));
        assert_eq!(f.create("seq11 1 2"), Err(FactoryError::BadRequest));
        assert_eq!(f.create("seqa 1 2"), Err(FactoryError::BadRequest));
        assert_eq!(f.create("seq1 x 2"), Err(FactoryError::BadRequest));
    }

    #[test]
    fn rejects_out_of_range_id() {
        let mut f = SequenceFactory::new();
        assert_eq!(f.create("seq4 1 1"), Err(FactoryError::IdOutOfRange));
        assert_eq!(f.create("seq0 1 1"), Err(FactoryError::IdOutOfRange));
    }

    #[test]
    fn rejects_zero_start_or_step() {
        let mut f = SequenceFactory::new();
        assert_eq!(f.create("seq1 0 1"), Err(FactoryError::InvalidStart));
        assert_eq!(f.create("seq1 1 0"), Err(FactoryError::InvalidStep));
    }

    #[test]
    fn rejects_duplicate_id() {
        let mut f = SequenceFactory::new();
        f.create("seq1 1 2").unwrap();
        assert_eq!(f.create("seq1 5 5"), Err(FactoryError::AlreadyExists));
    }

    #[test]
    fn error_display_matches_wire_text() {
        assert_eq!(FactoryError::BadRequest.to_string(), "Bad request");
        assert_eq!(
            FactoryError::IdOutOfRange.to_string(),
            "Sequence number must be in range [1;3]"
        );
        assert_eq!(
            FactoryError::InvalidStart.to_string(),
            "Start parameter not valid"
        );
        assert_eq!(
            FactoryError::InvalidStep.to_string(),
            "Step parameter not valid"
        );
        assert_eq!(
            FactoryError::AlreadyExists.to_string(),
            "Sequence already exists"
        );
    }
}
