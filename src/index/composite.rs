//! Building blocks for multi-segment composition.
//!
//! A composed reader maps its sub-readers into one document-number space
//! with a prefix-sum `starts` array: sub-reader `i` owns the numbers
//! `starts[i] .. starts[i + 1]`. Term enumerations merge k-way across the
//! sub-readers with document frequencies summed for equal terms; postings
//! cursors concatenate the sub-readers' cursors, offsetting each by its
//! start.

use crate::error::Result;
use crate::index::DocId;
use crate::index::reader::{TermDocs, TermEnum, TermPositions};
use crate::index::term::Term;

/// Compute the prefix-sum starts array from sub-reader document counts.
///
/// The result has one more entry than `max_docs`; the last entry is the
/// composed reader's total document count.
pub fn compute_starts(max_docs: &[u32]) -> Vec<u32> {
    let mut starts = Vec::with_capacity(max_docs.len() + 1);
    let mut total = 0;
    starts.push(0);
    for &count in max_docs {
        total += count;
        starts.push(total);
    }
    starts
}

/// The sub-reader owning document `doc`: the largest `i` with
/// `starts[i] <= doc`.
///
/// With empty sub-readers several starts coincide; ties resolve to the last
/// matching start, whose sub-reader actually holds documents.
pub fn reader_index(starts: &[u32], doc: DocId) -> usize {
    debug_assert!(starts.len() >= 2, "starts must cover at least one reader");
    let index = starts[..starts.len() - 1].partition_point(|&start| start <= doc);
    index.saturating_sub(1)
}

/// A k-way merged term enumeration over several sub-enumerations.
///
/// Terms arrive in field-then-text order exactly once each; the document
/// frequency of a term is the sum over every sub-enumeration positioned on
/// it.
pub struct MultiTermEnum {
    subs: Vec<Box<dyn TermEnum>>,
    exhausted: Vec<bool>,
    current: Option<(Term, u32)>,
}

impl MultiTermEnum {
    /// Merge freshly created (not yet advanced) sub-enumerations.
    pub fn new(mut subs: Vec<Box<dyn TermEnum>>) -> Result<Self> {
        let mut exhausted = Vec::with_capacity(subs.len());
        for sub in &mut subs {
            exhausted.push(!sub.next()?);
        }
        Ok(MultiTermEnum {
            subs,
            exhausted,
            current: None,
        })
    }
}

impl TermEnum for MultiTermEnum {
    fn next(&mut self) -> Result<bool> {
        let mut smallest: Option<Term> = None;
        for (i, sub) in self.subs.iter().enumerate() {
            if self.exhausted[i] {
                continue;
            }
            let term = sub.term().expect("live sub-enumeration has a term");
            if smallest.as_ref().is_none_or(|s| term < s) {
                smallest = Some(term.clone());
            }
        }

        let Some(term) = smallest else {
            self.current = None;
            return Ok(false);
        };

        let mut doc_freq = 0;
        for (i, sub) in self.subs.iter_mut().enumerate() {
            if self.exhausted[i] || sub.term() != Some(&term) {
                continue;
            }
            doc_freq += sub.doc_freq();
            self.exhausted[i] = !sub.next()?;
        }

        self.current = Some((term, doc_freq));
        Ok(true)
    }

    fn term(&self) -> Option<&Term> {
        self.current.as_ref().map(|(term, _)| term)
    }

    fn doc_freq(&self) -> u32 {
        self.current.as_ref().map(|(_, df)| *df).unwrap_or(0)
    }
}

/// Concatenated postings cursors, each offset by its sub-reader's start.
pub struct MultiPostings<C: ?Sized + TermDocs> {
    /// `(cursor, start)` per sub-reader, in reader order.
    subs: Vec<(Box<C>, u32)>,
    index: usize,
}

/// Concatenated document cursors.
pub type MultiTermDocs = MultiPostings<dyn TermDocs>;

/// Concatenated document-and-positions cursors.
pub type MultiTermPositions = MultiPostings<dyn TermPositions>;

impl<C: ?Sized + TermDocs> MultiPostings<C> {
    /// Compose per-sub cursors with their document-number bases.
    pub fn new(subs: Vec<(Box<C>, u32)>) -> Self {
        MultiPostings { subs, index: 0 }
    }
}

impl<C: ?Sized + TermDocs> TermDocs for MultiPostings<C> {
    fn next(&mut self) -> Result<bool> {
        while let Some((sub, _)) = self.subs.get_mut(self.index) {
            if sub.next()? {
                return Ok(true);
            }
            self.index += 1;
        }
        Ok(false)
    }

    fn doc(&self) -> DocId {
        let (sub, base) = &self.subs[self.index];
        base + sub.doc()
    }

    fn freq(&self) -> u32 {
        self.subs[self.index].0.freq()
    }

    fn skip_to(&mut self, target: DocId) -> Result<bool> {
        while let Some((sub, base)) = self.subs.get_mut(self.index) {
            if sub.skip_to(target.saturating_sub(*base))? {
                return Ok(true);
            }
            self.index += 1;
        }
        Ok(false)
    }
}

impl TermPositions for MultiPostings<dyn TermPositions> {
    fn next_position(&mut self) -> Result<u32> {
        self.subs[self.index].0.next_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_starts() {
        assert_eq!(compute_starts(&[]), vec![0]);
        assert_eq!(compute_starts(&[3, 0, 2]), vec![0, 3, 3, 5]);
    }

    #[test]
    fn test_reader_index_ties_to_last() {
        let starts = vec![0, 3, 3, 5];
        assert_eq!(reader_index(&starts, 0), 0);
        assert_eq!(reader_index(&starts, 2), 0);
        // Doc 3 belongs to the empty reader's successor.
        assert_eq!(reader_index(&starts, 3), 2);
        assert_eq!(reader_index(&starts, 4), 2);
    }

    /// A scripted term enumeration for merge tests.
    struct FixedTerms {
        terms: Vec<(Term, u32)>,
        at: usize,
        started: bool,
    }

    impl FixedTerms {
        fn new(terms: Vec<(&str, u32)>) -> Box<dyn TermEnum> {
            Box::new(FixedTerms {
                terms: terms
                    .into_iter()
                    .map(|(text, df)| (Term::new("body", text), df))
                    .collect(),
                at: 0,
                started: false,
            })
        }
    }

    impl TermEnum for FixedTerms {
        fn next(&mut self) -> Result<bool> {
            if self.started {
                self.at += 1;
            }
            self.started = true;
            Ok(self.at < self.terms.len())
        }

        fn term(&self) -> Option<&Term> {
            if !self.started {
                return None;
            }
            self.terms.get(self.at).map(|(term, _)| term)
        }

        fn doc_freq(&self) -> u32 {
            self.terms.get(self.at).map(|(_, df)| *df).unwrap_or(0)
        }
    }

    #[test]
    fn test_multi_term_enum_merges_and_sums() {
        let mut merged = MultiTermEnum::new(vec![
            FixedTerms::new(vec![("alpha", 2), ("gamma", 1)]),
            FixedTerms::new(vec![("alpha", 3), ("beta", 4)]),
            FixedTerms::new(vec![]),
        ])
        .unwrap();

        let mut seen = Vec::new();
        while merged.next().unwrap() {
            seen.push((merged.term().unwrap().text.clone(), merged.doc_freq()));
        }
        assert_eq!(
            seen,
            vec![
                ("alpha".to_string(), 5),
                ("beta".to_string(), 4),
                ("gamma".to_string(), 1),
            ]
        );
    }

    /// A scripted docs cursor for concatenation tests.
    struct FixedDocs {
        docs: Vec<u32>,
        at: Option<usize>,
    }

    impl FixedDocs {
        fn new(docs: Vec<u32>) -> Box<dyn TermDocs> {
            Box::new(FixedDocs { docs, at: None })
        }
    }

    impl TermDocs for FixedDocs {
        fn next(&mut self) -> Result<bool> {
            let next = self.at.map_or(0, |i| i + 1);
            self.at = Some(next);
            Ok(next < self.docs.len())
        }

        fn doc(&self) -> DocId {
            self.docs[self.at.unwrap()]
        }

        fn freq(&self) -> u32 {
            1
        }

        fn skip_to(&mut self, target: DocId) -> Result<bool> {
            loop {
                if !self.next()? {
                    return Ok(false);
                }
                if self.doc() >= target {
                    return Ok(true);
                }
            }
        }
    }

    #[test]
    fn test_multi_postings_offsets() {
        let mut cursor = MultiTermDocs::new(vec![
            (FixedDocs::new(vec![0, 2]), 0),
            (FixedDocs::new(vec![1]), 3),
        ]);

        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push(cursor.doc());
        }
        assert_eq!(seen, vec![0, 2, 4]);
    }

    #[test]
    fn test_multi_postings_skip_across_subs() {
        let mut cursor = MultiTermDocs::new(vec![
            (FixedDocs::new(vec![0, 2]), 0),
            (FixedDocs::new(vec![0, 4]), 3),
        ]);

        assert!(cursor.skip_to(3).unwrap());
        assert_eq!(cursor.doc(), 3);
        assert!(cursor.skip_to(5).unwrap());
        assert_eq!(cursor.doc(), 7);
        assert!(!cursor.skip_to(8).unwrap());
    }
}
