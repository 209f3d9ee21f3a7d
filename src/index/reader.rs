//! The reader capability interface.
//!
//! Every reader variant (single segment, multi-segment composition,
//! filtering decorator) implements [`IndexReader`] and composes by explicit
//! delegation. Term enumerations and postings cursors are trait objects the
//! variants hand out; all of them own their underlying inputs, so a cursor
//! outlives nothing but itself.

use std::sync::Arc;

use crate::error::Result;
use crate::index::DocId;
use crate::index::stored_fields::StoredDocument;
use crate::index::term::Term;
use crate::index::term_vectors::TermVector;

/// A sorted, lazy enumeration of terms.
///
/// Freshly created enumerations are positioned before the first term; the
/// first `next` call moves onto it. Enumerations are restartable only by
/// asking the reader for a new one.
pub trait TermEnum {
    /// Advance to the next term. Returns false at the end.
    fn next(&mut self) -> Result<bool>;

    /// The current term, or `None` before the first `next` / after the end.
    fn term(&self) -> Option<&Term>;

    /// Document frequency of the current term.
    fn doc_freq(&self) -> u32;
}

/// A cursor over the documents containing one term.
///
/// Deleted documents are never yielded. Documents arrive in increasing
/// order of document number.
pub trait TermDocs {
    /// Advance to the next live document. Returns false at the end.
    fn next(&mut self) -> Result<bool>;

    /// The current document number.
    fn doc(&self) -> DocId;

    /// How often the term occurs in the current document.
    fn freq(&self) -> u32;

    /// Advance to the first live document at or past `target`.
    fn skip_to(&mut self, target: DocId) -> Result<bool>;
}

/// A [`TermDocs`] cursor that also exposes within-document positions.
pub trait TermPositions: TermDocs {
    /// The next position of the term in the current document. Must be
    /// called at most `freq()` times per document.
    fn next_position(&mut self) -> Result<u32>;
}

/// A cursor over a term that occurs nowhere.
pub struct EmptyTermDocs;

impl TermDocs for EmptyTermDocs {
    fn next(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn doc(&self) -> DocId {
        0
    }

    fn freq(&self) -> u32 {
        0
    }

    fn skip_to(&mut self, _target: DocId) -> Result<bool> {
        Ok(false)
    }
}

impl TermPositions for EmptyTermDocs {
    fn next_position(&mut self) -> Result<u32> {
        Err(crate::error::KopisError::invalid_operation(
            "cursor is positioned on no document",
        ))
    }
}

/// How a stored field should be materialized by [`IndexReader::document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelection {
    /// Decode the value fully.
    Load,
    /// Load for merging: the value is kept in its raw stored form and not
    /// validated, since it is only copied onward.
    LoadForMerge,
    /// Defer decoding until the value is first accessed.
    Lazy,
    /// Report only the value's size in bytes.
    SizeOnly,
    /// Leave the field out entirely.
    Skip,
}

/// Per-field load policy for partial document retrieval.
pub trait FieldSelector: Send + Sync {
    /// Decide how to materialize the named field.
    fn select(&self, field: &str) -> FieldSelection;
}

impl<F> FieldSelector for F
where
    F: Fn(&str) -> FieldSelection + Send + Sync,
{
    fn select(&self, field: &str) -> FieldSelection {
        self(field)
    }
}

/// The default selector: load every field fully.
pub struct LoadAll;

impl FieldSelector for LoadAll {
    fn select(&self, _field: &str) -> FieldSelection {
        FieldSelection::Load
    }
}

/// Options applied when opening readers.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Return an all-ones norm array for fields that store no norms,
    /// instead of `None`.
    pub synthesize_missing_norms: bool,

    /// How long a mutating reader operation waits for the write lock.
    pub lock_timeout_ms: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            synthesize_missing_norms: false,
            lock_timeout_ms: 1000,
        }
    }
}

/// A fixed, point-in-time view over indexed documents.
///
/// All methods observe the state of the index as of the moment the reader
/// was opened (or reopened); a writer mutating the index underneath never
/// changes what an open reader returns.
pub trait IndexReader: Send + Sync {
    /// One more than the largest document number, deleted documents
    /// included.
    fn max_doc(&self) -> u32;

    /// Number of live (non-deleted) documents.
    fn num_docs(&self) -> u32;

    /// True if any document is marked deleted.
    fn has_deletions(&self) -> bool;

    /// True if the given document is marked deleted.
    fn is_deleted(&self, doc: DocId) -> bool;

    /// Stored fields of one document, materialized per `selector`.
    fn document(&self, doc: DocId, selector: &dyn FieldSelector) -> Result<StoredDocument>;

    /// Enumerate all terms from the beginning.
    fn terms(&self) -> Result<Box<dyn TermEnum>>;

    /// Enumerate terms starting at the first term at or after `from`.
    fn terms_from(&self, from: &Term) -> Result<Box<dyn TermEnum>>;

    /// Number of live documents containing the term.
    fn doc_freq(&self, term: &Term) -> Result<u32>;

    /// Iterate the documents containing the term.
    fn term_docs(&self, term: &Term) -> Result<Box<dyn TermDocs>>;

    /// Iterate documents and positions of the term.
    fn term_positions(&self, term: &Term) -> Result<Box<dyn TermPositions>>;

    /// One norm byte per document for the field, or `None` when the field
    /// stores no norms (unless synthesis is enabled).
    fn norms(&self, field: &str) -> Result<Option<Vec<u8>>>;

    /// The term vectors stored for one document, or `None` when the
    /// document (or the whole index) has none.
    fn term_vectors(&self, doc: DocId) -> Result<Option<Vec<TermVector>>>;
}

/// A delegating decorator over another reader.
///
/// Filtering variants embed one and override the methods whose behavior
/// they change; everything else falls through to the inner reader.
pub struct FilterReader {
    inner: Arc<dyn IndexReader>,
}

impl FilterReader {
    /// Wrap a reader.
    pub fn new(inner: Arc<dyn IndexReader>) -> Self {
        FilterReader { inner }
    }

    /// The wrapped reader.
    pub fn inner(&self) -> &Arc<dyn IndexReader> {
        &self.inner
    }
}

impl IndexReader for FilterReader {
    fn max_doc(&self) -> u32 {
        self.inner.max_doc()
    }

    fn num_docs(&self) -> u32 {
        self.inner.num_docs()
    }

    fn has_deletions(&self) -> bool {
        self.inner.has_deletions()
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.inner.is_deleted(doc)
    }

    fn document(&self, doc: DocId, selector: &dyn FieldSelector) -> Result<StoredDocument> {
        self.inner.document(doc, selector)
    }

    fn terms(&self) -> Result<Box<dyn TermEnum>> {
        self.inner.terms()
    }

    fn terms_from(&self, from: &Term) -> Result<Box<dyn TermEnum>> {
        self.inner.terms_from(from)
    }

    fn doc_freq(&self, term: &Term) -> Result<u32> {
        self.inner.doc_freq(term)
    }

    fn term_docs(&self, term: &Term) -> Result<Box<dyn TermDocs>> {
        self.inner.term_docs(term)
    }

    fn term_positions(&self, term: &Term) -> Result<Box<dyn TermPositions>> {
        self.inner.term_positions(term)
    }

    fn norms(&self, field: &str) -> Result<Option<Vec<u8>>> {
        self.inner.norms(field)
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<Vec<TermVector>>> {
        self.inner.term_vectors(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_term_docs() {
        let mut cursor = EmptyTermDocs;
        assert!(!cursor.next().unwrap());
        assert!(!cursor.skip_to(10).unwrap());
        assert!(cursor.next_position().is_err());
    }

    #[test]
    fn test_closure_selector() {
        let selector = |field: &str| {
            if field == "body" {
                FieldSelection::Load
            } else {
                FieldSelection::Skip
            }
        };
        assert_eq!(selector.select("body"), FieldSelection::Load);
        assert_eq!(selector.select("title"), FieldSelection::Skip);
        assert_eq!(LoadAll.select("anything"), FieldSelection::Load);
    }
}
