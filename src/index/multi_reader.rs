//! A reader composing several sub-readers into one document space.

use std::sync::Arc;

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::composite::{
    MultiPostings, MultiTermEnum, compute_starts, reader_index,
};
use crate::index::norms::Norms;
use crate::index::reader::{FieldSelector, IndexReader, TermDocs, TermEnum, TermPositions};
use crate::index::stored_fields::StoredDocument;
use crate::index::term::Term;
use crate::index::term_vectors::TermVector;

/// A single virtual document space over caller-supplied sub-readers.
///
/// Document numbers are assigned by concatenation: sub-reader `i`'s
/// documents occupy `starts[i] .. starts[i + 1]`. The composition itself is
/// immutable; the point-in-time guarantees are whatever the sub-readers
/// provide.
pub struct MultiReader {
    subs: Vec<Arc<dyn IndexReader>>,
    starts: Vec<u32>,
}

impl MultiReader {
    /// Compose the given readers, in order.
    pub fn new(subs: Vec<Arc<dyn IndexReader>>) -> Self {
        let max_docs: Vec<u32> = subs.iter().map(|r| r.max_doc()).collect();
        MultiReader {
            starts: compute_starts(&max_docs),
            subs,
        }
    }

    /// The composed sub-readers.
    pub fn sub_readers(&self) -> &[Arc<dyn IndexReader>] {
        &self.subs
    }

    /// The document-number starts, one per sub-reader plus the total.
    pub fn starts(&self) -> &[u32] {
        &self.starts
    }

    fn locate(&self, doc: DocId) -> Result<(usize, DocId)> {
        if doc >= self.max_doc() {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.max_doc()
            )));
        }
        let index = reader_index(&self.starts, doc);
        Ok((index, doc - self.starts[index]))
    }
}

impl IndexReader for MultiReader {
    fn max_doc(&self) -> u32 {
        *self.starts.last().unwrap_or(&0)
    }

    fn num_docs(&self) -> u32 {
        self.subs.iter().map(|r| r.num_docs()).sum()
    }

    fn has_deletions(&self) -> bool {
        self.subs.iter().any(|r| r.has_deletions())
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        match self.locate(doc) {
            Ok((index, local)) => self.subs[index].is_deleted(local),
            Err(_) => false,
        }
    }

    fn document(&self, doc: DocId, selector: &dyn FieldSelector) -> Result<StoredDocument> {
        let (index, local) = self.locate(doc)?;
        self.subs[index].document(local, selector)
    }

    fn terms(&self) -> Result<Box<dyn TermEnum>> {
        let subs = self
            .subs
            .iter()
            .map(|r| r.terms())
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(MultiTermEnum::new(subs)?))
    }

    fn terms_from(&self, from: &Term) -> Result<Box<dyn TermEnum>> {
        let subs = self
            .subs
            .iter()
            .map(|r| r.terms_from(from))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(MultiTermEnum::new(subs)?))
    }

    fn doc_freq(&self, term: &Term) -> Result<u32> {
        let mut total = 0;
        for sub in &self.subs {
            total += sub.doc_freq(term)?;
        }
        Ok(total)
    }

    fn term_docs(&self, term: &Term) -> Result<Box<dyn TermDocs>> {
        let mut cursors = Vec::with_capacity(self.subs.len());
        for (i, sub) in self.subs.iter().enumerate() {
            cursors.push((sub.term_docs(term)?, self.starts[i]));
        }
        Ok(Box::new(MultiPostings::new(cursors)))
    }

    fn term_positions(&self, term: &Term) -> Result<Box<dyn TermPositions>> {
        let mut cursors = Vec::with_capacity(self.subs.len());
        for (i, sub) in self.subs.iter().enumerate() {
            cursors.push((sub.term_positions(term)?, self.starts[i]));
        }
        Ok(Box::new(MultiPostings::new(cursors)))
    }

    fn norms(&self, field: &str) -> Result<Option<Vec<u8>>> {
        let columns = self
            .subs
            .iter()
            .map(|r| r.norms(field))
            .collect::<Result<Vec<_>>>()?;
        if columns.iter().all(Option::is_none) {
            return Ok(None);
        }

        // Sub-readers without the field contribute unit norms so the
        // composed column stays aligned with document numbers.
        let mut merged = Vec::with_capacity(self.max_doc() as usize);
        for (sub, column) in self.subs.iter().zip(columns) {
            match column {
                Some(bytes) => merged.extend_from_slice(&bytes),
                None => merged.extend(Norms::synthetic(sub.max_doc())),
            }
        }
        debug_assert_eq!(merged.len(), self.max_doc() as usize);
        Ok(Some(merged))
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<Vec<TermVector>>> {
        let (index, local) = self.locate(doc)?;
        self.subs[index].term_vectors(local)
    }
}
