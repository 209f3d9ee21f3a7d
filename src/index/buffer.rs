//! The in-memory documents buffer behind the writer.
//!
//! Documents are inverted as they arrive: tokens land in a sorted postings
//! map, stored values and vectors are encoded per document, and norm bytes
//! accumulate per field column. A flush streams the whole buffer out as one
//! immutable segment through the per-format writers. Deletes buffer as
//! terms with a document-id limit so an update's delete never touches the
//! document added with it.

use std::collections::BTreeMap;

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::document::Document;
use crate::index::field_infos::FieldInfos;
use crate::index::filenames;
use crate::index::norms::{self, Norms};
use crate::index::postings::PostingsWriter;
use crate::index::segment_info::SegmentInfo;
use crate::index::stored_fields::{FieldsWriter, StoredFieldEntry};
use crate::index::term::Term;
use crate::index::term_vectors::{TermVectorEntry, TermVectorFieldData, TermVectorsWriter};
use crate::index::terms::{TermDictTuning, TermDictWriter};
use crate::storage::traits::Storage;

/// Rough per-token bookkeeping overhead used for RAM accounting.
const TOKEN_OVERHEAD: usize = 48;
/// Rough per-document bookkeeping overhead.
const DOC_OVERHEAD: usize = 64;

#[derive(Debug, Default)]
struct PostingList {
    /// `(doc, freq)` in increasing doc order.
    docs: Vec<(DocId, u32)>,
    /// Positions per doc, parallel to `docs`; empty when positions are
    /// omitted for the field.
    positions: Vec<Vec<u32>>,
}

/// Buffered documents and deletes awaiting a flush.
#[derive(Debug, Default)]
pub struct DocumentsBuffer {
    field_infos: FieldInfos,
    postings: BTreeMap<Term, PostingList>,
    stored: Vec<Vec<StoredFieldEntry>>,
    vectors: Vec<Vec<TermVectorFieldData>>,
    /// Field number to one norm byte per document seen so far.
    norm_columns: BTreeMap<u32, Vec<u8>>,
    /// Delete term to the count of buffered docs when the delete arrived;
    /// buffered docs at or past the limit are not affected.
    delete_terms: BTreeMap<Term, u32>,
    doc_count: u32,
    ram_bytes: usize,
}

impl DocumentsBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        DocumentsBuffer::default()
    }

    /// Number of buffered documents.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Number of distinct buffered delete terms.
    pub fn delete_term_count(&self) -> usize {
        self.delete_terms.len()
    }

    /// Estimated RAM held by the buffer.
    pub fn ram_bytes(&self) -> usize {
        self.ram_bytes
    }

    /// True if a flush would produce neither a segment nor deletes.
    pub fn is_empty(&self) -> bool {
        self.doc_count == 0 && self.delete_terms.is_empty()
    }

    /// Invert and buffer one document; returns its buffer-local number.
    pub fn add_document(&mut self, doc: &Document) -> Result<DocId> {
        let doc_id = self.doc_count;
        let mut stored = Vec::new();
        let mut vectors = Vec::new();
        let mut ram = DOC_OVERHEAD;

        for field in &doc.fields {
            let number = self.field_infos.add(
                &field.name,
                field.options.indexed,
                field.options.store_term_vector,
                field.options.store_positions_with_vector,
                field.options.store_offsets_with_vector,
                field.options.omit_norms,
                field.options.omit_positions,
            );
            let info = self.field_infos.by_number(number).cloned().ok_or_else(|| {
                KopisError::index(format!("field {} vanished from the table", field.name))
            })?;

            if field.options.indexed {
                // Aggregate the token stream per distinct term.
                let mut by_term: BTreeMap<&str, TermVectorEntry> = BTreeMap::new();
                for token in &field.tokens {
                    let entry = by_term.entry(&token.text).or_default();
                    entry.freq += 1;
                    entry.positions.push(token.position);
                    entry
                        .offsets
                        .push((token.start_offset, token.end_offset));
                    ram += TOKEN_OVERHEAD + token.text.len();
                }

                for (text, entry) in &by_term {
                    let term = Term::new(field.name.clone(), *text);
                    let posting = self.postings.entry(term).or_default();
                    // A repeated field instance folds into the entry the
                    // earlier instance created for this document.
                    match posting.docs.last_mut() {
                        Some((doc, freq)) if *doc == doc_id => {
                            *freq += entry.freq;
                            if !info.omit_positions
                                && let Some(positions) = posting.positions.last_mut()
                            {
                                positions.extend_from_slice(&entry.positions);
                                positions.sort_unstable();
                            }
                        }
                        _ => {
                            posting.docs.push((doc_id, entry.freq));
                            posting.positions.push(if info.omit_positions {
                                Vec::new()
                            } else {
                                entry.positions.clone()
                            });
                        }
                    }
                }

                if info.has_norms() {
                    let column = self.norm_columns.entry(number).or_default();
                    column.resize(doc_id as usize, norms::encode_norm(1.0));
                    column.push(norms::field_norm(field.options.boost, field.tokens.len()));
                }

                if info.store_term_vector {
                    vectors.push(TermVectorFieldData {
                        field_number: number,
                        store_positions: info.store_positions_with_vector,
                        store_offsets: info.store_offsets_with_vector,
                        entries: by_term
                            .into_values()
                            .map(|mut e| {
                                if !info.store_positions_with_vector {
                                    e.positions.clear();
                                }
                                if !info.store_offsets_with_vector {
                                    e.offsets.clear();
                                }
                                e
                            })
                            .collect(),
                    });
                }
            }

            if field.options.stored {
                let value = field.stored.as_ref().ok_or_else(|| {
                    KopisError::invalid_operation(format!(
                        "field {} is marked stored but carries no value",
                        field.name
                    ))
                })?;
                let (binary, bytes) = match value {
                    crate::index::document::StoredValue::Text(s) => {
                        (false, s.as_bytes().to_vec())
                    }
                    crate::index::document::StoredValue::Binary(b) => (true, b.clone()),
                };
                ram += bytes.len() + 24;
                stored.push(StoredFieldEntry {
                    field_number: number,
                    binary,
                    bytes,
                });
            }
        }

        stored.sort_by_key(|e| e.field_number);
        vectors.sort_by_key(|v| v.field_number);
        self.stored.push(stored);
        self.vectors.push(vectors);
        self.doc_count += 1;
        self.ram_bytes += ram;
        Ok(doc_id)
    }

    /// Buffer a delete-by-term covering every document buffered so far
    /// (and all previously flushed segments, applied at flush time).
    pub fn delete_term(&mut self, term: &Term) {
        self.ram_bytes += term.field.len() + term.text.len() + TOKEN_OVERHEAD;
        self.delete_terms.insert(term.clone(), self.doc_count);
    }

    /// The buffered delete terms with their doc-id limits.
    ///
    /// The set is left in place; a flush clears it via [`reset`] only once
    /// the new state is safely checkpointed.
    ///
    /// [`reset`]: DocumentsBuffer::reset
    pub fn delete_terms(&self) -> Vec<(Term, u32)> {
        self.delete_terms
            .iter()
            .map(|(term, limit)| (term.clone(), *limit))
            .collect()
    }

    /// Write the buffered documents as the segment `segment`.
    ///
    /// The buffer itself is untouched; the caller resets it once the new
    /// segment is safely checkpointed. On error the caller removes the
    /// partial files.
    pub fn flush(
        &self,
        storage: &dyn Storage,
        segment: &str,
        tuning: TermDictTuning,
    ) -> Result<SegmentInfo> {
        if self.doc_count == 0 {
            return Err(KopisError::invalid_operation(
                "flush of an empty document buffer",
            ));
        }

        self.field_infos.write(
            storage,
            &filenames::segment_file_name(segment, filenames::FIELD_INFOS_EXT),
        )?;

        let mut fields_writer = FieldsWriter::new(storage, segment)?;
        for stored in &self.stored {
            fields_writer.add_document(stored)?;
        }
        fields_writer.close()?;

        let mut dict = TermDictWriter::new(storage, segment, tuning)?;
        let mut postings = PostingsWriter::new(
            storage,
            segment,
            tuning.skip_interval,
            tuning.max_skip_levels,
        )?;
        for (term, list) in &self.postings {
            let number = self
                .field_infos
                .by_name(&term.field)
                .map(|f| f.number)
                .ok_or_else(|| {
                    KopisError::index(format!("posting for unregistered field {}", term.field))
                })?;
            postings.start_term();
            for ((doc, freq), positions) in list.docs.iter().zip(&list.positions) {
                postings.add_doc(*doc, *freq, positions)?;
            }
            let info = postings.end_term()?;
            dict.add(term, number, &info)?;
        }
        postings.close()?;
        dict.close()?;

        if self.field_infos.has_norms() {
            let mut segment_norms = Norms::new();
            for (&number, column) in &self.norm_columns {
                let mut bytes = column.clone();
                bytes.resize(self.doc_count as usize, norms::encode_norm(1.0));
                segment_norms.push(number, bytes);
            }
            segment_norms.write(
                storage,
                &filenames::segment_gen_file_name(segment, filenames::NORMS_EXT, 0),
                self.doc_count,
            )?;
        }

        if self.field_infos.has_vectors() {
            let mut vectors_writer = TermVectorsWriter::new(storage, segment)?;
            for doc_vectors in &self.vectors {
                vectors_writer.add_document(doc_vectors)?;
            }
            vectors_writer.close()?;
        }

        let mut info = SegmentInfo::new(segment, self.doc_count);
        info.has_prox = self.field_infos.has_prox();
        info.has_norms = self.field_infos.has_norms();
        info.has_vectors = self.field_infos.has_vectors();
        Ok(info)
    }

    /// Drop everything buffered.
    pub fn reset(&mut self) {
        *self = DocumentsBuffer::new();
    }
}
