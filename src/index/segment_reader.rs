//! The single-segment reader.
//!
//! The immutable per-segment resources (field table, term dictionary,
//! stored fields, vectors) live in a [`SegmentCore`] shared behind `Arc`
//! between clones and reopened readers. Deletion and norm state is held
//! copy-on-write: mutations swap in a fresh snapshot, so cursors and cloned
//! readers keep the view they started with. An explicit reference count
//! tracks how many owners still use the reader; pending deletion/norm
//! changes are written out as the next `.del`/`.nrm` generation by
//! [`SegmentReader::commit_pending`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::bit_vector::BitVector;
use crate::index::compound::CompoundFileReader;
use crate::index::field_infos::FieldInfos;
use crate::index::filenames;
use crate::index::norms::Norms;
use crate::index::postings::SegmentPostings;
use crate::index::reader::{
    EmptyTermDocs, FieldSelector, IndexReader, TermDocs, TermEnum, TermPositions,
};
use crate::index::segment_info::SegmentInfo;
use crate::index::stored_fields::{FieldsReader, StoredDocument};
use crate::index::term::Term;
use crate::index::term_vectors::{TermVector, TermVectorsReader};
use crate::index::terms::{SegmentTermEnum, TermDictReader};
use crate::storage::traits::{Storage, StorageInput};

/// The shared, immutable resources of one open segment.
///
/// Every file is opened once here; cursors read through private clones of
/// the held handles, so the reader's point-in-time view survives the
/// deleter reclaiming superseded files underneath it.
pub struct SegmentCore {
    segment: String,
    field_infos: Arc<FieldInfos>,
    term_dict: TermDictReader,
    fields: FieldsReader,
    vectors: Option<TermVectorsReader>,
    freq: Mutex<Box<dyn StorageInput>>,
    prox: Mutex<Box<dyn StorageInput>>,
}

/// A point-in-time reader over one segment.
pub struct SegmentReader {
    /// The outer directory, for deletes/norms generations and commits.
    storage: Arc<dyn Storage>,
    core: Arc<SegmentCore>,
    info: RwLock<SegmentInfo>,
    deleted: RwLock<Option<Arc<BitVector>>>,
    norms: RwLock<Arc<Norms>>,
    deletions_dirty: AtomicBool,
    norms_dirty: AtomicBool,
    ref_count: AtomicU32,
    synthesize_missing_norms: bool,
    /// Offset of this segment's documents in a shared doc store.
    doc_offset: u32,
    doc_count: u32,
}

impl SegmentReader {
    /// Open a reader over one segment.
    pub fn open(
        storage: Arc<dyn Storage>,
        info: &SegmentInfo,
        synthesize_missing_norms: bool,
    ) -> Result<Self> {
        let source: Arc<dyn Storage> = if info.use_compound {
            Arc::new(CompoundFileReader::open(
                Arc::clone(&storage),
                &filenames::segment_file_name(&info.name, filenames::COMPOUND_EXT),
            )?)
        } else {
            Arc::clone(&storage)
        };

        let field_infos = Arc::new(FieldInfos::read(source.open_input(
            &filenames::segment_file_name(&info.name, filenames::FIELD_INFOS_EXT),
        )?)?);

        let term_dict = TermDictReader::open(
            Arc::clone(&source),
            &info.name,
            Arc::clone(&field_infos),
        )?;
        let freq = source.open_input(&filenames::segment_file_name(
            &info.name,
            filenames::FREQ_EXT,
        ))?;
        let prox = source.open_input(&filenames::segment_file_name(
            &info.name,
            filenames::PROX_EXT,
        ))?;

        // Stored fields and vectors may live in a sibling segment's shared
        // doc store rather than in this segment's own files.
        let (store_source, store_segment, doc_offset): (Arc<dyn Storage>, String, u32) =
            if info.shares_doc_store() {
                let store_source: Arc<dyn Storage> = if info.doc_store_compound {
                    Arc::new(CompoundFileReader::open(
                        Arc::clone(&storage),
                        &filenames::segment_file_name(
                            &info.doc_store_segment,
                            filenames::COMPOUND_STORE_EXT,
                        ),
                    )?)
                } else {
                    Arc::clone(&storage)
                };
                (
                    store_source,
                    info.doc_store_segment.clone(),
                    info.doc_store_offset as u32,
                )
            } else {
                (Arc::clone(&source), info.name.clone(), 0)
            };

        let fields = FieldsReader::open(
            Arc::clone(&store_source),
            &store_segment,
            Arc::clone(&field_infos),
        )?;
        let vectors = if info.has_vectors {
            Some(TermVectorsReader::open(
                store_source,
                &store_segment,
                Arc::clone(&field_infos),
            )?)
        } else {
            None
        };

        let deleted = match info.deletes_file() {
            Some(name) => {
                let bits = BitVector::read(storage.open_input(&name)?)?;
                if bits.len() != info.doc_count {
                    return Err(KopisError::corrupt(format!(
                        "deletes file {name} covers {} docs, segment has {}",
                        bits.len(),
                        info.doc_count
                    )));
                }
                Some(Arc::new(bits))
            }
            None => None,
        };

        let segment_norms = match info.norms_file() {
            Some(name) => Norms::read(storage.open_input(&name)?, info.doc_count)?,
            None => Norms::new(),
        };

        Ok(SegmentReader {
            storage,
            core: Arc::new(SegmentCore {
                segment: info.name.clone(),
                field_infos,
                term_dict,
                fields,
                vectors,
                freq: Mutex::new(freq),
                prox: Mutex::new(prox),
            }),
            info: RwLock::new(info.clone()),
            deleted: RwLock::new(deleted),
            norms: RwLock::new(Arc::new(segment_norms)),
            deletions_dirty: AtomicBool::new(false),
            norms_dirty: AtomicBool::new(false),
            ref_count: AtomicU32::new(1),
            synthesize_missing_norms,
            doc_offset,
            doc_count: info.doc_count,
        })
    }

    /// The segment name.
    pub fn segment_name(&self) -> &str {
        &self.core.segment
    }

    /// A snapshot of the segment metadata, including any uncommitted
    /// generation advances.
    pub fn segment_info(&self) -> SegmentInfo {
        self.info.read().clone()
    }

    /// The segment's field table.
    pub fn field_infos(&self) -> Arc<FieldInfos> {
        Arc::clone(&self.core.field_infos)
    }

    /// The current deletion bitmap snapshot, if any documents are deleted.
    pub fn deleted_docs(&self) -> Option<Arc<BitVector>> {
        self.deleted.read().clone()
    }

    /// A reader sharing this reader's core but with its own frozen
    /// deletion/norm snapshots.
    ///
    /// Mutations on either reader never show through the other.
    pub fn clone_reader(&self) -> SegmentReader {
        SegmentReader {
            storage: Arc::clone(&self.storage),
            core: Arc::clone(&self.core),
            info: RwLock::new(self.info.read().clone()),
            deleted: RwLock::new(self.deleted.read().clone()),
            norms: RwLock::new(Arc::clone(&self.norms.read())),
            deletions_dirty: AtomicBool::new(false),
            norms_dirty: AtomicBool::new(false),
            ref_count: AtomicU32::new(1),
            synthesize_missing_norms: self.synthesize_missing_norms,
            doc_offset: self.doc_offset,
            doc_count: self.doc_count,
        }
    }

    /// True when this reader shares its core with `other` (clone or
    /// reopen-reuse rather than a fresh open).
    pub fn shares_core_with(&self, other: &SegmentReader) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Take one more reference.
    pub fn inc_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference; resources release when the last owner lets go.
    pub fn dec_ref(&self) -> u32 {
        let previous = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "segment reader reference underflow");
        previous - 1
    }

    /// The current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Mark one document deleted.
    pub fn delete_document(&self, doc: DocId) -> Result<()> {
        if doc >= self.doc_count {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.doc_count
            )));
        }
        let mut guard = self.deleted.write();
        let mut bits = match guard.as_ref() {
            Some(existing) => (**existing).clone(),
            None => BitVector::new(self.doc_count),
        };
        if bits.set(doc) {
            *guard = Some(Arc::new(bits));
            self.deletions_dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Drop every deletion mark.
    pub fn undelete_all(&self) {
        let mut guard = self.deleted.write();
        if guard.take().is_some() {
            self.deletions_dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Overwrite one norm byte.
    pub fn set_norm(&self, doc: DocId, field: &str, value: u8) -> Result<()> {
        if doc >= self.doc_count {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.doc_count
            )));
        }
        let field_info = self
            .core
            .field_infos
            .by_name(field)
            .filter(|f| f.has_norms())
            .ok_or_else(|| {
                KopisError::invalid_operation(format!("field {field} stores no norms"))
            })?;

        let mut guard = self.norms.write();
        let mut updated = (**guard).clone();
        let mut bytes = updated
            .get(field_info.number)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| Norms::synthetic(self.doc_count));
        bytes[doc as usize] = value;
        updated.replace(field_info.number, bytes);
        *guard = Arc::new(updated);
        self.norms_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// True if deletions or norms changed since open/last commit.
    pub fn has_pending_changes(&self) -> bool {
        self.deletions_dirty.load(Ordering::SeqCst) || self.norms_dirty.load(Ordering::SeqCst)
    }

    /// Write pending deletion/norm changes as the next file generations.
    ///
    /// Returns the updated segment metadata for the caller to fold into its
    /// snapshot (and checkpoint, which releases the superseded files), or
    /// `None` when nothing was pending.
    pub fn commit_pending(&self) -> Result<Option<SegmentInfo>> {
        if !self.has_pending_changes() {
            return Ok(None);
        }
        let mut info = self.info.write();

        if self.deletions_dirty.swap(false, Ordering::SeqCst) {
            match self.deleted.read().as_ref() {
                Some(bits) => {
                    info.advance_del_gen();
                    let name = info
                        .deletes_file()
                        .expect("advanced del generation names a file");
                    bits.write(self.storage.as_ref(), &name)?;
                }
                None => {
                    // undelete_all: the next snapshot simply stops naming a
                    // deletes file.
                    info.del_gen = 0;
                }
            }
        }

        if self.norms_dirty.swap(false, Ordering::SeqCst) {
            info.advance_norm_gen();
            let name = info
                .norms_file()
                .ok_or_else(|| KopisError::index("norm rewrite on a segment without norms"))?;
            self.norms.read().write(self.storage.as_ref(), &name, self.doc_count)?;
        }

        Ok(Some(info.clone()))
    }

    fn positioned_enum(&self, inner: SegmentTermEnum, pre_positioned: bool) -> Box<dyn TermEnum> {
        Box::new(SegmentTermEnumAdapter {
            inner,
            pre_positioned,
            started: false,
        })
    }

    /// A postings cursor filtered by an explicit deletion snapshot instead
    /// of this reader's live state.
    ///
    /// The merger uses this so every merge pass observes the same set of
    /// live documents even while deletes keep arriving on the reader.
    pub fn postings_with_deletions(
        &self,
        term: &Term,
        deleted: Option<Arc<BitVector>>,
        with_positions: bool,
    ) -> Result<Option<SegmentPostings>> {
        let Some(term_info) = self.core.term_dict.get(term)? else {
            return Ok(None);
        };
        let stores_positions = self
            .core
            .field_infos
            .by_name(&term.field)
            .is_some_and(|f| f.indexed && !f.omit_positions);

        let tuning = self.core.term_dict.tuning();
        let freq = self.core.freq.lock().clone_input()?;
        let prox = if with_positions && stores_positions {
            Some(self.core.prox.lock().clone_input()?)
        } else {
            None
        };
        Ok(Some(SegmentPostings::new(
            freq,
            prox,
            term_info,
            deleted,
            tuning.skip_interval,
            tuning.max_skip_levels,
            stores_positions,
        )?))
    }

    fn open_postings(&self, term: &Term, with_positions: bool) -> Result<Option<SegmentPostings>> {
        self.postings_with_deletions(term, self.deleted.read().clone(), with_positions)
    }
}

impl IndexReader for SegmentReader {
    fn max_doc(&self) -> u32 {
        self.doc_count
    }

    fn num_docs(&self) -> u32 {
        let deleted = self.deleted.read().as_ref().map_or(0, |d| d.count());
        self.doc_count - deleted
    }

    fn has_deletions(&self) -> bool {
        self.deleted.read().is_some()
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted.read().as_ref().is_some_and(|d| d.get(doc))
    }

    fn document(&self, doc: DocId, selector: &dyn FieldSelector) -> Result<StoredDocument> {
        if doc >= self.doc_count {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.doc_count
            )));
        }
        self.core.fields.get(doc + self.doc_offset, selector)
    }

    fn terms(&self) -> Result<Box<dyn TermEnum>> {
        Ok(self.positioned_enum(self.core.term_dict.enumerate()?, false))
    }

    fn terms_from(&self, from: &Term) -> Result<Box<dyn TermEnum>> {
        Ok(self.positioned_enum(self.core.term_dict.enumerate_from(from)?, true))
    }

    fn doc_freq(&self, term: &Term) -> Result<u32> {
        Ok(self
            .core
            .term_dict
            .get(term)?
            .map(|info| info.doc_freq)
            .unwrap_or(0))
    }

    fn term_docs(&self, term: &Term) -> Result<Box<dyn TermDocs>> {
        Ok(match self.open_postings(term, false)? {
            Some(postings) => Box::new(postings),
            None => Box::new(EmptyTermDocs),
        })
    }

    fn term_positions(&self, term: &Term) -> Result<Box<dyn TermPositions>> {
        Ok(match self.open_postings(term, true)? {
            Some(postings) => Box::new(postings),
            None => Box::new(EmptyTermDocs),
        })
    }

    fn norms(&self, field: &str) -> Result<Option<Vec<u8>>> {
        let column = self
            .core
            .field_infos
            .by_name(field)
            .filter(|f| f.has_norms())
            .and_then(|f| self.norms.read().get(f.number).map(<[u8]>::to_vec));
        match column {
            Some(bytes) => Ok(Some(bytes)),
            None if self.synthesize_missing_norms => {
                Ok(Some(Norms::synthetic(self.doc_count)))
            }
            None => Ok(None),
        }
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<Vec<TermVector>>> {
        let Some(vectors) = &self.core.vectors else {
            return Ok(None);
        };
        if doc >= self.doc_count {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.doc_count
            )));
        }
        let fields = vectors.get(doc + self.doc_offset)?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }
}

/// Adapts the dictionary's owned enumeration to the [`TermEnum`] contract.
struct SegmentTermEnumAdapter {
    inner: SegmentTermEnum,
    /// Seeded enumerations arrive already positioned on their first term;
    /// the first `next` consumes that position instead of advancing.
    pre_positioned: bool,
    started: bool,
}

impl TermEnum for SegmentTermEnumAdapter {
    fn next(&mut self) -> Result<bool> {
        self.started = true;
        if self.pre_positioned {
            self.pre_positioned = false;
            return Ok(self.inner.current().is_some());
        }
        self.inner.next()
    }

    fn term(&self) -> Option<&Term> {
        if !self.started {
            return None;
        }
        self.inner.current().map(|(term, _)| term)
    }

    fn doc_freq(&self) -> u32 {
        self.inner
            .current()
            .map(|(_, info)| info.doc_freq)
            .unwrap_or(0)
    }
}

impl TermDocs for SegmentPostings {
    fn next(&mut self) -> Result<bool> {
        SegmentPostings::next(self)
    }

    fn doc(&self) -> DocId {
        SegmentPostings::doc(self)
    }

    fn freq(&self) -> u32 {
        SegmentPostings::freq(self)
    }

    fn skip_to(&mut self, target: DocId) -> Result<bool> {
        SegmentPostings::skip_to(self, target)
    }
}

impl TermPositions for SegmentPostings {
    fn next_position(&mut self) -> Result<u32> {
        SegmentPostings::next_position(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::buffer::DocumentsBuffer;
    use crate::index::document::{Document, Field};
    use crate::index::norms;
    use crate::index::reader::LoadAll;
    use crate::index::terms::TermDictTuning;
    use crate::storage::{MemoryStorage, Storage};

    fn tuning() -> TermDictTuning {
        TermDictTuning {
            index_interval: 16,
            skip_interval: 16,
            max_skip_levels: 10,
        }
    }

    /// Three documents: alpha / beta / gamma in "body", keyword ids.
    fn flushed_segment(storage: &Arc<dyn Storage>) -> SegmentInfo {
        let mut buffer = DocumentsBuffer::new();
        for (i, token) in ["alpha", "beta", "gamma"].iter().enumerate() {
            buffer
                .add_document(
                    &Document::new()
                        .add(Field::text("body", token))
                        .add(Field::keyword("id", &format!("doc-{i}"))),
                )
                .unwrap();
        }
        buffer.flush(storage.as_ref(), "_0", tuning()).unwrap()
    }

    fn open(storage: &Arc<dyn Storage>, info: &SegmentInfo) -> SegmentReader {
        SegmentReader::open(Arc::clone(storage), info, false).unwrap()
    }

    #[test]
    fn test_basic_reads() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);
        let reader = open(&storage, &info);

        assert_eq!(reader.max_doc(), 3);
        assert_eq!(reader.num_docs(), 3);
        assert!(!reader.has_deletions());

        let doc = reader.document(1, &LoadAll).unwrap();
        assert_eq!(doc.text("body").unwrap().as_deref(), Some("beta"));

        assert_eq!(reader.doc_freq(&Term::new("body", "alpha")).unwrap(), 1);
        assert_eq!(reader.doc_freq(&Term::new("body", "missing")).unwrap(), 0);

        let mut docs = reader.term_docs(&Term::new("body", "gamma")).unwrap();
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 2);
        assert!(!docs.next().unwrap());

        let mut none = reader.term_docs(&Term::new("body", "missing")).unwrap();
        assert!(!none.next().unwrap());
    }

    #[test]
    fn test_term_enumeration() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);
        let reader = open(&storage, &info);

        let mut terms = reader.terms().unwrap();
        assert!(terms.term().is_none(), "unpositioned before first next");
        let mut seen = Vec::new();
        while terms.next().unwrap() {
            seen.push(terms.term().unwrap().clone());
        }
        assert_eq!(seen.len(), 6); // 3 body terms + 3 id terms
        assert_eq!(seen[0], Term::new("body", "alpha"));

        let mut from = reader
            .terms_from(&Term::new("body", "b"))
            .unwrap();
        assert!(from.next().unwrap());
        assert_eq!(from.term().unwrap(), &Term::new("body", "beta"));
    }

    #[test]
    fn test_deletions() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);
        let reader = open(&storage, &info);

        reader.delete_document(0).unwrap();
        assert!(reader.has_deletions());
        assert!(reader.is_deleted(0));
        assert_eq!(reader.num_docs(), 2);

        // Postings filter the deleted doc.
        let mut docs = reader.term_docs(&Term::new("body", "alpha")).unwrap();
        assert!(!docs.next().unwrap());

        reader.undelete_all();
        assert_eq!(reader.num_docs(), 3);

        assert!(reader.delete_document(5).is_err());
    }

    #[test]
    fn test_clone_isolation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);
        let reader = open(&storage, &info);

        let snapshot = reader.clone_reader();
        assert!(snapshot.shares_core_with(&reader));

        reader.delete_document(1).unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert_eq!(snapshot.num_docs(), 3, "clone keeps its snapshot");
        assert!(!snapshot.is_deleted(1));
    }

    #[test]
    fn test_commit_pending_writes_generations() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);
        let reader = open(&storage, &info);

        assert!(reader.commit_pending().unwrap().is_none());

        reader.delete_document(2).unwrap();
        reader.set_norm(0, "body", norms::encode_norm(2.0)).unwrap();
        assert!(reader.has_pending_changes());

        let updated = reader.commit_pending().unwrap().unwrap();
        assert_eq!(updated.del_gen, 1);
        assert_eq!(updated.norm_gen, 1);
        assert!(storage.file_exists("_0_1.del"));
        assert!(storage.file_exists("_0_1.nrm"));
        assert!(!reader.has_pending_changes());

        // A fresh reader over the updated metadata sees the changes.
        let reopened = open(&storage, &updated);
        assert_eq!(reopened.num_docs(), 2);
        assert!(reopened.is_deleted(2));
        let body_norms = reopened.norms("body").unwrap().unwrap();
        assert_eq!(body_norms[0], norms::encode_norm(2.0));
    }

    #[test]
    fn test_norms_synthesis() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);

        let plain = open(&storage, &info);
        assert!(plain.norms("id").unwrap().is_none(), "id omits norms");

        let synthesizing = SegmentReader::open(Arc::clone(&storage), &info, true).unwrap();
        let synthetic = synthesizing.norms("id").unwrap().unwrap();
        assert_eq!(synthetic.len(), 3);
        assert!(synthetic.iter().all(|&b| b == norms::encode_norm(1.0)));
    }

    #[test]
    fn test_ref_counting() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let info = flushed_segment(&storage);
        let reader = open(&storage, &info);

        assert_eq!(reader.ref_count(), 1);
        assert_eq!(reader.inc_ref(), 2);
        assert_eq!(reader.dec_ref(), 1);
        assert_eq!(reader.dec_ref(), 0);
    }
}
