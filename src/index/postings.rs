//! Postings streams: document frequencies (`.frq`) and positions (`.prx`).
//!
//! Doc numbers are delta-encoded with the low bit of the delta flagging a
//! frequency of one; positions are delta-encoded per document. Skip-list
//! data is appended to the freq stream after each long postings list.

use std::io::SeekFrom;
use std::sync::Arc;

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::bit_vector::BitVector;
use crate::index::filenames;
use crate::index::skip::{SkipListReader, SkipListWriter};
use crate::index::terms::TermInfo;
use crate::storage::StructWriter;
use crate::storage::traits::{Storage, StorageInput, StorageOutput};
use crate::util::varint;

/// Writes the freq and prox streams for one segment.
pub struct PostingsWriter {
    freq: StructWriter<Box<dyn StorageOutput>>,
    prox: StructWriter<Box<dyn StorageOutput>>,
    skip: SkipListWriter,
    skip_interval: u32,
    // Per-term state.
    freq_start: u64,
    prox_start: u64,
    last_doc: u32,
    last_position_written: bool,
    df: u32,
}

impl PostingsWriter {
    /// Create the `.frq` and `.prx` outputs for a segment.
    pub fn new(
        storage: &dyn Storage,
        segment: &str,
        skip_interval: u32,
        max_skip_levels: u32,
    ) -> Result<Self> {
        let freq = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::FREQ_EXT,
        ))?;
        let prox = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::PROX_EXT,
        ))?;
        Ok(PostingsWriter {
            freq: StructWriter::new(freq),
            prox: StructWriter::new(prox),
            skip: SkipListWriter::new(skip_interval, max_skip_levels),
            skip_interval,
            freq_start: 0,
            prox_start: 0,
            last_doc: 0,
            last_position_written: false,
            df: 0,
        })
    }

    /// Begin a new term.
    pub fn start_term(&mut self) {
        self.freq_start = self.freq.position();
        self.prox_start = self.prox.position();
        self.skip.reset(self.freq_start, self.prox_start);
        self.last_doc = 0;
        self.df = 0;
        self.last_position_written = false;
    }

    /// Append one document's posting. Docs must arrive in increasing order;
    /// `positions` is empty for fields that omit positions.
    pub fn add_doc(&mut self, doc: DocId, freq: u32, positions: &[u32]) -> Result<()> {
        if self.df > 0 && doc <= self.last_doc {
            return Err(KopisError::index(format!(
                "postings out of order: doc {doc} after {}",
                self.last_doc
            )));
        }
        if self.df > 0 && self.df % self.skip_interval == 0 {
            self.skip
                .buffer_skip(self.last_doc, self.freq.position(), self.prox.position())?;
        }

        let delta = if self.df == 0 {
            doc
        } else {
            doc - self.last_doc
        };
        if freq == 1 {
            self.freq.write_vint(delta << 1 | 1)?;
        } else {
            self.freq.write_vint(delta << 1)?;
            self.freq.write_vint(freq)?;
        }

        let mut last_position = 0u32;
        for &position in positions {
            self.prox.write_vint(position - last_position)?;
            last_position = position;
            self.last_position_written = true;
        }

        self.last_doc = doc;
        self.df += 1;
        Ok(())
    }

    /// Finish the current term, flushing its skip data, and return the
    /// dictionary entry.
    pub fn end_term(&mut self) -> Result<TermInfo> {
        let mut skip_offset = 0;
        if self.df >= self.skip_interval && self.skip.has_skip_data() {
            let skip_data = self.skip.serialize(self.df)?;
            skip_offset = self.freq.position() - self.freq_start;
            self.freq.write_raw(&skip_data)?;
        }
        Ok(TermInfo {
            doc_freq: self.df,
            freq_ptr: self.freq_start,
            prox_ptr: self.prox_start,
            skip_offset,
        })
    }

    /// Close both streams.
    pub fn close(self) -> Result<()> {
        self.freq.close()?;
        self.prox.close()
    }
}

/// Iterates the documents of one term, filtering deleted documents.
#[derive(Debug)]
pub struct SegmentPostings {
    freq_input: Box<dyn StorageInput>,
    prox_input: Option<Box<dyn StorageInput>>,
    deleted: Option<Arc<BitVector>>,
    info: TermInfo,
    skip_interval: u32,
    max_skip_levels: u32,
    skip: Option<SkipListReader>,
    /// Raw postings consumed, deleted docs included.
    count: u32,
    doc: DocId,
    freq: u32,
    /// Positions of the current doc not yet consumed.
    pending_positions: u32,
    position: u32,
    /// Deferred prox seek from a skip.
    prox_seek: Option<u64>,
    /// Positions between the deferred seek target and the current document,
    /// to be read and discarded once the seek is applied.
    deferred_positions: u32,
    stores_positions: bool,
}

impl SegmentPostings {
    /// Create a postings cursor.
    ///
    /// `prox_input` is `None` for plain doc iteration; pass it to read
    /// positions. Inputs must be private clones; the cursor seeks them.
    pub fn new(
        mut freq_input: Box<dyn StorageInput>,
        prox_input: Option<Box<dyn StorageInput>>,
        info: TermInfo,
        deleted: Option<Arc<BitVector>>,
        skip_interval: u32,
        max_skip_levels: u32,
        stores_positions: bool,
    ) -> Result<Self> {
        freq_input.seek(SeekFrom::Start(info.freq_ptr))?;
        let mut prox_input = prox_input;
        if let Some(prox) = prox_input.as_mut() {
            prox.seek(SeekFrom::Start(info.prox_ptr))?;
        }
        Ok(SegmentPostings {
            freq_input,
            prox_input,
            deleted,
            info,
            skip_interval,
            max_skip_levels,
            skip: None,
            count: 0,
            doc: 0,
            freq: 0,
            pending_positions: 0,
            position: 0,
            prox_seek: None,
            deferred_positions: 0,
            stores_positions,
        })
    }

    /// The current document.
    pub fn doc(&self) -> DocId {
        self.doc
    }

    /// The current document's term frequency.
    pub fn freq(&self) -> u32 {
        self.freq
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted.as_ref().is_some_and(|d| d.get(doc))
    }

    /// Advance to the next live document.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            if self.count >= self.info.doc_freq {
                return Ok(false);
            }

            self.skip_pending_positions()?;

            let delta = varint::read_u32(&mut self.freq_input)?;
            self.count += 1;
            self.doc += delta >> 1;
            self.freq = if delta & 1 != 0 {
                1
            } else {
                varint::read_u32(&mut self.freq_input)?
            };
            if self.stores_positions {
                self.pending_positions = self.freq;
            }
            self.position = 0;

            if !self.is_deleted(self.doc) {
                return Ok(true);
            }
        }
    }

    /// Advance to the first live document at or past `target`.
    pub fn skip_to(&mut self, target: DocId) -> Result<bool> {
        if self.count > 0 && self.doc >= target {
            return Ok(!self.is_deleted(self.doc) || self.next()?);
        }

        if self.info.doc_freq >= self.skip_interval
            && self.info.skip_offset > 0
            && target > self.doc
        {
            if self.skip.is_none() {
                let mut skip_input = self.freq_input.clone_input()?;
                skip_input.seek(SeekFrom::Start(self.info.freq_ptr + self.info.skip_offset))?;
                self.skip = Some(SkipListReader::read(
                    &mut skip_input,
                    self.info.doc_freq,
                    self.skip_interval,
                    self.max_skip_levels,
                    self.info.freq_ptr,
                    self.info.prox_ptr,
                )?);
            }
            if let Some(hit) = self.skip.as_mut().unwrap().skip_to(target)?
                && hit.docs_skipped > self.count
            {
                self.freq_input.seek(SeekFrom::Start(hit.freq_ptr))?;
                self.count = hit.docs_skipped;
                self.doc = hit.doc;
                self.freq = 0;
                self.pending_positions = 0;
                self.deferred_positions = 0;
                if self.prox_input.is_some() {
                    self.prox_seek = Some(hit.prox_ptr);
                }
            }
        }

        loop {
            if !self.next()? {
                return Ok(false);
            }
            if self.doc >= target {
                return Ok(true);
            }
        }
    }

    /// The next position of the term in the current document.
    pub fn next_position(&mut self) -> Result<u32> {
        if !self.stores_positions {
            return Err(KopisError::invalid_operation(
                "field does not store positions",
            ));
        }
        let Some(prox) = self.prox_input.as_mut() else {
            return Err(KopisError::invalid_operation(
                "postings cursor was opened without positions",
            ));
        };
        if self.pending_positions == 0 {
            return Err(KopisError::invalid_operation(
                "all positions of the current document were consumed",
            ));
        }
        if let Some(target) = self.prox_seek.take() {
            prox.seek(SeekFrom::Start(target))?;
            for _ in 0..self.deferred_positions {
                varint::read_u32(prox)?;
            }
            self.deferred_positions = 0;
        }
        self.position += varint::read_u32(prox)?;
        self.pending_positions -= 1;
        Ok(self.position)
    }

    /// Drop position data of the current document that was never read.
    fn skip_pending_positions(&mut self) -> Result<()> {
        if self.pending_positions == 0 {
            return Ok(());
        }
        // Under a deferred seek the stream is not positioned here yet; the
        // skip happens when the seek is applied.
        if self.prox_seek.is_some() {
            self.deferred_positions += self.pending_positions;
            self.pending_positions = 0;
            return Ok(());
        }
        if let Some(prox) = self.prox_input.as_mut() {
            for _ in 0..self.pending_positions {
                varint::read_u32(prox)?;
            }
        }
        self.pending_positions = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};

    fn write_postings(
        storage: &dyn Storage,
        docs: &[(u32, Vec<u32>)],
        skip_interval: u32,
    ) -> TermInfo {
        let mut writer = PostingsWriter::new(storage, "_0", skip_interval, 10).unwrap();
        writer.start_term();
        for (doc, positions) in docs {
            writer
                .add_doc(*doc, positions.len() as u32, positions)
                .unwrap();
        }
        let info = writer.end_term().unwrap();
        writer.close().unwrap();
        info
    }

    fn open_postings(
        storage: &dyn Storage,
        info: TermInfo,
        deleted: Option<Arc<BitVector>>,
        skip_interval: u32,
        with_prox: bool,
    ) -> SegmentPostings {
        let freq = storage.open_input("_0.frq").unwrap();
        let prox = with_prox.then(|| storage.open_input("_0.prx").unwrap());
        SegmentPostings::new(freq, prox, info, deleted, skip_interval, 10, true).unwrap()
    }

    #[test]
    fn test_doc_iteration() {
        let storage = MemoryStorage::new_default();
        let docs = vec![(0, vec![1]), (2, vec![4, 9]), (5, vec![0])];
        let info = write_postings(&storage, &docs, 16);
        assert_eq!(info.doc_freq, 3);

        let mut postings = open_postings(&storage, info, None, 16, false);
        assert!(postings.next().unwrap());
        assert_eq!((postings.doc(), postings.freq()), (0, 1));
        assert!(postings.next().unwrap());
        assert_eq!((postings.doc(), postings.freq()), (2, 2));
        assert!(postings.next().unwrap());
        assert_eq!((postings.doc(), postings.freq()), (5, 1));
        assert!(!postings.next().unwrap());
    }

    #[test]
    fn test_positions() {
        let storage = MemoryStorage::new_default();
        let docs = vec![(1, vec![3, 7, 20]), (4, vec![0, 2])];
        let info = write_postings(&storage, &docs, 16);

        let mut postings = open_postings(&storage, info, None, 16, true);
        assert!(postings.next().unwrap());
        assert_eq!(postings.next_position().unwrap(), 3);
        assert_eq!(postings.next_position().unwrap(), 7);
        assert_eq!(postings.next_position().unwrap(), 20);

        assert!(postings.next().unwrap());
        assert_eq!(postings.next_position().unwrap(), 0);
        assert_eq!(postings.next_position().unwrap(), 2);
    }

    #[test]
    fn test_unread_positions_are_skipped() {
        let storage = MemoryStorage::new_default();
        let docs = vec![(1, vec![3, 7, 20]), (4, vec![5, 8])];
        let info = write_postings(&storage, &docs, 16);

        let mut postings = open_postings(&storage, info, None, 16, true);
        assert!(postings.next().unwrap());
        // Read only one of three positions, then advance.
        assert_eq!(postings.next_position().unwrap(), 3);
        assert!(postings.next().unwrap());
        assert_eq!(postings.next_position().unwrap(), 5);
    }

    #[test]
    fn test_deleted_docs_filtered() {
        let storage = MemoryStorage::new_default();
        let docs = vec![(0, vec![1]), (1, vec![1]), (2, vec![1])];
        let info = write_postings(&storage, &docs, 16);

        let mut deleted = BitVector::new(3);
        deleted.set(1);

        let mut postings = open_postings(&storage, info, Some(Arc::new(deleted)), 16, false);
        assert!(postings.next().unwrap());
        assert_eq!(postings.doc(), 0);
        assert!(postings.next().unwrap());
        assert_eq!(postings.doc(), 2);
        assert!(!postings.next().unwrap());
    }

    #[test]
    fn test_skip_to_with_skip_lists() {
        let storage = MemoryStorage::new_default();
        let docs: Vec<(u32, Vec<u32>)> = (0..500).map(|i| (i * 3, vec![i])).collect();
        let info = write_postings(&storage, &docs, 8);
        assert!(info.skip_offset > 0);

        let mut postings = open_postings(&storage, info, None, 8, true);
        assert!(postings.skip_to(900).unwrap());
        assert_eq!(postings.doc(), 900);
        assert_eq!(postings.next_position().unwrap(), 300);

        // Skip further, to a target between docs.
        assert!(postings.skip_to(1000).unwrap());
        assert_eq!(postings.doc(), 1002);

        assert!(!postings.skip_to(5000).unwrap());
    }

    #[test]
    fn test_skip_to_matches_linear_scan() {
        let storage = MemoryStorage::new_default();
        let docs: Vec<(u32, Vec<u32>)> = (0..300).map(|i| (i * 2 + 1, vec![0])).collect();
        let info = write_postings(&storage, &docs, 4);

        for target in [0, 1, 2, 77, 300, 599, 600] {
            let mut postings = open_postings(&storage, info, None, 4, false);
            let found = postings.skip_to(target).unwrap();
            let expected = docs.iter().map(|(d, _)| *d).find(|&d| d >= target);
            match expected {
                Some(doc) => {
                    assert!(found, "target {target}");
                    assert_eq!(postings.doc(), doc, "target {target}");
                }
                None => assert!(!found, "target {target}"),
            }
        }
    }

    #[test]
    fn test_out_of_order_docs_rejected() {
        let storage = MemoryStorage::new_default();
        let mut writer = PostingsWriter::new(&storage, "_0", 16, 10).unwrap();
        writer.start_term();
        writer.add_doc(5, 1, &[0]).unwrap();
        assert!(writer.add_doc(3, 1, &[0]).is_err());
    }
}
