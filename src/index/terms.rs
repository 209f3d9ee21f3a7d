//! The term dictionary (`.tis`) and its in-memory index (`.tii`).
//!
//! Terms are written in field-then-text order with prefix-compressed text.
//! Every `index_interval`-th term also lands in the `.tii` file together
//! with its dictionary position; readers load the index into memory and
//! binary-search it, then scan at most `index_interval` dictionary entries
//! to finish a seek.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KopisError, Result};
use crate::index::field_infos::FieldInfos;
use crate::index::filenames;
use crate::index::term::Term;
use crate::storage::{StructReader, StructWriter};
use crate::storage::traits::{Storage, StorageInput, StorageOutput};

/// Current term-dictionary format version.
pub const TERMS_FORMAT_CURRENT: u32 = 1;

/// Byte offset of the patched term-count slot in both headers.
const COUNT_OFFSET: u64 = 4;

/// A term's dictionary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermInfo {
    /// Number of documents containing the term.
    pub doc_freq: u32,
    /// Absolute position of the term's postings in the freq stream.
    pub freq_ptr: u64,
    /// Absolute position of the term's positions in the prox stream.
    pub prox_ptr: u64,
    /// Offset of the skip data relative to `freq_ptr`; 0 when absent.
    pub skip_offset: u64,
}

/// Tuning shared by the dictionary writer and readers.
#[derive(Debug, Clone, Copy)]
pub struct TermDictTuning {
    /// Every Nth term goes into the `.tii` index.
    pub index_interval: u32,
    /// Skip-list interval used by the postings this dictionary points at.
    pub skip_interval: u32,
    /// Skip-list level cap.
    pub max_skip_levels: u32,
}

/// Writes the `.tis` and `.tii` files for a segment.
pub struct TermDictWriter {
    tis: StructWriter<Box<dyn StorageOutput>>,
    tii: StructWriter<Box<dyn StorageOutput>>,
    tuning: TermDictTuning,
    term_count: u64,
    index_count: u64,
    last_term: Option<Term>,
    last_text: Vec<u8>,
    last_field: u32,
    last_freq_ptr: u64,
    last_prox_ptr: u64,
    index_last_text: Vec<u8>,
    index_last_field: u32,
    index_last_freq_ptr: u64,
    index_last_prox_ptr: u64,
    index_last_tis_ptr: u64,
}

impl TermDictWriter {
    /// Create the dictionary outputs for a segment.
    pub fn new(storage: &dyn Storage, segment: &str, tuning: TermDictTuning) -> Result<Self> {
        let tis = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::TERMS_EXT,
        ))?;
        let tii = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::TERMS_INDEX_EXT,
        ))?;
        let mut writer = TermDictWriter {
            tis: StructWriter::new(tis),
            tii: StructWriter::new(tii),
            tuning,
            term_count: 0,
            index_count: 0,
            last_term: None,
            last_text: Vec::new(),
            last_field: 0,
            last_freq_ptr: 0,
            last_prox_ptr: 0,
            index_last_text: Vec::new(),
            index_last_field: 0,
            index_last_freq_ptr: 0,
            index_last_prox_ptr: 0,
            index_last_tis_ptr: 0,
        };
        writer.write_header()?;
        Ok(writer)
    }

    fn write_header(&mut self) -> Result<()> {
        for out in [&mut self.tis, &mut self.tii] {
            out.write_u32(TERMS_FORMAT_CURRENT)?;
            out.write_u64(0)?; // term count, patched on close
            out.write_u32(self.tuning.index_interval)?;
            out.write_u32(self.tuning.skip_interval)?;
            out.write_u32(self.tuning.max_skip_levels)?;
        }
        Ok(())
    }

    /// Append a term. Terms must arrive in strictly increasing order.
    pub fn add(&mut self, term: &Term, field_number: u32, info: &TermInfo) -> Result<()> {
        if let Some(last) = &self.last_term
            && term <= last
        {
            return Err(KopisError::index(format!(
                "terms out of order: {term} after {last}"
            )));
        }

        let text = term.text.as_bytes();
        let prefix = if self.last_field == field_number && self.term_count > 0 {
            common_prefix(&self.last_text, text)
        } else {
            0
        };

        write_entry(
            &mut self.tis,
            prefix,
            &text[prefix..],
            field_number,
            info,
            self.last_freq_ptr,
            self.last_prox_ptr,
            self.tuning.skip_interval,
        )?;

        if self.term_count % self.tuning.index_interval as u64 == 0 {
            let index_prefix = if self.index_last_field == field_number && self.index_count > 0 {
                common_prefix(&self.index_last_text, text)
            } else {
                0
            };
            write_entry(
                &mut self.tii,
                index_prefix,
                &text[index_prefix..],
                field_number,
                info,
                self.index_last_freq_ptr,
                self.index_last_prox_ptr,
                self.tuning.skip_interval,
            )?;
            // The index points at the dictionary position after this term,
            // where a seeded scan resumes.
            let tis_ptr = self.tis.position();
            self.tii.write_vlong(tis_ptr - self.index_last_tis_ptr)?;
            self.index_last_tis_ptr = tis_ptr;
            self.index_last_text = text.to_vec();
            self.index_last_field = field_number;
            self.index_last_freq_ptr = info.freq_ptr;
            self.index_last_prox_ptr = info.prox_ptr;
            self.index_count += 1;
        }

        self.last_term = Some(term.clone());
        self.last_text = text.to_vec();
        self.last_field = field_number;
        self.last_freq_ptr = info.freq_ptr;
        self.last_prox_ptr = info.prox_ptr;
        self.term_count += 1;
        Ok(())
    }

    /// Patch the term counts and close both files.
    pub fn close(mut self) -> Result<()> {
        self.tis.seek_to(COUNT_OFFSET)?;
        self.tis.write_u64(self.term_count)?;
        self.tii.seek_to(COUNT_OFFSET)?;
        self.tii.write_u64(self.index_count)?;
        self.tis.close()?;
        self.tii.close()
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[allow(clippy::too_many_arguments)]
fn write_entry<W: StorageOutput>(
    out: &mut StructWriter<W>,
    prefix: usize,
    suffix: &[u8],
    field_number: u32,
    info: &TermInfo,
    last_freq_ptr: u64,
    last_prox_ptr: u64,
    skip_interval: u32,
) -> Result<()> {
    out.write_vint(prefix as u32)?;
    out.write_bytes(suffix)?;
    out.write_vint(field_number)?;
    out.write_vint(info.doc_freq)?;
    out.write_vlong(info.freq_ptr - last_freq_ptr)?;
    out.write_vlong(info.prox_ptr - last_prox_ptr)?;
    if info.doc_freq >= skip_interval {
        out.write_vlong(info.skip_offset)?;
    }
    Ok(())
}

/// One in-memory index entry.
#[derive(Debug, Clone)]
struct IndexEntry {
    term: Term,
    text: Vec<u8>,
    field_number: u32,
    info: TermInfo,
    /// Dictionary position right after the indexed term's entry.
    tis_ptr: u64,
    /// Ordinal of the indexed term in the dictionary.
    ordinal: u64,
}

/// Reads the term dictionary of one segment.
///
/// The dictionary file is opened once; every enumeration reads through a
/// private clone of that handle, so open enumerations (and the reader
/// itself) survive the file's later deletion from the directory.
#[derive(Debug)]
pub struct TermDictReader {
    tis: Mutex<Box<dyn StorageInput>>,
    field_infos: Arc<FieldInfos>,
    index: Vec<IndexEntry>,
    term_count: u64,
    tuning: TermDictTuning,
}

impl TermDictReader {
    /// Open the dictionary, loading the `.tii` index into memory.
    pub fn open(
        source: Arc<dyn Storage>,
        segment: &str,
        field_infos: Arc<FieldInfos>,
    ) -> Result<Self> {
        let tis_name = filenames::segment_file_name(segment, filenames::TERMS_EXT);
        let tii_name = filenames::segment_file_name(segment, filenames::TERMS_INDEX_EXT);

        // The dictionary header is authoritative for term count and tuning.
        let tis_input = source.open_input(&tis_name)?;
        let mut tis = StructReader::new(tis_input.clone_input()?)?;
        let (term_count, tuning) = read_header(&mut tis)?;
        tis.close()?;

        let mut tii = StructReader::new(source.open_input(&tii_name)?)?;
        let (index_count, _) = read_header(&mut tii)?;

        let mut index = Vec::with_capacity(index_count as usize);
        let mut prev_text: Vec<u8> = Vec::new();
        let mut prev_field = 0u32;
        let mut freq_ptr = 0u64;
        let mut prox_ptr = 0u64;
        let mut tis_ptr = 0u64;
        for i in 0..index_count {
            let entry = read_entry(
                &mut tii,
                &prev_text,
                prev_field,
                freq_ptr,
                prox_ptr,
                tuning.skip_interval,
                &field_infos,
            )?;
            tis_ptr += tii.read_vlong()?;
            prev_text = entry.text.clone();
            prev_field = entry.field_number;
            freq_ptr = entry.info.freq_ptr;
            prox_ptr = entry.info.prox_ptr;
            index.push(IndexEntry {
                term: entry.term,
                text: entry.text,
                field_number: entry.field_number,
                info: entry.info,
                tis_ptr,
                ordinal: i * tuning.index_interval as u64,
            });
        }
        tii.close()?;

        Ok(TermDictReader {
            tis: Mutex::new(tis_input),
            field_infos,
            index,
            term_count,
            tuning,
        })
    }

    /// Number of terms in the dictionary.
    pub fn term_count(&self) -> u64 {
        self.term_count
    }

    /// The dictionary tuning (shared with the postings readers).
    pub fn tuning(&self) -> TermDictTuning {
        self.tuning
    }

    /// Enumerate all terms from the beginning.
    pub fn enumerate(&self) -> Result<SegmentTermEnum> {
        let mut reader = StructReader::new(self.tis.lock().clone_input()?)?;
        reader.seek_to(header_len())?;
        Ok(SegmentTermEnum {
            reader,
            field_infos: Arc::clone(&self.field_infos),
            term_count: self.term_count,
            tuning: self.tuning,
            read_count: 0,
            current: None,
            prev_text: Vec::new(),
            prev_field: 0,
            prev_freq_ptr: 0,
            prev_prox_ptr: 0,
        })
    }

    /// Enumerate terms starting at the first term at or after `target`.
    ///
    /// The returned enumeration is already positioned: `current()` is the
    /// first matching term, or `None` when the dictionary ends first.
    pub fn enumerate_from(&self, target: &Term) -> Result<SegmentTermEnum> {
        let mut e = self.seeded_enum(target)?;
        if e.current().is_none() && !e.next()? {
            return Ok(e);
        }
        loop {
            match e.current() {
                Some((term, _)) if term < target => {
                    if !e.next()? {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(e)
    }

    /// Look up one term.
    pub fn get(&self, target: &Term) -> Result<Option<TermInfo>> {
        if self.term_count == 0 {
            return Ok(None);
        }
        let e = self.enumerate_from(target)?;
        Ok(e.current()
            .filter(|(term, _)| *term == target)
            .map(|(_, info)| *info))
    }

    /// An enumeration positioned at the index entry at or before `target`.
    fn seeded_enum(&self, target: &Term) -> Result<SegmentTermEnum> {
        let at = self.index.partition_point(|e| e.term <= *target);
        if at == 0 {
            return self.enumerate();
        }
        let entry = &self.index[at - 1];

        let mut reader = StructReader::new(self.tis.lock().clone_input()?)?;
        reader.seek_to(entry.tis_ptr)?;
        Ok(SegmentTermEnum {
            reader,
            field_infos: Arc::clone(&self.field_infos),
            term_count: self.term_count,
            tuning: self.tuning,
            read_count: entry.ordinal + 1,
            current: Some((entry.term.clone(), entry.info)),
            prev_text: entry.text.clone(),
            prev_field: entry.field_number,
            prev_freq_ptr: entry.info.freq_ptr,
            prev_prox_ptr: entry.info.prox_ptr,
        })
    }
}

fn header_len() -> u64 {
    4 + 8 + 4 + 4 + 4
}

fn read_header<R: StorageInput>(reader: &mut StructReader<R>) -> Result<(u64, TermDictTuning)> {
    let format = reader.read_u32()?;
    if format > TERMS_FORMAT_CURRENT {
        return Err(KopisError::corrupt(format!(
            "term dictionary format {format} is newer than supported {TERMS_FORMAT_CURRENT}"
        )));
    }
    let count = reader.read_u64()?;
    let tuning = TermDictTuning {
        index_interval: reader.read_u32()?,
        skip_interval: reader.read_u32()?,
        max_skip_levels: reader.read_u32()?,
    };
    Ok((count, tuning))
}

struct DecodedEntry {
    term: Term,
    text: Vec<u8>,
    field_number: u32,
    info: TermInfo,
}

fn read_entry<R: StorageInput>(
    reader: &mut StructReader<R>,
    prev_text: &[u8],
    _prev_field: u32,
    prev_freq_ptr: u64,
    prev_prox_ptr: u64,
    skip_interval: u32,
    field_infos: &FieldInfos,
) -> Result<DecodedEntry> {
    let prefix = reader.read_vint()? as usize;
    let suffix = reader.read_bytes()?;
    let field_number = reader.read_vint()?;
    let doc_freq = reader.read_vint()?;
    let freq_ptr = prev_freq_ptr + reader.read_vlong()?;
    let prox_ptr = prev_prox_ptr + reader.read_vlong()?;
    let skip_offset = if doc_freq >= skip_interval {
        reader.read_vlong()?
    } else {
        0
    };

    if prefix > prev_text.len() {
        return Err(KopisError::corrupt("term prefix longer than previous term"));
    }
    let mut text = prev_text[..prefix].to_vec();
    text.extend_from_slice(&suffix);

    let field = field_infos
        .by_number(field_number)
        .map(|f| f.name.clone())
        .ok_or_else(|| {
            KopisError::corrupt(format!("term references unknown field {field_number}"))
        })?;
    let term = Term {
        field,
        text: String::from_utf8(text.clone())
            .map_err(|e| KopisError::corrupt(format!("invalid term text: {e}")))?,
    };

    Ok(DecodedEntry {
        term,
        text,
        field_number,
        info: TermInfo {
            doc_freq,
            freq_ptr,
            prox_ptr,
            skip_offset,
        },
    })
}

/// A lazy, sorted enumeration over one segment's dictionary.
pub struct SegmentTermEnum {
    reader: StructReader<Box<dyn StorageInput>>,
    field_infos: Arc<FieldInfos>,
    term_count: u64,
    tuning: TermDictTuning,
    read_count: u64,
    current: Option<(Term, TermInfo)>,
    prev_text: Vec<u8>,
    prev_field: u32,
    prev_freq_ptr: u64,
    prev_prox_ptr: u64,
}

impl SegmentTermEnum {
    /// The current term and its dictionary entry.
    pub fn current(&self) -> Option<(&Term, &TermInfo)> {
        self.current.as_ref().map(|(t, i)| (t, i))
    }

    /// Advance to the next term. Returns false at the end.
    pub fn next(&mut self) -> Result<bool> {
        if self.read_count >= self.term_count {
            self.current = None;
            return Ok(false);
        }

        let entry = read_entry(
            &mut self.reader,
            &self.prev_text,
            self.prev_field,
            self.prev_freq_ptr,
            self.prev_prox_ptr,
            self.tuning.skip_interval,
            &self.field_infos,
        )?;

        self.prev_text = entry.text;
        self.prev_field = entry.field_number;
        self.prev_freq_ptr = entry.info.freq_ptr;
        self.prev_prox_ptr = entry.info.prox_ptr;
        self.read_count += 1;
        self.current = Some((entry.term, entry.info));
        Ok(true)
    }
}
