//! Multi-level skip lists embedded in the postings stream.
//!
//! Every `skip_interval` postings of a term, a skip point records the doc
//! number and the freq/prox stream positions reached so far. Every
//! `skip_interval` points are additionally summarized one level up, so a
//! seek over a long postings list touches O(log n) entries. Interval and
//! level cap are configuration, stored in the term-dictionary header.
//!
//! On-disk layout (appended to the freq stream after a term's postings):
//! levels top-down, each prefixed with its byte length as a vlong. A level
//! entry is `vint doc_delta, vlong freq_delta, vlong prox_delta`, plus, on
//! levels above the lowest, a vlong pointer into the level below.

use std::io::Read;

use crate::error::{KopisError, Result};
use crate::util::varint;

/// Number of skip levels for a postings list of `df` documents.
///
/// Level `l` holds the points whose ordinal is divisible by
/// `interval^l`; it is non-empty exactly when `df / interval >= interval^l`.
pub fn num_levels(df: u32, interval: u32, max_levels: u32) -> u32 {
    let points = (df / interval) as u64;
    let mut levels = 1u32;
    let mut span = interval as u64;
    while span <= points && levels < max_levels {
        levels += 1;
        span *= interval as u64;
    }
    levels
}

/// Buffers skip points for one term and serializes the level stack.
#[derive(Debug)]
pub struct SkipListWriter {
    skip_interval: u32,
    max_levels: u32,
    buffers: Vec<Vec<u8>>,
    last_doc: Vec<u32>,
    last_freq_ptr: Vec<u64>,
    last_prox_ptr: Vec<u64>,
    freq_base: u64,
    prox_base: u64,
    point_count: u32,
}

impl SkipListWriter {
    /// Create a writer with the given tuning.
    pub fn new(skip_interval: u32, max_levels: u32) -> Self {
        let levels = max_levels as usize;
        SkipListWriter {
            skip_interval,
            max_levels,
            buffers: vec![Vec::new(); levels],
            last_doc: vec![0; levels],
            last_freq_ptr: vec![0; levels],
            last_prox_ptr: vec![0; levels],
            freq_base: 0,
            prox_base: 0,
            point_count: 0,
        }
    }

    /// Reset for a new term whose postings start at the given stream
    /// positions.
    pub fn reset(&mut self, freq_base: u64, prox_base: u64) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.last_doc.fill(0);
        self.last_freq_ptr.fill(freq_base);
        self.last_prox_ptr.fill(prox_base);
        self.freq_base = freq_base;
        self.prox_base = prox_base;
        self.point_count = 0;
    }

    /// Record a skip point: `doc` is the last document written so far and
    /// the pointers are the current freq/prox stream positions.
    pub fn buffer_skip(&mut self, doc: u32, freq_ptr: u64, prox_ptr: u64) -> Result<()> {
        self.point_count += 1;

        // The point reaches level l while interval^l divides its ordinal.
        let mut levels = 1u32;
        let mut n = self.point_count;
        while n % self.skip_interval == 0 && levels < self.max_levels {
            levels += 1;
            n /= self.skip_interval;
        }

        let mut child_ptr = 0u64;
        for level in 0..levels as usize {
            let buffer = &mut self.buffers[level];
            varint::write_u32(buffer, doc - self.last_doc[level])?;
            varint::write_u64(buffer, freq_ptr - self.last_freq_ptr[level])?;
            varint::write_u64(buffer, prox_ptr - self.last_prox_ptr[level])?;
            if level > 0 {
                varint::write_u64(buffer, child_ptr)?;
            }
            self.last_doc[level] = doc;
            self.last_freq_ptr[level] = freq_ptr;
            self.last_prox_ptr[level] = prox_ptr;
            child_ptr = self.buffers[level].len() as u64;
        }
        Ok(())
    }

    /// True if at least one skip point was buffered.
    pub fn has_skip_data(&self) -> bool {
        self.point_count > 0
    }

    /// Serialize the buffered levels, top-down, into `out`.
    pub fn serialize(&self, df: u32) -> Result<Vec<u8>> {
        let levels = num_levels(df, self.skip_interval, self.max_levels) as usize;
        let mut out = Vec::new();
        for level in (0..levels).rev() {
            varint::write_u64(&mut out, self.buffers[level].len() as u64)?;
            out.extend_from_slice(&self.buffers[level]);
        }
        Ok(out)
    }
}

/// The skip point a seek landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipResult {
    /// The last document covered by the applied skip point.
    pub doc: u32,
    /// Freq stream position right after that document's entry.
    pub freq_ptr: u64,
    /// Prox stream position right after that document's positions.
    pub prox_ptr: u64,
    /// Total documents consumed up to and including `doc`.
    pub docs_skipped: u32,
}

/// One level's cursor state while seeking.
#[derive(Debug)]
struct SkipLevel {
    data: Vec<u8>,
    pos: usize,
    /// Pending (not yet applied) skip point.
    doc: u32,
    freq_ptr: u64,
    prox_ptr: u64,
    child_ptr: u64,
    /// Level-0 ordinal of the pending point; 0 for the virtual start point.
    ord: u64,
}

impl SkipLevel {
    fn exhausted(&self) -> bool {
        self.doc == u32::MAX
    }
}

/// Walks the serialized level stack to satisfy forward seeks.
#[derive(Debug)]
pub struct SkipListReader {
    skip_interval: u32,
    levels: Vec<SkipLevel>,
    /// Applied state.
    last_doc: u32,
    last_freq_ptr: u64,
    last_prox_ptr: u64,
    last_child_ptr: u64,
    points_applied: u64,
}

impl SkipListReader {
    /// Read the serialized level stack from `input` (positioned at the
    /// term's skip data) and prepare for seeking.
    pub fn read<R: Read>(
        input: &mut R,
        df: u32,
        skip_interval: u32,
        max_levels: u32,
        freq_base: u64,
        prox_base: u64,
    ) -> Result<Self> {
        let count = num_levels(df, skip_interval, max_levels) as usize;
        let mut stacked = Vec::with_capacity(count);
        for _ in 0..count {
            let len = varint::read_u64(input)? as usize;
            let mut data = vec![0u8; len];
            input.read_exact(&mut data)?;
            stacked.push(data);
        }
        // Serialized top-down; index by level number.
        stacked.reverse();

        let levels = stacked
            .into_iter()
            .map(|data| SkipLevel {
                data,
                pos: 0,
                doc: 0,
                freq_ptr: freq_base,
                prox_ptr: prox_base,
                child_ptr: 0,
                ord: 0,
            })
            .collect();

        Ok(SkipListReader {
            skip_interval,
            levels,
            last_doc: 0,
            last_freq_ptr: freq_base,
            last_prox_ptr: prox_base,
            last_child_ptr: 0,
            points_applied: 0,
        })
    }

    /// Advance to the last skip point strictly before `target`.
    ///
    /// Returns `None` if no real skip point was applied (the target falls
    /// inside the first block).
    pub fn skip_to(&mut self, target: u32) -> Result<Option<SkipResult>> {
        let mut level = 0usize;
        while level + 1 < self.levels.len() && target > self.levels[level + 1].doc {
            level += 1;
        }

        loop {
            if target > self.levels[level].doc && !self.levels[level].exhausted() {
                self.load_next(level)?;
            } else if level > 0 {
                if self.last_child_ptr > self.levels[level - 1].pos as u64 {
                    self.seek_child(level - 1);
                }
                level -= 1;
            } else {
                break;
            }
        }

        if self.points_applied == 0 {
            return Ok(None);
        }
        Ok(Some(SkipResult {
            doc: self.last_doc,
            freq_ptr: self.last_freq_ptr,
            prox_ptr: self.last_prox_ptr,
            docs_skipped: (self.points_applied * self.skip_interval as u64) as u32,
        }))
    }

    /// Apply the pending point at `level` and read the next one.
    fn load_next(&mut self, level: usize) -> Result<()> {
        let span = (self.skip_interval as u64).pow(level as u32);
        let lvl = &mut self.levels[level];

        self.last_doc = lvl.doc;
        self.last_freq_ptr = lvl.freq_ptr;
        self.last_prox_ptr = lvl.prox_ptr;
        self.last_child_ptr = lvl.child_ptr;
        self.points_applied = lvl.ord;

        if lvl.pos >= lvl.data.len() {
            lvl.doc = u32::MAX;
            return Ok(());
        }

        lvl.doc += read_vint(&lvl.data, &mut lvl.pos)?;
        lvl.freq_ptr += read_vlong(&lvl.data, &mut lvl.pos)?;
        lvl.prox_ptr += read_vlong(&lvl.data, &mut lvl.pos)?;
        if level > 0 {
            lvl.child_ptr = read_vlong(&lvl.data, &mut lvl.pos)?;
        }
        lvl.ord += span;
        Ok(())
    }

    /// Position a child level at the section following the applied point.
    fn seek_child(&mut self, level: usize) {
        let lvl = &mut self.levels[level];
        lvl.pos = self.last_child_ptr as usize;
        lvl.doc = self.last_doc;
        lvl.freq_ptr = self.last_freq_ptr;
        lvl.prox_ptr = self.last_prox_ptr;
        lvl.child_ptr = 0;
        lvl.ord = self.points_applied;
    }
}

fn read_vint(data: &[u8], pos: &mut usize) -> Result<u32> {
    let (value, consumed) = varint::decode_u32(
        data.get(*pos..)
            .ok_or_else(|| KopisError::corrupt("skip data truncated"))?,
    )?;
    *pos += consumed;
    Ok(value)
}

fn read_vlong(data: &[u8], pos: &mut usize) -> Result<u64> {
    let (value, consumed) = varint::decode_u64(
        data.get(*pos..)
            .ok_or_else(|| KopisError::corrupt("skip data truncated"))?,
    )?;
    *pos += consumed;
    Ok(value)
}
