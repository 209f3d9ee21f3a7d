//! Per-field metadata and the `.fnm` codec.
//!
//! Fields are numbered densely in registration order; all per-field data in
//! the other files is keyed by these numbers. Merging uses "sticky union"
//! semantics: a field that is indexed, vectorized, etc. in any source
//! becomes so in the merged table.

use ahash::AHashMap;

use crate::error::{KopisError, Result};
use crate::storage::{StructReader, StructWriter};
use crate::storage::traits::{Storage, StorageInput};

const IS_INDEXED: u8 = 0x01;
const STORE_TERM_VECTOR: u8 = 0x02;
const STORE_POSITIONS_WITH_VECTOR: u8 = 0x04;
const STORE_OFFSETS_WITH_VECTOR: u8 = 0x08;
const OMIT_NORMS: u8 = 0x10;
const OMIT_POSITIONS: u8 = 0x20;

/// Metadata for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// The field name.
    pub name: String,
    /// The dense field number within this segment.
    pub number: u32,
    /// Whether the field is inverted into the term dictionary.
    pub indexed: bool,
    /// Whether term vectors are stored for the field.
    pub store_term_vector: bool,
    /// Whether the stored term vectors carry positions.
    pub store_positions_with_vector: bool,
    /// Whether the stored term vectors carry character offsets.
    pub store_offsets_with_vector: bool,
    /// Whether length norms are omitted for the field.
    pub omit_norms: bool,
    /// Whether position data is omitted from the postings.
    pub omit_positions: bool,
}

impl FieldInfo {
    fn flags(&self) -> u8 {
        let mut bits = 0;
        if self.indexed {
            bits |= IS_INDEXED;
        }
        if self.store_term_vector {
            bits |= STORE_TERM_VECTOR;
        }
        if self.store_positions_with_vector {
            bits |= STORE_POSITIONS_WITH_VECTOR;
        }
        if self.store_offsets_with_vector {
            bits |= STORE_OFFSETS_WITH_VECTOR;
        }
        if self.omit_norms {
            bits |= OMIT_NORMS;
        }
        if self.omit_positions {
            bits |= OMIT_POSITIONS;
        }
        bits
    }

    /// True if this field contributes norm bytes.
    pub fn has_norms(&self) -> bool {
        self.indexed && !self.omit_norms
    }
}

/// The ordered table of all fields in a segment.
#[derive(Debug, Clone, Default)]
pub struct FieldInfos {
    by_number: Vec<FieldInfo>,
    by_name: AHashMap<String, u32>,
}

impl FieldInfos {
    /// Create an empty field table.
    pub fn new() -> Self {
        FieldInfos::default()
    }

    /// Register a field, or union the given flags into an existing entry.
    ///
    /// Returns the field number. Existing entries only ever gain
    /// capabilities (sticky union), with the exception of `omit_norms` and
    /// `omit_positions`, where the weaker setting wins: a field that stores
    /// norms or positions anywhere must store them in the union.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        name: &str,
        indexed: bool,
        store_term_vector: bool,
        store_positions_with_vector: bool,
        store_offsets_with_vector: bool,
        omit_norms: bool,
        omit_positions: bool,
    ) -> u32 {
        if let Some(&number) = self.by_name.get(name) {
            let info = &mut self.by_number[number as usize];
            info.indexed |= indexed;
            info.store_term_vector |= store_term_vector;
            info.store_positions_with_vector |= store_positions_with_vector;
            info.store_offsets_with_vector |= store_offsets_with_vector;
            info.omit_norms &= omit_norms;
            info.omit_positions &= omit_positions;
            return number;
        }

        let number = self.by_number.len() as u32;
        self.by_number.push(FieldInfo {
            name: name.to_string(),
            number,
            indexed,
            store_term_vector,
            store_positions_with_vector,
            store_offsets_with_vector,
            omit_norms,
            omit_positions,
        });
        self.by_name.insert(name.to_string(), number);
        number
    }

    /// Union every entry of `other` into this table, renumbering into this
    /// table's dense namespace.
    pub fn merge_from(&mut self, other: &FieldInfos) {
        for info in &other.by_number {
            self.add(
                &info.name,
                info.indexed,
                info.store_term_vector,
                info.store_positions_with_vector,
                info.store_offsets_with_vector,
                info.omit_norms,
                info.omit_positions,
            );
        }
    }

    /// Look up a field by name.
    pub fn by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name
            .get(name)
            .map(|&number| &self.by_number[number as usize])
    }

    /// Look up a field by number.
    pub fn by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.by_number.get(number as usize)
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    /// True if no fields are registered.
    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    /// Iterate fields in number order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_number.iter()
    }

    /// True if any field stores term vectors.
    pub fn has_vectors(&self) -> bool {
        self.by_number.iter().any(|f| f.store_term_vector)
    }

    /// True if any indexed field keeps position data.
    pub fn has_prox(&self) -> bool {
        self.by_number.iter().any(|f| f.indexed && !f.omit_positions)
    }

    /// True if any field contributes norm bytes.
    pub fn has_norms(&self) -> bool {
        self.by_number.iter().any(|f| f.has_norms())
    }

    /// Write the table as a `.fnm` file.
    pub fn write(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_vint(self.by_number.len() as u32)?;
        for info in &self.by_number {
            writer.write_string(&info.name)?;
            writer.write_u8(info.flags())?;
        }
        writer.close()
    }

    /// Read a `.fnm` file.
    pub fn read(input: Box<dyn StorageInput>) -> Result<Self> {
        let mut reader = StructReader::new(input)?;
        let count = reader.read_vint()? as usize;
        let mut infos = FieldInfos::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let bits = reader.read_u8()?;
            if infos.by_name.contains_key(&name) {
                return Err(KopisError::corrupt(format!(
                    "duplicate field in field table: {name}"
                )));
            }
            infos.add(
                &name,
                bits & IS_INDEXED != 0,
                bits & STORE_TERM_VECTOR != 0,
                bits & STORE_POSITIONS_WITH_VECTOR != 0,
                bits & STORE_OFFSETS_WITH_VECTOR != 0,
                bits & OMIT_NORMS != 0,
                bits & OMIT_POSITIONS != 0,
            );
        }
        Ok(infos)
    }
}
