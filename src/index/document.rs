//! The document model this core consumes.
//!
//! Analysis lives outside this crate: indexed fields arrive as token
//! streams with positions (and optionally character offsets) already
//! assigned. The convenience constructors split on whitespace for callers
//! that index pre-normalized text, which is all the tests need.

/// A stored field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Binary(Vec<u8>),
}

impl StoredValue {
    /// The text form, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            StoredValue::Binary(_) => None,
        }
    }

    /// The length of the value in bytes.
    pub fn byte_len(&self) -> usize {
        match self {
            StoredValue::Text(s) => s.len(),
            StoredValue::Binary(b) => b.len(),
        }
    }
}

/// Per-field indexing options.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOptions {
    /// Invert the field into the term dictionary.
    pub indexed: bool,
    /// Keep the field value in the stored-fields file.
    pub stored: bool,
    /// Store per-document term vectors.
    pub store_term_vector: bool,
    /// Store positions inside the term vectors.
    pub store_positions_with_vector: bool,
    /// Store character offsets inside the term vectors.
    pub store_offsets_with_vector: bool,
    /// Skip norm bytes for this field.
    pub omit_norms: bool,
    /// Skip position data in the postings.
    pub omit_positions: bool,
    /// Index-time boost folded into the norm byte.
    pub boost: f32,
}

impl Default for FieldOptions {
    fn default() -> Self {
        FieldOptions {
            indexed: true,
            stored: false,
            store_term_vector: false,
            store_positions_with_vector: false,
            store_offsets_with_vector: false,
            omit_norms: false,
            omit_positions: false,
            boost: 1.0,
        }
    }
}

/// One analyzed token of an indexed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The token text.
    pub text: String,
    /// Position within the field, starting at 0.
    pub position: u32,
    /// Start character offset, if the analyzer produced offsets.
    pub start_offset: u32,
    /// End character offset.
    pub end_offset: u32,
}

/// One field of a document.
#[derive(Debug, Clone)]
pub struct Field {
    /// The field name.
    pub name: String,
    /// Indexing options.
    pub options: FieldOptions,
    /// The stored value, when `options.stored` is set.
    pub stored: Option<StoredValue>,
    /// The analyzed token stream, when `options.indexed` is set.
    pub tokens: Vec<Token>,
}

impl Field {
    /// An indexed and stored text field, tokenized on whitespace.
    pub fn text<S: Into<String>>(name: S, value: &str) -> Self {
        let options = FieldOptions {
            stored: true,
            ..FieldOptions::default()
        };
        Field {
            name: name.into(),
            tokens: whitespace_tokens(value),
            stored: Some(StoredValue::Text(value.to_string())),
            options,
        }
    }

    /// An indexed-only text field, tokenized on whitespace.
    pub fn unstored_text<S: Into<String>>(name: S, value: &str) -> Self {
        Field {
            name: name.into(),
            tokens: whitespace_tokens(value),
            stored: None,
            options: FieldOptions::default(),
        }
    }

    /// A single-token field indexed verbatim and stored, for identifiers.
    pub fn keyword<S: Into<String>>(name: S, value: &str) -> Self {
        let options = FieldOptions {
            stored: true,
            omit_norms: true,
            ..FieldOptions::default()
        };
        Field {
            name: name.into(),
            tokens: vec![Token {
                text: value.to_string(),
                position: 0,
                start_offset: 0,
                end_offset: value.len() as u32,
            }],
            stored: Some(StoredValue::Text(value.to_string())),
            options,
        }
    }

    /// A stored-only field, never inverted.
    pub fn stored<S: Into<String>>(name: S, value: StoredValue) -> Self {
        let options = FieldOptions {
            indexed: false,
            stored: true,
            omit_norms: true,
            ..FieldOptions::default()
        };
        Field {
            name: name.into(),
            tokens: Vec::new(),
            stored: Some(value),
            options,
        }
    }

    /// A field from a pre-analyzed token stream.
    pub fn with_tokens<S: Into<String>>(
        name: S,
        options: FieldOptions,
        tokens: Vec<Token>,
        stored: Option<StoredValue>,
    ) -> Self {
        Field {
            name: name.into(),
            options,
            stored,
            tokens,
        }
    }

    /// Enable term vectors on this field.
    pub fn with_term_vector(mut self, positions: bool, offsets: bool) -> Self {
        self.options.store_term_vector = true;
        self.options.store_positions_with_vector = positions;
        self.options.store_offsets_with_vector = offsets;
        self
    }
}

/// A document: an ordered list of fields.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// The document's fields.
    pub fields: Vec<Field>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Document::default()
    }

    /// Add a field, builder style.
    pub fn add(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Get the first stored value for a field name.
    pub fn get(&self, name: &str) -> Option<&StoredValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.stored.as_ref())
    }
}

fn whitespace_tokens(value: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut position = 0u32;
    let mut offset = 0u32;

    for part in value.split_whitespace() {
        // Offsets are byte offsets into the original value.
        let start = value[offset as usize..]
            .find(part)
            .map(|i| offset + i as u32)
            .unwrap_or(offset);
        let end = start + part.len() as u32;
        tokens.push(Token {
            text: part.to_string(),
            position,
            start_offset: start,
            end_offset: end,
        });
        position += 1;
        offset = end;
    }

    tokens
}
