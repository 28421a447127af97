//! Tokenizers
//!
//! The inference core only needs the [`Tokenizer`] contract: text to ids,
//! ids to text, vocabulary size and the optional unknown / end-of-text ids.
//! Two built-in implementations cover the models this crate loads:
//!
//! - [`ByteTokenizer`]: one id per byte plus optional specials
//! - [`VocabTokenizer`]: greedy longest match over a container's token list,
//!   with `▁`/`Ġ` space markers and `<0xNN>` byte fallback
//!
//! [`BuiltinTokenizer`] is the closed union of both, dispatched by `match`.

use std::collections::HashMap;

use crate::error::{InferirError, Result};
use crate::gguf::{GgufFile, MetadataValue};

/// Text ↔ token id mapping
pub trait Tokenizer: Send + Sync {
    /// Encode text to ids (no special tokens added)
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the text cannot be represented
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text; special tokens decode to nothing
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an id outside the vocabulary
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Number of ids
    fn vocab_size(&self) -> usize;

    /// Id substituted for unrepresentable text
    fn unknown_token_id(&self) -> Option<u32> {
        None
    }

    /// Id that ends generation
    fn end_of_text_id(&self) -> Option<u32> {
        None
    }

    /// Append the raw bytes of one token to `out`
    ///
    /// Used for streaming, where a multi-byte character may span tokens.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an id outside the vocabulary
    fn token_bytes(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(self.decode(&[id])?.as_bytes());
        Ok(())
    }
}

fn out_of_vocab(id: u32, vocab: usize) -> InferirError {
    InferirError::validation(format!("Token id {id} outside vocabulary of {vocab}"))
}

/// One id per byte; ids at or above 256 are special tokens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteTokenizer {
    bos: Option<u32>,
    eos: Option<u32>,
}

impl ByteTokenizer {
    /// Byte ids only
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte ids plus beginning/end specials
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a special collides with a byte id
    pub fn with_specials(bos: Option<u32>, eos: Option<u32>) -> Result<Self> {
        if bos.is_some_and(|b| b < 256) || eos.is_some_and(|e| e < 256) {
            return Err(InferirError::validation("Special tokens must be >= 256"));
        }
        Ok(Self { bos, eos })
    }

    /// Beginning-of-sequence id
    #[must_use]
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    fn is_special(&self, id: u32) -> bool {
        Some(id) == self.bos || Some(id) == self.eos
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            self.token_bytes(id, &mut bytes)?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        [self.bos, self.eos]
            .into_iter()
            .flatten()
            .map(|id| id as usize + 1)
            .max()
            .unwrap_or(0)
            .max(256)
    }

    fn end_of_text_id(&self) -> Option<u32> {
        self.eos
    }

    fn token_bytes(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        match u8::try_from(id) {
            Ok(b) => out.push(b),
            Err(_) if self.is_special(id) => {},
            Err(_) => return Err(out_of_vocab(id, self.vocab_size())),
        }
        Ok(())
    }
}

/// Word-boundary convention of a vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceMarker {
    /// SentencePiece `▁`, with a dummy prefix at the start of text
    SentencePiece,
    /// Byte-level BPE `Ġ`
    ByteLevel,
    /// Spaces are literal
    None,
}

impl SpaceMarker {
    fn symbol(self) -> Option<char> {
        match self {
            Self::SentencePiece => Some('▁'),
            Self::ByteLevel => Some('Ġ'),
            Self::None => None,
        }
    }
}

/// Longest-match tokenizer over an explicit token list
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    tokens: Vec<String>,
    token_to_id: HashMap<String, u32>,
    /// `<0xNN>` fallback ids by byte value
    byte_ids: Vec<Option<u32>>,
    /// Longest token in bytes
    max_token_len: usize,
    marker: SpaceMarker,
    unk: Option<u32>,
    bos: Option<u32>,
    eos: Option<u32>,
}

fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

impl VocabTokenizer {
    /// Build from tokens in id order
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the list is empty, has more than `u32::MAX`
    /// entries, or a special id is out of range
    pub fn from_tokens(
        tokens: Vec<String>,
        unk: Option<u32>,
        bos: Option<u32>,
        eos: Option<u32>,
    ) -> Result<Self> {
        if tokens.is_empty() {
            return Err(InferirError::validation("Vocabulary cannot be empty"));
        }
        if u32::try_from(tokens.len()).is_err() {
            return Err(InferirError::validation("Vocabulary exceeds u32 ids"));
        }
        for id in [unk, bos, eos].into_iter().flatten() {
            if id as usize >= tokens.len() {
                return Err(out_of_vocab(id, tokens.len()));
            }
        }

        let mut token_to_id = HashMap::with_capacity(tokens.len());
        let mut byte_ids = vec![None; 256];
        let mut max_token_len = 0;
        let (mut sp, mut bl) = (0usize, 0usize);
        for (id, token) in tokens.iter().enumerate() {
            let id = id as u32;
            if let Some(b) = parse_byte_token(token) {
                byte_ids[b as usize].get_or_insert(id);
                continue;
            }
            if Some(id) == bos || Some(id) == eos {
                continue;
            }
            sp += usize::from(token.starts_with('▁'));
            bl += usize::from(token.starts_with('Ġ'));
            max_token_len = max_token_len.max(token.len());
            // First occurrence wins on duplicates
            token_to_id.entry(token.clone()).or_insert(id);
        }
        let marker = if sp > 0 && sp >= bl {
            SpaceMarker::SentencePiece
        } else if bl > 0 {
            SpaceMarker::ByteLevel
        } else {
            SpaceMarker::None
        };

        Ok(Self {
            tokens,
            token_to_id,
            byte_ids,
            max_token_len,
            marker,
            unk,
            bos,
            eos,
        })
    }

    /// Build from a container's `tokenizer.ggml.*` metadata
    ///
    /// # Errors
    ///
    /// Returns `Format` if the token list is missing or not strings
    pub fn from_gguf(file: &GgufFile) -> Result<Self> {
        let tokens = file
            .get("tokenizer.ggml.tokens")
            .and_then(MetadataValue::as_array)
            .ok_or_else(|| InferirError::format("Missing tokenizer.ggml.tokens"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| InferirError::format("tokenizer.ggml.tokens must be strings"))
            })
            .collect::<Result<Vec<_>>>()?;
        let id = |k: &str| file.get(k).and_then(MetadataValue::as_u32);
        Self::from_tokens(
            tokens,
            id("tokenizer.ggml.unknown_token_id"),
            id("tokenizer.ggml.bos_token_id"),
            id("tokenizer.ggml.eos_token_id"),
        )
        .map_err(|e| InferirError::format(format!("Tokenizer metadata: {e}")))
    }

    /// Token string by id
    #[must_use]
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    fn normalize(&self, text: &str) -> String {
        match self.marker.symbol() {
            Some(m) => {
                let mut s = String::with_capacity(text.len() + 3);
                if self.marker == SpaceMarker::SentencePiece && !text.is_empty() {
                    s.push(m);
                }
                s.extend(text.chars().map(|c| if c == ' ' { m } else { c }));
                s
            },
            None => text.to_string(),
        }
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let text = self.normalize(text);
        let mut ids = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let mut end = rest.len().min(self.max_token_len);
            let mut matched = None;
            while end > 0 {
                if rest.is_char_boundary(end) {
                    if let Some(&id) = self.token_to_id.get(&rest[..end]) {
                        matched = Some((id, end));
                        break;
                    }
                }
                end -= 1;
            }
            if let Some((id, len)) = matched {
                ids.push(id);
                pos += len;
                continue;
            }

            // No token starts here: byte fallback for one character
            let ch_len = rest.chars().next().map_or(1, char::len_utf8);
            let bytes = &rest.as_bytes()[..ch_len];
            if bytes.iter().all(|&b| self.byte_ids[b as usize].is_some()) {
                ids.extend(bytes.iter().filter_map(|&b| self.byte_ids[b as usize]));
            } else if let Some(unk) = self.unk {
                ids.push(unk);
            } else {
                return Err(InferirError::validation(format!(
                    "Cannot encode {:?} and the vocabulary has no unknown token",
                    &rest[..ch_len]
                )));
            }
            pos += ch_len;
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            self.token_bytes(id, &mut bytes)?;
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(match self.marker {
            SpaceMarker::SentencePiece => text.strip_prefix(' ').map(str::to_string).unwrap_or(text),
            _ => text,
        })
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn unknown_token_id(&self) -> Option<u32> {
        self.unk
    }

    fn end_of_text_id(&self) -> Option<u32> {
        self.eos
    }

    fn token_bytes(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        let token = self
            .token(id)
            .ok_or_else(|| out_of_vocab(id, self.tokens.len()))?;
        if Some(id) == self.bos || Some(id) == self.eos {
            return Ok(());
        }
        if let Some(b) = parse_byte_token(token) {
            out.push(b);
            return Ok(());
        }
        match self.marker.symbol() {
            Some(m) => {
                let mut buf = [0u8; 4];
                for c in token.chars() {
                    let c = if c == m { ' ' } else { c };
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            },
            None => out.extend_from_slice(token.as_bytes()),
        }
        Ok(())
    }
}

/// Closed set of built-in tokenizers
#[derive(Debug, Clone)]
pub enum BuiltinTokenizer {
    /// Byte-level
    Byte(ByteTokenizer),
    /// Token-list based
    Vocab(VocabTokenizer),
}

impl BuiltinTokenizer {
    /// The container's vocabulary when it has one, otherwise bytes with the
    /// model's specials
    ///
    /// # Errors
    ///
    /// Returns `Format` if the container's tokenizer metadata is malformed
    pub fn from_gguf(file: &GgufFile) -> Result<Self> {
        if file.get("tokenizer.ggml.tokens").is_some() {
            return VocabTokenizer::from_gguf(file).map(Self::Vocab);
        }
        let id = |k: &str| {
            file.get(k)
                .and_then(MetadataValue::as_u32)
                .filter(|&id| id >= 256)
        };
        let byte = ByteTokenizer::with_specials(
            id("tokenizer.ggml.bos_token_id"),
            id("tokenizer.ggml.eos_token_id"),
        )?;
        Ok(Self::Byte(byte))
    }
}

impl Tokenizer for BuiltinTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::Byte(t) => t.encode(text),
            Self::Vocab(t) => t.encode(text),
        }
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::Byte(t) => t.decode(ids),
            Self::Vocab(t) => t.decode(ids),
        }
    }

    fn vocab_size(&self) -> usize {
        match self {
            Self::Byte(t) => t.vocab_size(),
            Self::Vocab(t) => t.vocab_size(),
        }
    }

    fn unknown_token_id(&self) -> Option<u32> {
        match self {
            Self::Byte(t) => t.unknown_token_id(),
            Self::Vocab(t) => t.unknown_token_id(),
        }
    }

    fn end_of_text_id(&self) -> Option<u32> {
        match self {
            Self::Byte(t) => t.end_of_text_id(),
            Self::Vocab(t) => t.end_of_text_id(),
        }
    }

    fn token_bytes(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Byte(t) => t.token_bytes(id, out),
            Self::Vocab(t) => t.token_bytes(id, out),
        }
    }
}
