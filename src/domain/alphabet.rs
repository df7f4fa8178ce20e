// ============================================================
// Layer 3 — Alphabet
// ============================================================
// Bidirectional mapping between transcript characters and the
// integer label IDs the acoustic model predicts.
//
// One symbol is reserved as the CTC blank. Its ID is the
// `blank` index handed to the CTC loss and to the decoder, and
// `len()` (which includes the blank) is the model's class count.
//
// Default English layout (29 classes):
//   '  → 0
//   ␠  → 1
//   a  → 2 ... z → 27
//   _  → 28   (blank)
//
// Unknown characters:
//   Transcripts are lower-cased first. Anything still outside
//   the vocabulary is a hard error, so a dirty corpus fails at
//   dataset build time instead of silently losing characters.

use std::collections::HashMap;
use thiserror::Error;

/// Character used for the blank symbol in the default alphabet
pub const DEFAULT_BLANK: char = '_';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VocabularyError {
    #[error("character {ch:?} at position {position} is not in the alphabet")]
    UnknownChar { ch: char, position: usize },

    #[error("label id {id} is outside the alphabet (size {size})")]
    UnknownId { id: usize, size: usize },

    #[error("the blank symbol {0:?} cannot appear in a transcript")]
    BlankInTranscript(char),

    #[error("duplicate symbol {0:?} in alphabet definition")]
    DuplicateSymbol(char),

    #[error("blank symbol {0:?} is not part of the alphabet definition")]
    MissingBlank(char),
}

/// Immutable character ↔ label-ID table with a reserved blank.
#[derive(Debug, Clone)]
pub struct Alphabet {
    symbols: Vec<char>,
    mapping: HashMap<char, usize>,
    blank:   usize,
}

impl Alphabet {
    /// Build an alphabet from an ordered list of distinct symbols.
    /// IDs follow the order of `symbols`; `blank` must be one of them.
    pub fn new(
        symbols: impl IntoIterator<Item = char>,
        blank:   char,
    ) -> Result<Self, VocabularyError> {
        let symbols: Vec<char> = symbols.into_iter().collect();
        let mut mapping = HashMap::with_capacity(symbols.len());

        for (id, &ch) in symbols.iter().enumerate() {
            if mapping.insert(ch, id).is_some() {
                return Err(VocabularyError::DuplicateSymbol(ch));
            }
        }

        let blank = *mapping
            .get(&blank)
            .ok_or(VocabularyError::MissingBlank(blank))?;

        Ok(Self { symbols, mapping, blank })
    }

    /// The LibriSpeech character set: apostrophe, space, a–z, blank last.
    pub fn english() -> Self {
        let symbols: Vec<char> = ['\'', ' ']
            .into_iter()
            .chain('a'..='z')
            .chain(std::iter::once(DEFAULT_BLANK))
            .collect();
        let mapping = symbols.iter().enumerate().map(|(id, &ch)| (ch, id)).collect();
        let blank   = symbols.len() - 1;
        Self { symbols, mapping, blank }
    }

    /// Number of classes including the blank
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn blank_id(&self) -> usize {
        self.blank
    }

    /// Encode a transcript. Lower-cases first; unknown characters
    /// and the blank symbol are rejected.
    pub fn text_to_int(&self, text: &str) -> Result<Vec<usize>, VocabularyError> {
        text.to_lowercase()
            .chars()
            .enumerate()
            .map(|(position, ch)| match self.mapping.get(&ch) {
                Some(&id) if id == self.blank => Err(VocabularyError::BlankInTranscript(ch)),
                Some(&id) => Ok(id),
                None => Err(VocabularyError::UnknownChar { ch, position }),
            })
            .collect()
    }

    /// Decode label IDs symbol by symbol. Repeats and blanks are kept
    /// as-is; collapsing them is the decoder's job.
    pub fn int_to_text(&self, ids: &[usize]) -> Result<String, VocabularyError> {
        ids.iter()
            .map(|&id| {
                self.symbols.get(id).copied().ok_or(VocabularyError::UnknownId {
                    id,
                    size: self.symbols.len(),
                })
            })
            .collect()
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Self::english()
    }
}
