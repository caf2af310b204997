//! Encoder producing dictionaries in the same front-coded layout.
//!
//! Used by tests and tooling to fabricate dictionaries without shipping game
//! files.

use std::collections::{BTreeMap, HashMap};

use crate::dictionary::{BUCKET_COUNT, HEADER_LEN, MAX_WORD_LEN};
use crate::error::DictionaryError;

/// Accumulates `word -> id` pairs and encodes them.
///
/// Synonyms may share an id; a word can only be inserted once.
#[derive(Debug, Default, Clone)]
pub struct DictionaryBuilder {
    words: BTreeMap<String, u16>,
}

impl DictionaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a word. Words are lower-cased, must start with `a`..=`z` and fit
    /// the decoder's [`MAX_WORD_LEN`] bytes.
    pub fn insert(&mut self, word: &str, id: u16) -> Result<&mut Self, DictionaryError> {
        let word = word.trim().to_ascii_lowercase();
        let invalid = |reason| DictionaryError::InvalidWord {
            word: word.clone(),
            reason,
        };
        if !word.is_ascii() {
            return Err(invalid("only ASCII is representable"));
        }
        match word.bytes().next() {
            None => return Err(invalid("empty word")),
            Some(b) if !b.is_ascii_lowercase() => return Err(invalid("must start with a letter")),
            Some(_) => {}
        }
        if word.len() > MAX_WORD_LEN {
            return Err(invalid("longer than the 64-byte word limit"));
        }
        self.words.insert(word, id);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Encode the dictionary. Within a bucket words are stored sorted, each
    /// sharing its longest common prefix with the previous word.
    pub fn build(&self) -> Result<Vec<u8>, DictionaryError> {
        let mut out = vec![0u8; HEADER_LEN];
        let mut buckets: HashMap<u8, Vec<(&str, u16)>> = HashMap::new();
        for (word, &id) in &self.words {
            let letter = word.as_bytes()[0] - b'a';
            buckets.entry(letter).or_default().push((word.as_str(), id));
        }

        for letter in 0..BUCKET_COUNT as u8 {
            let Some(words) = buckets.get(&letter) else {
                continue;
            };
            let offset = u16::try_from(out.len())
                .map_err(|_| DictionaryError::TooLarge { size: out.len() })?;
            let slot = usize::from(letter) * 2;
            out[slot..slot + 2].copy_from_slice(&offset.to_be_bytes());

            let mut previous: &str = "";
            for &(word, id) in words {
                let shared = common_prefix(previous, word);
                out.push(shared as u8);
                let suffix = &word.as_bytes()[shared..];
                for (i, &c) in suffix.iter().enumerate() {
                    let mut byte = (c ^ 0x7F) & 0x7F;
                    if i + 1 == suffix.len() {
                        byte |= 0x80;
                    }
                    out.push(byte);
                }
                out.extend(id.to_be_bytes());
                previous = word;
            }
            out.push(0);
        }
        Ok(out)
    }
}

/// Length of the shared prefix, never the whole of `word` so at least one
/// suffix byte is always written.
fn common_prefix(previous: &str, word: &str) -> usize {
    let shared = previous
        .bytes()
        .zip(word.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    shared.min(word.len().saturating_sub(1))
}
