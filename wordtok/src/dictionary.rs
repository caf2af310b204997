//! Front-coded word dictionary decoding.

use crate::cursor::Cursor;
use crate::error::DictionaryError;

/// Number of first-letter buckets (`a` through `z`).
pub const BUCKET_COUNT: usize = 26;

/// Size of the big-endian bucket offset table at the start of the file.
pub const HEADER_LEN: usize = BUCKET_COUNT * 2;

/// Longest word kept when decoding; longer suffixes are consumed and dropped.
pub const MAX_WORD_LEN: usize = 64;

/// One decoded dictionary entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordEntry {
    /// Game word id. Synonyms share an id.
    pub id: u16,
    pub word: String,
    /// Bucket index, `0` for `a`.
    pub bucket: u8,
}

/// A borrowed view of a `WORDS.TOK` style dictionary.
///
/// The layout is 26 big-endian `u16` offsets, one per first letter, followed
/// by the buckets. Each bucket entry is a prefix length (characters reused
/// from the previous word), the suffix characters encoded as
/// `(c ^ 0x7F)` with the high bit set on the last one, and a big-endian
/// `u16` word id. A zero prefix after at least one entry ends the bucket.
///
/// The buffer is owned by the host engine; nothing here copies or mutates it.
#[derive(Debug, Clone, Copy)]
pub struct Dictionary<'a> {
    data: &'a [u8],
}

impl<'a> Dictionary<'a> {
    /// Wrap a dictionary buffer. Only the header length is checked up front;
    /// everything past it is validated lazily while scanning.
    pub fn new(data: &'a [u8]) -> Result<Self, DictionaryError> {
        if data.len() < HEADER_LEN {
            return Err(DictionaryError::TooShort {
                len: data.len(),
                needed: HEADER_LEN,
            });
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Iterate over every entry in scan order (bucket `a` first).
    pub fn entries(&self) -> Entries<'a> {
        Entries::new(self.data, 0..BUCKET_COUNT)
    }

    /// Number of decodable entries.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Resolve a word id to the first word carrying it, in scan order.
    ///
    /// Ids are not ordered in the format, so this is a full scan.
    pub fn lookup(&self, id: u16) -> Option<String> {
        self.entries().find(|entry| entry.id == id).map(|entry| entry.word)
    }

    /// Resolve a word to its id, scanning only the word's first-letter bucket.
    pub fn find_id(&self, word: &str) -> Option<u16> {
        let word = word.trim().to_ascii_lowercase();
        let first = word.bytes().next()?;
        if !first.is_ascii_lowercase() {
            return None;
        }
        let bucket = usize::from(first - b'a');
        Entries::new(self.data, bucket..bucket + 1)
            .find(|entry| entry.word == word)
            .map(|entry| entry.id)
    }

    /// Comma-joined list of the first `max` non-empty words in scan order.
    ///
    /// Game dictionaries insert verbs first, so this doubles as a vocabulary
    /// hint for prompts.
    pub fn sample_common_words(&self, max: usize) -> String {
        self.entries()
            .filter(|entry| !entry.word.is_empty())
            .take(max)
            .map(|entry| entry.word)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Iterator over dictionary entries, produced by [`Dictionary::entries`].
#[derive(Debug, Clone)]
pub struct Entries<'a> {
    data: &'a [u8],
    buckets: std::ops::Range<usize>,
    current: Option<BucketScan<'a>>,
}

impl<'a> Entries<'a> {
    fn new(data: &'a [u8], buckets: std::ops::Range<usize>) -> Self {
        Self {
            data,
            buckets,
            current: None,
        }
    }

    fn open_next_bucket(&mut self) -> bool {
        for bucket in self.buckets.by_ref() {
            let mut header = Cursor::at(self.data, bucket * 2);
            let Some(offset) = header.read_u16_be() else {
                continue;
            };
            let offset = usize::from(offset);
            // Offset 0 marks a letter with no words.
            if offset == 0 || offset >= self.data.len() {
                continue;
            }
            self.current = Some(BucketScan {
                cursor: Cursor::at(self.data, offset),
                bucket: bucket as u8,
                word: Vec::with_capacity(MAX_WORD_LEN),
                read: 0,
            });
            return true;
        }
        false
    }
}

impl Iterator for Entries<'_> {
    type Item = WordEntry;

    fn next(&mut self) -> Option<WordEntry> {
        loop {
            if let Some(scan) = self.current.as_mut() {
                if let Some(entry) = scan.next_entry() {
                    return Some(entry);
                }
                self.current = None;
            }
            if !self.open_next_bucket() {
                return None;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct BucketScan<'a> {
    cursor: Cursor<'a>,
    bucket: u8,
    word: Vec<u8>,
    read: usize,
}

impl BucketScan<'_> {
    fn next_entry(&mut self) -> Option<WordEntry> {
        let prefix = usize::from(self.cursor.read_u8()?);
        if prefix == 0 && self.read > 0 {
            return None;
        }
        // A prefix longer than the previous word is malformed; keep what we have.
        self.word.truncate(prefix.min(self.word.len()));

        loop {
            let byte = self.cursor.read_u8()?;
            if self.word.len() < MAX_WORD_LEN {
                self.word.push((byte & 0x7F) ^ 0x7F);
            }
            if byte & 0x80 != 0 {
                break;
            }
        }

        let id = self.cursor.read_u16_be()?;
        self.read += 1;
        Some(WordEntry {
            id,
            word: self.word.iter().map(|&b| char::from(b)).collect(),
            bucket: self.bucket,
        })
    }
}
