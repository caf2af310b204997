//! # wordtok
//!
//! Decoder for the front-coded word dictionaries used by classic adventure
//! game interpreters (`WORDS.TOK`).
//!
//! The dictionary maps player words to numeric word ids. Its layout is
//! oriented string → id: words are grouped in 26 first-letter buckets, and
//! resolving an id back to a word needs a full scan. [`Dictionary`] does both
//! directions over a borrowed buffer, with every read bounds-checked so that
//! malformed data cannot cause a panic.
//!
//! ```
//! use wordtok::{Dictionary, DictionaryBuilder};
//!
//! let mut builder = DictionaryBuilder::new();
//! builder.insert("look", 10)?;
//! builder.insert("castle", 25)?;
//! let bytes = builder.build()?;
//!
//! let dict = Dictionary::new(&bytes)?;
//! assert_eq!(dict.lookup(25).as_deref(), Some("castle"));
//! assert_eq!(dict.find_id("look"), Some(10));
//! # Ok::<(), wordtok::DictionaryError>(())
//! ```

pub mod builder;
pub mod cursor;
pub mod dictionary;
pub mod error;

pub use builder::DictionaryBuilder;
pub use cursor::Cursor;
pub use dictionary::{Dictionary, Entries, WordEntry, HEADER_LEN, MAX_WORD_LEN};
pub use error::DictionaryError;

use std::path::Path;

/// Read a dictionary file into memory and log its size.
///
/// The returned bytes are then borrowed by [`Dictionary::new`].
pub fn read_file(path: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    log::debug!("Read dictionary {} ({} bytes)", path.display(), data.len());
    Ok(data)
}
