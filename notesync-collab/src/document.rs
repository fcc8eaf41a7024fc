//! Replicated Document: one note's collaboratively-edited content.
//!
//! Wraps a Yrs `Doc` holding a single shared text named [`CONTENT`].
//! All mutation goes through [`ReplicatedDocument::apply_local_change`] or
//! [`ReplicatedDocument::apply_remote_update`]; both take the document lock
//! for the full transaction, so no reader ever observes a half-applied edit.
//!
//! Updates are Yrs v1-encoded. Yrs guarantees that replicas which received
//! the same set of updates converge regardless of order or duplication;
//! updates whose causal dependencies have not arrived yet are parked by Yrs
//! and integrated once the missing pieces show up.

use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::{CollabError, Result};

/// Name of the shared text every replica edits.
pub const CONTENT: &str = "content";

/// A local edit against the document text.
///
/// `index` and `len` count chars (Unicode scalar values), not bytes. Both
/// are clamped to the current text, so a well-formed mutation never fails
/// and never splits a multibyte character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
    Append(String),
}

impl Mutation {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        Self::Insert { index, text: text.into() }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        Self::Delete { index, len }
    }

    pub fn append(text: impl Into<String>) -> Self {
        Self::Append(text.into())
    }
}

/// In-memory CRDT replica for one document name.
pub struct ReplicatedDocument {
    name: String,
    doc: Mutex<Doc>,
    text: TextRef,
}

impl ReplicatedDocument {
    pub fn new(name: impl Into<String>) -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT);
        Self {
            name: name.into(),
            doc: Mutex::new(doc),
            text,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a local mutation and return the delta that captures it.
    ///
    /// The delta is the diff between the state vector before and after the
    /// edit, which includes the delete set, so it replays deletions too.
    pub fn apply_local_change(&self, mutation: &Mutation) -> Vec<u8> {
        let doc = self.doc.lock();
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let current = self.text.get_string(&txn);
            match mutation {
                Mutation::Insert { index, text } => {
                    if !text.is_empty() {
                        let at = byte_offset(&current, *index);
                        self.text.insert(&mut txn, at, text);
                    }
                }
                Mutation::Delete { index, len: count } => {
                    let start = byte_offset(&current, *index);
                    let end = byte_offset(&current, index.saturating_add(*count));
                    if end > start {
                        self.text.remove_range(&mut txn, start, end - start);
                    }
                }
                Mutation::Append(text) => {
                    if !text.is_empty() {
                        self.text.insert(&mut txn, current.len() as u32, text);
                    }
                }
            }
        }
        let txn = doc.transact();
        txn.encode_diff_v1(&before)
    }

    /// Merge an update produced by another replica.
    ///
    /// Idempotent and commutative. Payloads that fail to decode are rejected
    /// before the document is touched.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| CollabError::InvalidUpdate(e.to_string()))?;
        let doc = self.doc.lock();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::InvalidUpdate(e.to_string()))
    }

    /// Seed the replica from a persisted snapshot.
    pub fn load_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        self.apply_remote_update(snapshot)
    }

    /// Current state vector, v1-encoded.
    pub fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Full snapshot as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything the holder of `since` (a v1-encoded state vector) is missing.
    pub fn encode_state_as_update(&self, since: &[u8]) -> Result<Vec<u8>> {
        let remote = StateVector::decode_v1(since)
            .map_err(|e| CollabError::InvalidUpdate(format!("state vector: {e}")))?;
        let doc = self.doc.lock();
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Current text content.
    pub fn content(&self) -> String {
        let doc = self.doc.lock();
        let txn = doc.transact();
        self.text.get_string(&txn)
    }

    /// Length in chars, the unit [`Mutation`] indices use.
    pub fn len(&self) -> u32 {
        self.content().chars().count() as u32
    }

    pub fn is_empty(&self) -> bool {
        let doc = self.doc.lock();
        let txn = doc.transact();
        self.text.len(&txn) == 0
    }
}

/// Byte offset of the `chars`-th char of `text`, clamped to its end.
fn byte_offset(text: &str, chars: u32) -> u32 {
    let offset = text
        .char_indices()
        .nth(chars as usize)
        .map_or(text.len(), |(i, _)| i);
    offset as u32
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
