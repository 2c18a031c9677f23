//! Compact bitset over table numbers.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::TableNumber;

const WORD_BITS: usize = 64;

/// Set of tables referenced by a predicate or assigned to a join prefix.
///
/// Queries rarely exceed 64 tables, so the common case stays inline.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableMap {
    words: SmallVec<[u64; 1]>,
}

impl TableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(table: TableNumber) -> Self {
        let mut map = Self::new();
        map.insert(table);
        map
    }

    pub fn insert(&mut self, table: TableNumber) {
        let (word, bit) = Self::locate(table);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    pub fn remove(&mut self, table: TableNumber) {
        let (word, bit) = Self::locate(table);
        if let Some(slot) = self.words.get_mut(word) {
            *slot &= !(1u64 << bit);
        }
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn contains(&self, table: TableNumber) -> bool {
        let (word, bit) = Self::locate(table);
        self.words
            .get(word)
            .map(|slot| slot & (1u64 << bit) != 0)
            .unwrap_or(false)
    }

    /// True when every table in `other` is also in `self`.
    pub fn contains_all(&self, other: &TableMap) -> bool {
        other.words.iter().enumerate().all(|(idx, word)| {
            let mine = self.words.get(idx).copied().unwrap_or(0);
            word & !mine == 0
        })
    }

    pub fn intersects(&self, other: &TableMap) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn union_with(&mut self, other: &TableMap) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (slot, word) in self.words.iter_mut().zip(other.words.iter()) {
            *slot |= word;
        }
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn has_single_table(&self) -> bool {
        self.len() == 1
    }

    pub fn first(&self) -> Option<TableNumber> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = TableNumber> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| TableNumber((idx * WORD_BITS + bit) as u16))
        })
    }

    fn locate(table: TableNumber) -> (usize, usize) {
        let raw = table.0 as usize;
        (raw / WORD_BITS, raw % WORD_BITS)
    }
}

impl FromIterator<TableNumber> for TableMap {
    fn from_iter<I: IntoIterator<Item = TableNumber>>(iter: I) -> Self {
        let mut map = TableMap::new();
        for table in iter {
            map.insert(table);
        }
        map
    }
}

impl fmt::Debug for TableMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|t| t.0)).finish()
    }
}
