//! Ordered Key Index
//!
//! Sorted `key -> account id` array with case-insensitive ordering. Lookups
//! and insertion-point searches are binary searches; inserts shift the tail.
//!
//! Text form, one pair per two lines:
//!
//! ```text
//! <key>
//! <account id>
//! ```

use std::cmp::Ordering;

use crate::storage::accounts::AccountId;

/// Index errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Key already present (case-insensitively).
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// Key is empty or contains a line break.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// Text form has a key without an id line.
    #[error("dangling key on line {0}")]
    Dangling(usize),

    /// Id line is not a valid account id.
    #[error("invalid account id on line {0}")]
    InvalidId(usize),
}

/// Case-insensitive ordering used by every index.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

/// One index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Key as originally inserted.
    pub key: String,
    /// Account the key belongs to.
    pub id: AccountId,
}

/// Sorted, duplicate-free key index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortedIndex {
    entries: Vec<IndexEntry>,
}

impl SortedIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending key order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// `Ok(position)` of `key`, or `Err(insertion point)`.
    pub fn search(&self, key: &str) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| compare_keys(&entry.key, key))
    }

    /// Account id for `key`.
    pub fn get(&self, key: &str) -> Option<AccountId> {
        self.search(key).ok().map(|i| self.entries[i].id)
    }

    /// True when `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.search(key).is_ok()
    }

    /// Insert `key`, keeping order. Returns the position used.
    pub fn insert(&mut self, key: &str, id: AccountId) -> Result<usize, IndexError> {
        if key.is_empty() || key.contains(['\n', '\r']) {
            return Err(IndexError::InvalidKey(key.to_owned()));
        }

        match self.search(key) {
            Ok(_) => Err(IndexError::Duplicate(key.to_owned())),
            Err(at) => {
                self.entries.insert(
                    at,
                    IndexEntry {
                        key: key.to_owned(),
                        id,
                    },
                );
                Ok(at)
            }
        }
    }

    /// Remove `key`, returning its id.
    pub fn remove(&mut self, key: &str) -> Option<AccountId> {
        let at = self.search(key).ok()?;
        Some(self.entries.remove(at).id)
    }

    /// Serialize to the two-lines-per-entry text form.
    pub fn to_lines(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.key);
            out.push('\n');
            out.push_str(&entry.id.to_string());
            out.push('\n');
        }
        out
    }

    /// Parse the text form. Out-of-order input is re-sorted.
    pub fn from_lines(text: &str) -> Result<Self, IndexError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.is_empty());
        let mut index = Self::new();

        while let Some((key_line, key)) = lines.next() {
            let (id_line, raw_id) = lines.next().ok_or(IndexError::Dangling(key_line + 1))?;
            let id = raw_id
                .trim()
                .parse()
                .map_err(|_| IndexError::InvalidId(id_line + 1))?;
            index.insert(key, id)?;
        }

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_is_case_insensitive() {
        assert_eq!(compare_keys("Alice", "aLICE"), Ordering::Equal);
        assert_eq!(compare_keys("alice", "Bob"), Ordering::Less);
        assert_eq!(compare_keys("Zed", "adam"), Ordering::Greater);
        assert_eq!(compare_keys("ab", "abc"), Ordering::Less);
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut index = SortedIndex::new();
        for key in ["mike", "Alpha", "zulu", "charlie", "Bravo"] {
            index.insert(key, AccountId::generate()).unwrap();
        }

        let keys: Vec<_> = index.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["Alpha", "Bravo", "charlie", "mike", "zulu"]);
    }

    #[test]
    fn test_insertion_point() {
        let mut index = SortedIndex::new();
        index.insert("b", AccountId::generate()).unwrap();
        index.insert("d", AccountId::generate()).unwrap();

        assert_eq!(index.search("a"), Err(0));
        assert_eq!(index.search("C"), Err(1));
        assert_eq!(index.search("e"), Err(2));
        assert_eq!(index.search("D"), Ok(1));
    }

    #[test]
    fn test_lookup_and_duplicates() {
        let mut index = SortedIndex::new();
        let id = AccountId::generate();
        index.insert("a@b.com", id).unwrap();

        assert_eq!(index.get("A@B.COM"), Some(id));
        assert_eq!(index.get("x@y.com"), None);
        assert_eq!(
            index.insert("A@b.com", AccountId::generate()),
            Err(IndexError::Duplicate("A@b.com".into()))
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_invalid_keys() {
        let mut index = SortedIndex::new();
        assert!(index.insert("", AccountId::generate()).is_err());
        assert!(index.insert("a\nb", AccountId::generate()).is_err());
    }

    #[test]
    fn test_text_roundtrip() {
        let mut index = SortedIndex::new();
        index.insert("alice", AccountId::generate()).unwrap();
        index.insert("Bob", AccountId::generate()).unwrap();

        let text = index.to_lines();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(SortedIndex::from_lines(&text).unwrap(), index);
    }

    #[test]
    fn test_from_lines_errors() {
        assert_eq!(SortedIndex::from_lines("alice\n"), Err(IndexError::Dangling(1)));
        assert_eq!(
            SortedIndex::from_lines("alice\nnot-a-uuid\n"),
            Err(IndexError::InvalidId(2))
        );
        assert!(SortedIndex::from_lines("").unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let mut index = SortedIndex::new();
        let id = AccountId::generate();
        index.insert("alice", id).unwrap();
        assert_eq!(index.remove("ALICE"), Some(id));
        assert!(index.is_empty());
        assert_eq!(index.remove("alice"), None);
    }
}
