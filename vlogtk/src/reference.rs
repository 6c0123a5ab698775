//! Reference types for specifying cursor behavior.  A ReferenceTable holds internal entries
//! `(user_key, sequence) -> optional address` in the order the LSM's sorted runs would yield them,
//! and serves as a memtable stand-in when exercising the cursor stack.

use std::sync::Arc;

use keyvalint::{Cursor, KeyRef, KeyValuePair};

use super::Error;

////////////////////////////////////////// ReferenceTable //////////////////////////////////////////

/// An immutable, sorted table of internal entries.
#[derive(Clone, Debug, Default)]
pub struct ReferenceTable {
    entries: Arc<Vec<KeyValuePair>>,
}

impl ReferenceTable {
    /// Return a new cursor over this table.
    pub fn cursor(&self) -> ReferenceCursor {
        ReferenceCursor {
            entries: Arc::clone(&self.entries),
            index: -1,
        }
    }
}

///////////////////////////////////////// ReferenceBuilder /////////////////////////////////////////

/// A builder that accumulates internal entries and seals them into a ReferenceTable.
#[derive(Clone, Debug, Default)]
pub struct ReferenceBuilder {
    entries: Vec<KeyValuePair>,
}

impl ReferenceBuilder {
    /// Record a value entry:  at `timestamp`, `key` pointed at `addr`.
    pub fn put(&mut self, key: &[u8], timestamp: u64, addr: &[u8]) -> &mut Self {
        self.entries.push(KeyValuePair {
            key: key.into(),
            timestamp,
            value: Some(addr.into()),
        });
        self
    }

    /// Record a deletion entry:  at `timestamp`, `key` was deleted.
    pub fn del(&mut self, key: &[u8], timestamp: u64) -> &mut Self {
        self.entries.push(KeyValuePair {
            key: key.into(),
            timestamp,
            value: None,
        });
        self
    }

    /// Seal the builder into a sorted table.
    pub fn seal(self) -> ReferenceTable {
        let mut entries = self.entries;
        entries.sort();
        ReferenceTable {
            entries: Arc::new(entries),
        }
    }
}

////////////////////////////////////////// ReferenceCursor /////////////////////////////////////////

/// A cursor over a reference table.  Positions -1 and len are the sentinels.
#[derive(Clone, Debug)]
pub struct ReferenceCursor {
    entries: Arc<Vec<KeyValuePair>>,
    index: isize,
}

impl Cursor for ReferenceCursor {
    type Error = Error;

    fn seek_to_first(&mut self) -> Result<(), Error> {
        self.index = -1;
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<(), Error> {
        self.index = self.entries.len() as isize;
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<(), Error> {
        // A maximal timestamp sorts before every real entry for the key, so the search lands at
        // the head of the key's group.
        let target = KeyValuePair {
            key: key.into(),
            timestamp: u64::MAX,
            value: None,
        };
        self.index = match self.entries.binary_search(&target) {
            Ok(index) => index,
            Err(index) => index,
        } as isize;
        Ok(())
    }

    fn prev(&mut self) -> Result<(), Error> {
        self.index -= 1;
        if self.index < 0 {
            self.seek_to_first()
        } else {
            Ok(())
        }
    }

    fn next(&mut self) -> Result<(), Error> {
        self.index += 1;
        if self.index as usize >= self.entries.len() {
            self.seek_to_last()
        } else {
            Ok(())
        }
    }

    fn key(&self) -> Option<KeyRef<'_>> {
        if self.index < 0 || self.index as usize >= self.entries.len() {
            None
        } else {
            let kvp = &self.entries[self.index as usize];
            Some(KeyRef::from(kvp))
        }
    }

    fn value(&self) -> Option<&[u8]> {
        if self.index < 0 || self.index as usize >= self.entries.len() {
            None
        } else {
            let kvp = &self.entries[self.index as usize];
            kvp.value.as_deref()
        }
    }
}

impl From<ReferenceTable> for ReferenceCursor {
    fn from(table: ReferenceTable) -> Self {
        table.cursor()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let table = ReferenceBuilder::default().seal();
        let cursor = table.cursor();
        assert!(cursor.key().is_none());
        assert!(cursor.value().is_none());
    }

    #[test]
    fn entries_sort_by_key_then_timestamp_descending() {
        let mut builder = ReferenceBuilder::default();
        builder.put("b".as_bytes(), 1, &[1]);
        builder.put("a".as_bytes(), 1, &[2]);
        builder.put("a".as_bytes(), 9, &[3]);
        let table = builder.seal();
        let mut cursor = table.cursor();
        cursor.seek_to_first().unwrap();
        cursor.next().unwrap();
        let kr = cursor.key().unwrap();
        assert_eq!("a".as_bytes(), kr.key);
        assert_eq!(9, kr.timestamp);
        cursor.next().unwrap();
        let kr = cursor.key().unwrap();
        assert_eq!("a".as_bytes(), kr.key);
        assert_eq!(1, kr.timestamp);
        cursor.next().unwrap();
        let kr = cursor.key().unwrap();
        assert_eq!("b".as_bytes(), kr.key);
    }

    #[test]
    fn seek_lands_at_the_head_of_the_group() {
        let mut builder = ReferenceBuilder::default();
        builder.put("a".as_bytes(), 3, &[1]);
        builder.put("b".as_bytes(), 2, &[2]);
        builder.put("b".as_bytes(), 7, &[3]);
        builder.put("c".as_bytes(), 1, &[4]);
        let table = builder.seal();
        let mut cursor = table.cursor();
        cursor.seek("b".as_bytes()).unwrap();
        let kr = cursor.key().unwrap();
        assert_eq!("b".as_bytes(), kr.key);
        assert_eq!(7, kr.timestamp);
    }

    #[test]
    fn deletions_have_no_value() {
        let mut builder = ReferenceBuilder::default();
        builder.del("a".as_bytes(), 4);
        let table = builder.seal();
        let mut cursor = table.cursor();
        cursor.seek("a".as_bytes()).unwrap();
        assert!(cursor.key().is_some());
        assert!(cursor.value().is_none());
    }
}
