// Mylox open-addressed hash table
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
// Changelog:
// 2026-03-05: Replaced the std HashMap globals/string-pool of the Lua backend with
//            an open-addressed, linear-probing table keyed by interned string
//            identity. Deletion leaves a tombstone (null key, value `true`) so a
//            probe chain is never broken; rehash drops tombstones and recounts.
// 2026-03-07: Added find_string, the content-equality probe used only by the
//            interner before a canonical string object exists for the bytes.
// 2026-03-10: Added remove_white so the interner's table can act as a weak set
//            during collection.

use crate::common::object::{GCObject, StrData};
use crate::common::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
pub struct Entry {
    /// Interned string, compared by pointer. Null for empty slots and tombstones.
    pub key: *mut GCObject<StrData>,
    pub value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: std::ptr::null_mut(),
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !matches!(self.value, Value::Nil)
    }
}

/// Linear-probing table keyed by interned strings. `count` includes tombstones
/// (they still lengthen probe chains); rehashing drops them and recounts.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Live entries, for the GC root walk.
    pub fn iter(&self) -> impl Iterator<Item = (*mut GCObject<StrData>, &Value)> {
        self.entries
            .iter()
            .filter(|e| !e.key.is_null())
            .map(|e| (e.key, &e.value))
    }

    /// Probe for `key`. Returns the matching slot, or the slot an insertion
    /// should use: the earliest tombstone on the chain if there was one,
    /// otherwise the terminating empty slot.
    fn find_entry(entries: &[Entry], key: *mut GCObject<StrData>) -> usize {
        let cap = entries.len();
        let hash = unsafe { (*key).data.hash };
        let mut index = hash as usize % cap;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if entry.is_tombstone() {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                } else {
                    return tombstone.unwrap_or(index);
                }
            } else if std::ptr::eq(entry.key, key) {
                return index;
            }
            index = (index + 1) % cap;
        }
    }

    fn adjust_capacity(&mut self, cap: usize) {
        let mut entries = vec![Entry::empty(); cap];

        // 重哈希会丢弃所有墓碑，count 重新计数
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_null() {
                continue;
            }
            let dest = Self::find_entry(&entries, entry.key);
            entries[dest] = *entry;
            self.count += 1;
        }

        self.entries = entries;
    }

    fn grown_capacity(&self) -> usize {
        if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        }
    }

    pub fn get(&self, key: *mut GCObject<StrData>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Inserts or overwrites. Returns true when `key` was not present before
    /// (a reused tombstone still counts as a new key).
    pub fn set(&mut self, key: *mut GCObject<StrData>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let cap = self.grown_capacity();
            self.adjust_capacity(cap);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }

        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: *mut GCObject<StrData>) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }

        // tombstone keeps the probe chain intact
        entry.key = std::ptr::null_mut();
        entry.value = Value::Boolean(true);
        true
    }

    /// Content-equality probe: length, hash, then bytes. Used only while
    /// interning, before the canonical object for these bytes exists.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<*mut GCObject<StrData>> {
        if self.count == 0 {
            return None;
        }

        let cap = self.entries.len();
        let mut index = hash as usize % cap;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else {
                let key = unsafe { &(*entry.key).data };
                if key.chars.len() == chars.len() && key.hash == hash && key.chars == chars {
                    return Some(entry.key);
                }
            }
            index = (index + 1) % cap;
        }
    }

    /// Drops every entry whose key has not been marked this GC cycle. Run
    /// between trace and sweep so the intern set holds its keys weakly.
    pub fn remove_white(&mut self) {
        for i in 0..self.entries.len() {
            let key = self.entries[i].key;
            if !key.is_null() && !unsafe { (*key).mark } {
                self.entries[i].key = std::ptr::null_mut();
                self.entries[i].value = Value::Boolean(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Table;
    use crate::common::object::{GCObject, ObjectKind, StrData, hash_bytes};
    use crate::common::value::Value;

    // Standalone string objects; tests leak them, which is fine for the
    // handful created here.
    fn make_string(s: &str) -> *mut GCObject<StrData> {
        Box::into_raw(Box::new(GCObject {
            mark: false,
            kind: ObjectKind::String,
            size: 0,
            next: std::ptr::null_mut(),
            data: StrData {
                chars: s.to_string(),
                hash: hash_bytes(s.as_bytes()),
            },
        }))
    }

    #[test]
    fn set_get_overwrite() {
        let mut table = Table::new();
        let key = make_string("answer");

        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(42.0)));
        match table.get(key) {
            Some(Value::Number(n)) => assert_eq!(n, 42.0),
            other => panic!("unexpected lookup result: {:?}", other),
        }
    }

    #[test]
    fn delete_leaves_probe_chain_usable() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..32).map(|i| make_string(&format!("k{}", i))).collect();
        for (i, &k) in keys.iter().enumerate() {
            table.set(k, Value::Number(i as f64));
        }

        assert!(table.delete(keys[7]));
        assert!(!table.delete(keys[7]));
        assert!(table.get(keys[7]).is_none());

        // every other key still reachable through any tombstoned chain
        for (i, &k) in keys.iter().enumerate() {
            if i == 7 {
                continue;
            }
            match table.get(k) {
                Some(Value::Number(n)) => assert_eq!(n, i as f64),
                other => panic!("key {} lost after delete: {:?}", i, other),
            }
        }
    }

    #[test]
    fn tombstone_slot_is_reused_for_insertion() {
        let mut table = Table::new();
        let a = make_string("a");
        table.set(a, Value::Number(1.0));
        table.delete(a);

        let count_before = table.len();
        table.set(a, Value::Number(2.0));
        // tombstone reuse must not inflate the count
        assert_eq!(table.len(), count_before);
    }

    #[test]
    fn rehash_drops_tombstones_and_recounts() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..6).map(|i| make_string(&format!("t{}", i))).collect();
        for &k in &keys {
            table.set(k, Value::Nil);
        }
        for &k in &keys[..3] {
            table.delete(k);
        }

        // force a grow; afterwards count equals the number of live keys
        let extra: Vec<_> = (0..16).map(|i| make_string(&format!("x{}", i))).collect();
        for &k in &extra {
            table.set(k, Value::Nil);
        }
        let live = table.iter().count();
        assert_eq!(table.len(), live);
    }

    #[test]
    fn find_string_matches_content_not_identity() {
        let mut table = Table::new();
        let interned = make_string("hello");
        table.set(interned, Value::Nil);

        let hash = hash_bytes(b"hello");
        assert_eq!(table.find_string("hello", hash), Some(interned));
        assert_eq!(table.find_string("hellx", hash_bytes(b"hellx")), None);
    }
}
