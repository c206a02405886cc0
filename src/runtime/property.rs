//! Property table and operations
//!
//! Objects store properties in a chained hash table whose entry array
//! doubles as the insertion-order record: `for-in` and `Object.keys`
//! walk the entries in the order they were created. Deleted entries
//! become tombstones on a free list and are reused by later inserts.

use crate::value::Value;
use std::rc::Rc;

/// A property slot: plain data or an accessor pair.
#[derive(Debug, Clone)]
pub enum PropSlot {
    Data(Value),
    Accessor {
        getter: Option<Value>,
        setter: Option<Value>,
    },
}

impl PropSlot {
    /// The data value, or `None` for accessors.
    pub fn data(&self) -> Option<Value> {
        match self {
            PropSlot::Data(v) => Some(v.clone()),
            PropSlot::Accessor { .. } => None,
        }
    }
}

/// One entry in the table. `key == None` marks a tombstone.
#[derive(Debug, Clone)]
struct PropEntry {
    key: Option<Rc<str>>,
    slot: PropSlot,
    /// Enumeration visibility: user-created properties are enumerable,
    /// installed builtins are not
    enumerable: bool,
    /// Next entry index + 1 in the hash chain (0 = end of chain), or the
    /// next free slot + 1 when this entry is a tombstone.
    hash_next: u32,
}

/// Insertion-ordered property table.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    entries: Vec<PropEntry>,
    /// Bucket heads (entry index + 1, 0 = empty)
    hash_table: Vec<u32>,
    hash_mask: u32,
    /// Number of live properties
    count: u32,
    /// Head of the tombstone free list (entry index + 1, 0 = none)
    first_free: u32,
}

impl PropertyMap {
    const MIN_HASH_SIZE: usize = 4;
    const MAX_LOAD_FACTOR: f64 = 0.75;

    /// Create a new empty property table.
    pub fn new() -> Self {
        PropertyMap {
            entries: Vec::new(),
            hash_table: vec![0; Self::MIN_HASH_SIZE],
            hash_mask: (Self::MIN_HASH_SIZE - 1) as u32,
            count: 0,
            first_free: 0,
        }
    }

    /// Number of live properties.
    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// FNV-1a over the key bytes.
    #[inline]
    fn hash_key(key: &str) -> u32 {
        let mut h: u32 = 0x811c9dc5;
        for b in key.as_bytes() {
            h ^= *b as u32;
            h = h.wrapping_mul(0x01000193);
        }
        h
    }

    fn find(&self, key: &str) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let hash = Self::hash_key(key);
        let mut idx = self.hash_table[(hash & self.hash_mask) as usize];
        while idx != 0 {
            let entry_idx = (idx - 1) as usize;
            let entry = &self.entries[entry_idx];
            if entry.key.as_deref() == Some(key) {
                return Some(entry_idx);
            }
            idx = entry.hash_next;
        }
        None
    }

    /// Look up a property slot.
    pub fn get(&self, key: &str) -> Option<&PropSlot> {
        self.find(key).map(|i| &self.entries[i].slot)
    }

    /// Look up a mutable property slot.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut PropSlot> {
        self.find(key).map(move |i| &mut self.entries[i].slot)
    }

    /// Check if a property exists.
    pub fn has(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Insert or update a data property. Returns true for a new property.
    pub fn set(&mut self, key: Rc<str>, value: Value) -> bool {
        self.define(key, PropSlot::Data(value))
    }

    /// Insert a non-enumerable data property (installed builtins).
    pub fn set_hidden(&mut self, key: Rc<str>, value: Value) {
        self.define_with(key, PropSlot::Data(value), false);
    }

    /// Insert or replace a property slot. Returns true for a new property.
    pub fn define(&mut self, key: Rc<str>, slot: PropSlot) -> bool {
        self.define_with(key, slot, true)
    }

    fn define_with(&mut self, key: Rc<str>, slot: PropSlot, enumerable: bool) -> bool {
        if let Some(idx) = self.find(&key) {
            self.entries[idx].slot = slot;
            return false;
        }

        let load = (self.count + 1) as f64 / (self.hash_mask + 1) as f64;
        if load > Self::MAX_LOAD_FACTOR {
            self.resize();
        }

        let hash = Self::hash_key(&key);
        let bucket = (hash & self.hash_mask) as usize;
        let entry = PropEntry {
            key: Some(key),
            slot,
            enumerable,
            hash_next: self.hash_table[bucket],
        };

        // Reuse a tombstone if one exists, preserving order for the rest
        let entry_idx = if self.first_free != 0 {
            let idx = (self.first_free - 1) as usize;
            self.first_free = self.entries[idx].hash_next;
            self.entries[idx] = entry;
            idx
        } else {
            self.entries.push(entry);
            self.entries.len() - 1
        };

        self.hash_table[bucket] = (entry_idx + 1) as u32;
        self.count += 1;
        true
    }

    /// Merge an accessor half into an existing slot, or create one.
    pub fn define_accessor(&mut self, key: Rc<str>, getter: Option<Value>, setter: Option<Value>) {
        if let Some(idx) = self.find(&key) {
            if let PropSlot::Accessor {
                getter: ref mut g,
                setter: ref mut s,
            } = self.entries[idx].slot
            {
                if getter.is_some() {
                    *g = getter;
                }
                if setter.is_some() {
                    *s = setter;
                }
                return;
            }
        }
        self.define(key, PropSlot::Accessor { getter, setter });
    }

    /// Delete a property. Returns true if it existed.
    pub fn delete(&mut self, key: &str) -> bool {
        if self.count == 0 {
            return false;
        }
        let hash = Self::hash_key(key);
        let bucket = (hash & self.hash_mask) as usize;

        let mut prev: Option<usize> = None;
        let mut idx = self.hash_table[bucket];
        while idx != 0 {
            let entry_idx = (idx - 1) as usize;
            if self.entries[entry_idx].key.as_deref() == Some(key) {
                let next = self.entries[entry_idx].hash_next;
                match prev {
                    Some(p) => self.entries[p].hash_next = next,
                    None => self.hash_table[bucket] = next,
                }
                self.entries[entry_idx].key = None;
                self.entries[entry_idx].slot = PropSlot::Data(Value::Undefined);
                self.entries[entry_idx].hash_next = self.first_free;
                self.first_free = (entry_idx + 1) as u32;
                self.count -= 1;
                return true;
            }
            prev = Some(entry_idx);
            idx = self.entries[entry_idx].hash_next;
        }
        false
    }

    fn resize(&mut self) {
        let new_size = ((self.hash_mask + 1) * 2) as usize;
        self.hash_mask = (new_size - 1) as u32;
        self.hash_table = vec![0; new_size];

        for i in 0..self.entries.len() {
            let Some(key) = self.entries[i].key.clone() else {
                continue;
            };
            let bucket = (Self::hash_key(&key) & self.hash_mask) as usize;
            self.entries[i].hash_next = self.hash_table[bucket];
            self.hash_table[bucket] = (i + 1) as u32;
        }
    }

    /// Iterate enumerable `(key, slot)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &PropSlot)> {
        self.entries.iter().filter_map(|e| {
            if e.enumerable {
                e.key.as_ref().map(|k| (k, &e.slot))
            } else {
                None
            }
        })
    }

    /// Enumerable own keys in insertion order.
    pub fn keys(&self) -> Vec<Rc<str>> {
        self.iter().map(|(k, _)| Rc::clone(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Rc<str> {
        Rc::from(s)
    }

    #[test]
    fn test_set_get() {
        let mut map = PropertyMap::new();
        assert!(map.set(key("a"), Value::Number(1.0)));
        assert!(!map.set(key("a"), Value::Number(2.0)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a").unwrap().data().unwrap().as_number(), Some(2.0));
        assert!(map.get("b").is_none());
    }

    #[test]
    fn test_insertion_order() {
        let mut map = PropertyMap::new();
        for name in ["z", "a", "m", "0", "k"] {
            map.set(key(name), Value::Undefined);
        }
        let keys: Vec<String> = map.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["z", "a", "m", "0", "k"]);
    }

    #[test]
    fn test_order_survives_resize() {
        let mut map = PropertyMap::new();
        for i in 0..50 {
            map.set(key(&format!("k{}", i)), Value::Number(i as f64));
        }
        let keys = map.keys();
        assert_eq!(keys.len(), 50);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(&**k, format!("k{}", i));
        }
    }

    #[test]
    fn test_delete_and_reuse() {
        let mut map = PropertyMap::new();
        map.set(key("a"), Value::Number(1.0));
        map.set(key("b"), Value::Number(2.0));
        map.set(key("c"), Value::Number(3.0));

        assert!(map.delete("b"));
        assert!(!map.delete("b"));
        assert_eq!(map.len(), 2);
        assert!(!map.has("b"));

        // New insert reuses the tombstone slot
        map.set(key("d"), Value::Number(4.0));
        assert_eq!(map.len(), 3);
        assert!(map.has("a") && map.has("c") && map.has("d"));
    }

    #[test]
    fn test_accessor_merge() {
        let mut map = PropertyMap::new();
        map.define_accessor(key("x"), Some(Value::Number(1.0)), None);
        map.define_accessor(key("x"), None, Some(Value::Number(2.0)));
        match map.get("x").unwrap() {
            PropSlot::Accessor { getter, setter } => {
                assert!(getter.is_some());
                assert!(setter.is_some());
            }
            _ => panic!("expected accessor"),
        }
    }
}
