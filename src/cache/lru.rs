//! Recency-ordered L1 store bounded by entry count and total bytes.

use std::collections::{BTreeMap, HashMap};

use super::entry::CacheEntry;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Debug)]
pub struct LruStore {
    slots: HashMap<String, Slot>,
    /// Recency index: lowest tick is least recently used.
    order: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl LruStore {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    /// Mutable access that also marks the key most recently used.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        let tick = self.bump();
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.to_string());
        Some(&mut slot.entry)
    }

    /// Insert (or replace) an entry and return whatever had to be evicted to fit it.
    /// The inserted entry itself is never evicted by its own insertion.
    pub fn insert(&mut self, key: String, entry: CacheEntry) -> Vec<(String, CacheEntry)> {
        self.remove(&key);
        let tick = self.bump();
        self.bytes += entry.size;
        self.order.insert(tick, key.clone());
        self.slots.insert(key.clone(), Slot { entry, tick });

        let mut evicted = Vec::new();
        while self.slots.len() > 1
            && (self.slots.len() > self.max_entries || self.bytes > self.max_bytes)
        {
            let Some((&oldest, _)) = self.order.iter().next() else {
                break;
            };
            let Some(victim) = self.order.remove(&oldest) else {
                break;
            };
            if let Some(slot) = self.slots.remove(&victim) {
                self.bytes -= slot.entry.size;
                evicted.push((victim, slot.entry));
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes -= slot.entry.size;
        Some(slot.entry)
    }

    /// Remove every entry matching `pred`, returning the removed keys.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&CacheEntry) -> bool) -> Vec<String> {
        let keys: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| pred(&slot.entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}
