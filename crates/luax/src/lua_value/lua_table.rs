// Hybrid array/hash table.
// - Array part for integer keys [1..n]
// - Hash part: insertion-ordered node vector plus a key index, so `next`
//   is O(1) and iteration order is stable for a table instance between
//   mutations
// - Metatable slot

use super::LuaValue;
use ahash::AHashMap;

/// Rejected table keys. Assignment through the VM maps these onto an
/// IndexError ("table index is nil" / "table index is NaN").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKeyError {
    Nil,
    NaN,
}

struct HashNode {
    key: LuaValue,
    value: LuaValue,
}

impl HashNode {
    #[inline]
    fn is_dead(&self) -> bool {
        self.key.is_nil()
    }
}

pub struct LuaTable {
    /// Array part: values for integer keys 1..=array.len()
    array: Vec<LuaValue>,
    /// Hash part nodes in insertion order; removed entries leave dead
    /// slots until compaction
    entries: Vec<HashNode>,
    /// Live-key index into `entries`
    index: AHashMap<LuaValue, usize>,
    dead: usize,
    metatable: LuaValue,
}

/// Decode a "floating point byte" size hint (eeeeexxx) from NEWTABLE
pub fn fb2int(x: u32) -> usize {
    if x < 8 {
        x as usize
    } else {
        (((x & 7) + 8) as usize) << ((x >> 3) - 1)
    }
}

impl LuaTable {
    /// Compact the node vector once more than half of it is dead
    const COMPACT_MIN_DEAD: usize = 8;

    pub fn new() -> Self {
        LuaTable {
            array: Vec::new(),
            entries: Vec::new(),
            index: AHashMap::new(),
            dead: 0,
            metatable: LuaValue::Nil,
        }
    }

    pub fn with_capacity(narr: usize, nhash: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(narr),
            entries: Vec::with_capacity(nhash),
            index: AHashMap::with_capacity(nhash),
            dead: 0,
            metatable: LuaValue::Nil,
        }
    }

    #[inline]
    pub fn get_metatable(&self) -> LuaValue {
        self.metatable.clone()
    }

    #[inline]
    pub fn set_metatable(&mut self, mt: LuaValue) {
        self.metatable = mt;
    }

    /// Fast path for positive integer keys
    #[inline]
    pub fn get_int(&self, key: i64) -> LuaValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            return self.array[key as usize - 1].clone();
        }
        self.hash_get(&LuaValue::Number(key as f64))
    }

    /// Raw read; returns Nil for an absent key
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if let Some(i) = key.as_array_index() {
            if (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
            // Normalize float keys with integral value for the hash part
            return self.hash_get(&LuaValue::Number(i as f64));
        }
        self.hash_get(key)
    }

    #[inline]
    fn hash_get(&self, key: &LuaValue) -> LuaValue {
        match self.index.get(key) {
            Some(&slot) => self.entries[slot].value.clone(),
            None => LuaValue::Nil,
        }
    }

    /// Raw write. Assigning Nil removes the key; Nil and NaN keys are
    /// rejected.
    pub fn set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), TableKeyError> {
        match &key {
            LuaValue::Nil => return Err(TableKeyError::Nil),
            LuaValue::Number(n) if n.is_nan() => return Err(TableKeyError::NaN),
            _ => {}
        }
        if let Some(i) = key.as_array_index() {
            self.set_int(i, value);
            return Ok(());
        }
        self.hash_set(key, value);
        Ok(())
    }

    pub fn set_int(&mut self, key: i64, value: LuaValue) {
        let len = self.array.len();
        if key >= 1 && (key as usize) <= len {
            self.array[key as usize - 1] = value;
            return;
        }
        if key as usize == len + 1 && key >= 1 {
            if value.is_nil() {
                // Appending nil just removes whatever the hash had there
                self.hash_set(LuaValue::Number(key as f64), LuaValue::Nil);
                return;
            }
            self.array.push(value);
            self.absorb_from_hash();
            return;
        }
        self.hash_set(LuaValue::Number(key as f64), value);
    }

    /// Array append helper (`t[#t+1] = v`)
    pub fn push(&mut self, value: LuaValue) {
        let n = self.length();
        self.set_int(n as i64 + 1, value);
    }

    /// After the array part grows, pull any now-contiguous integer keys
    /// out of the hash part.
    fn absorb_from_hash(&mut self) {
        loop {
            let next_key = LuaValue::Number((self.array.len() + 1) as f64);
            match self.index.get(&next_key) {
                Some(&slot) => {
                    let value = std::mem::take(&mut self.entries[slot].value);
                    self.remove_slot(&next_key, slot);
                    self.array.push(value);
                }
                None => break,
            }
        }
    }

    fn hash_set(&mut self, key: LuaValue, value: LuaValue) {
        if value.is_nil() {
            if let Some(slot) = self.index.get(&key).copied() {
                self.remove_slot(&key, slot);
                self.maybe_compact();
            }
            return;
        }
        match self.index.get(&key) {
            Some(&slot) => self.entries[slot].value = value,
            None => {
                let slot = self.entries.len();
                self.entries.push(HashNode {
                    key: key.clone(),
                    value,
                });
                self.index.insert(key, slot);
            }
        }
    }

    fn remove_slot(&mut self, key: &LuaValue, slot: usize) {
        self.index.remove(key);
        self.entries[slot] = HashNode {
            key: LuaValue::Nil,
            value: LuaValue::Nil,
        };
        self.dead += 1;
    }

    fn maybe_compact(&mut self) {
        if self.dead <= Self::COMPACT_MIN_DEAD || self.dead * 2 <= self.entries.len() {
            return;
        }
        let old = std::mem::take(&mut self.entries);
        self.index.clear();
        for node in old {
            if !node.is_dead() {
                let slot = self.entries.len();
                self.index.insert(node.key.clone(), slot);
                self.entries.push(node);
            }
        }
        self.dead = 0;
    }

    /// A border n: t[n] ~= nil and t[n+1] == nil, preferring the run
    /// that ends at the last non-nil array element.
    pub fn length(&self) -> usize {
        let mut n = self.array.len();
        while n > 0 && self.array[n - 1].is_nil() {
            n -= 1;
        }
        if n == self.array.len() {
            // Array part is full up to its end; the border may continue
            // into the hash part
            while !self.hash_get(&LuaValue::Number((n + 1) as f64)).is_nil() {
                n += 1;
            }
        }
        n
    }

    /// Iteration: `next(nil)` yields the first pair, `next(k)` the pair
    /// after k. Array part first (in index order), then hash nodes in
    /// insertion order. Returns None when iteration is finished or the
    /// key is not present.
    pub fn next(&self, key: &LuaValue) -> Option<(LuaValue, LuaValue)> {
        let start = match key {
            LuaValue::Nil => 0,
            _ => {
                if let Some(i) = key.as_array_index() {
                    if (i as usize) <= self.array.len() {
                        i as usize
                    } else {
                        return self.hash_next_after(&LuaValue::Number(i as f64));
                    }
                } else {
                    return self.hash_next_after(key);
                }
            }
        };
        for (idx, v) in self.array.iter().enumerate().skip(start) {
            if !v.is_nil() {
                return Some((LuaValue::Number((idx + 1) as f64), v.clone()));
            }
        }
        self.hash_next_from(0)
    }

    fn hash_next_after(&self, key: &LuaValue) -> Option<(LuaValue, LuaValue)> {
        let slot = *self.index.get(key)?;
        self.hash_next_from(slot + 1)
    }

    fn hash_next_from(&self, from: usize) -> Option<(LuaValue, LuaValue)> {
        self.entries[from.min(self.entries.len())..]
            .iter()
            .find(|n| !n.is_dead())
            .map(|n| (n.key.clone(), n.value.clone()))
    }

    /// Total number of live entries (array + hash); debugger display only
    pub fn count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.entries.len() - self.dead
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new()
    }
}
