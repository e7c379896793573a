//! On-disk node layout: a 28-byte self-describing header, a sorted array
//! of `u64` keys, and a parallel array of fixed-width values.
//!
//! Unlike the teacher's `int_page`/`crab-dads` page formats (bit-packed,
//! variable-length integers sharing one interleaved region) this store's
//! keys and values are always fixed width, so the two arrays are kept
//! separate rather than interleaved — simpler to reason about, and exactly
//! what spec.md section 6 describes for this B-tree's block layout.

use byteorder::{ByteOrder, LittleEndian as LE};

pub const MAGIC: u32 = 160_774;
pub const FLAG_LEAF: u32 = 1;
pub const FLAG_INTERNAL: u32 = 2;

/// `flags, nr_entries, max_entries, magic, blocknr, csum`: the fields
/// spec.md section 6 lists for a B-tree node header, in that order.
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 4;

/// Offset of the `blocknr` field, for [`block_cache::StandardValidator`].
pub const BLOCKNR_OFFSET: usize = 16;
/// Offset of the `csum` field, for [`block_cache::StandardValidator`].
pub const CSUM_OFFSET: usize = 24;

#[derive(Clone, Copy, Debug)]
pub struct NodeHeader {
    pub flags: u32,
    pub nr_entries: u32,
    pub max_entries: u32,
    pub magic: u32,
    pub blocknr: u64,
    pub csum: u32,
}

impl NodeHeader {
    fn read(buf: &[u8]) -> Self {
        Self {
            flags: LE::read_u32(&buf[0..4]),
            nr_entries: LE::read_u32(&buf[4..8]),
            max_entries: LE::read_u32(&buf[8..12]),
            magic: LE::read_u32(&buf[12..16]),
            blocknr: LE::read_u64(&buf[16..24]),
            csum: LE::read_u32(&buf[24..28]),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        LE::write_u32(&mut buf[0..4], self.flags);
        LE::write_u32(&mut buf[4..8], self.nr_entries);
        LE::write_u32(&mut buf[8..12], self.max_entries);
        LE::write_u32(&mut buf[12..16], self.magic);
        LE::write_u64(&mut buf[16..24], self.blocknr);
        LE::write_u32(&mut buf[24..28], self.csum);
    }
}

/// `(block_size - header) / (8 + value_size)`: the key/value capacity of a
/// node holding values of `value_size` bytes, per spec.md section 6.
pub fn max_entries_for(block_size: usize, value_size: usize) -> usize {
    (block_size - HEADER_SIZE) / (8 + value_size)
}

/// A typed view over a node's raw bytes. Does not own the bytes: built
/// fresh over a `WriteHandle`/`ReadHandle` deref for each access.
pub struct NodeView<'a> {
    data: &'a mut [u8],
    value_size: usize,
    max_entries: usize,
}

impl<'a> NodeView<'a> {
    pub fn attach(data: &'a mut [u8], value_size: usize) -> Self {
        let max_entries = max_entries_for(data.len(), value_size);
        Self { data, value_size, max_entries }
    }

    pub fn init(&mut self, leaf: bool) {
        let h = NodeHeader {
            flags: if leaf { FLAG_LEAF } else { FLAG_INTERNAL },
            nr_entries: 0,
            max_entries: self.max_entries as u32,
            magic: MAGIC,
            blocknr: 0,
            csum: 0,
        };
        h.write(self.data);
    }

    fn header(&self) -> NodeHeader {
        NodeHeader::read(self.data)
    }

    fn set_nr_entries(&mut self, n: usize) {
        LE::write_u32(&mut self.data[4..8], n as u32);
    }

    pub fn is_leaf(&self) -> bool {
        self.header().flags == FLAG_LEAF
    }

    pub fn nr_entries(&self) -> usize {
        self.header().nr_entries as usize
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn is_full(&self) -> bool {
        self.nr_entries() >= self.max_entries
    }

    pub fn is_underfull(&self) -> bool {
        // spec.md section 6: merge/redistribute threshold nr_entries < max_entries/3.
        self.nr_entries() < self.max_entries / 3
    }

    fn keys_offset(&self) -> usize {
        HEADER_SIZE
    }

    fn values_offset(&self) -> usize {
        HEADER_SIZE + 8 * self.max_entries
    }

    pub fn key(&self, i: usize) -> u64 {
        let off = self.keys_offset() + 8 * i;
        LE::read_u64(&self.data[off..off + 8])
    }

    fn set_key(&mut self, i: usize, key: u64) {
        let off = self.keys_offset() + 8 * i;
        LE::write_u64(&mut self.data[off..off + 8], key);
    }

    pub fn value(&self, i: usize) -> &[u8] {
        let off = self.values_offset() + self.value_size * i;
        &self.data[off..off + self.value_size]
    }

    fn set_value(&mut self, i: usize, value: &[u8]) {
        debug_assert_eq!(value.len(), self.value_size);
        let off = self.values_offset() + self.value_size * i;
        self.data[off..off + self.value_size].copy_from_slice(value);
    }

    pub fn first_key(&self) -> Option<u64> {
        if self.nr_entries() == 0 {
            None
        } else {
            Some(self.key(0))
        }
    }

    /// Binary search over `[0, nr_entries)`. `Ok(i)` on exact match,
    /// `Err(i)` for the index the key would be inserted at.
    pub fn search(&self, key: u64) -> Result<usize, usize> {
        let n = self.nr_entries();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(&key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    /// Index of the child that could hold `key` in an internal node: the
    /// last entry whose key is `<= key`, or 0 if `key` precedes everything.
    pub fn child_index(&self, key: u64) -> usize {
        match self.search(key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    fn shift_right(&mut self, from: usize, by: usize) {
        let n = self.nr_entries();
        for i in (from..n).rev() {
            let k = self.key(i);
            self.set_key(i + by, k);
            let v: Vec<u8> = self.value(i).to_vec();
            self.set_value(i + by, &v);
        }
    }

    fn shift_left(&mut self, from: usize, by: usize) {
        let n = self.nr_entries();
        for i in from..n {
            let k = self.key(i);
            self.set_key(i - by, k);
            let v: Vec<u8> = self.value(i).to_vec();
            self.set_value(i - by, &v);
        }
    }

    pub fn insert_at(&mut self, idx: usize, key: u64, value: &[u8]) {
        debug_assert!(!self.is_full());
        let n = self.nr_entries();
        if idx < n {
            self.shift_right(idx, 1);
        }
        self.set_key(idx, key);
        self.set_value(idx, value);
        self.set_nr_entries(n + 1);
    }

    pub fn remove_at(&mut self, idx: usize) -> (u64, Vec<u8>) {
        let n = self.nr_entries();
        debug_assert!(idx < n);
        let key = self.key(idx);
        let value = self.value(idx).to_vec();
        if idx + 1 < n {
            self.shift_left(idx + 1, 1);
        }
        self.set_nr_entries(n - 1);
        (key, value)
    }

    pub fn set_value_at(&mut self, idx: usize, value: &[u8]) {
        self.set_value(idx, value);
    }

    /// Move entries `[from, nr_entries)` into `other` (which must be
    /// empty), truncating `self` to `from` entries. Used for splits.
    pub fn move_tail_to(&mut self, from: usize, other: &mut NodeView<'_>) {
        debug_assert_eq!(other.nr_entries(), 0);
        let n = self.nr_entries();
        for i in from..n {
            let k = self.key(i);
            let v: Vec<u8> = self.value(i).to_vec();
            other.insert_at(i - from, k, &v);
        }
        self.set_nr_entries(from);
    }

    /// Append all of `other`'s entries onto the end of `self`. Used for
    /// merges; caller must ensure capacity.
    pub fn merge_from(&mut self, other: &NodeView<'_>) {
        let base = self.nr_entries();
        debug_assert!(base + other.nr_entries() <= self.max_entries);
        for i in 0..other.nr_entries() {
            let k = other.key(i);
            let v = other.value(i).to_vec();
            self.insert_at(base + i, k, &v);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        (0..self.nr_entries()).map(move |i| (self.key(i), self.value(i)))
    }
}

/// Read-only counterpart of [`NodeView`], for descents that never shadow
/// (plain lookups via a `ReadHandle`, which only derefs to `&[u8]`).
pub struct NodeRoView<'a> {
    data: &'a [u8],
    value_size: usize,
    max_entries: usize,
}

impl<'a> NodeRoView<'a> {
    pub fn attach(data: &'a [u8], value_size: usize) -> Self {
        let max_entries = max_entries_for(data.len(), value_size);
        Self { data, value_size, max_entries }
    }

    fn header(&self) -> NodeHeader {
        NodeHeader::read(self.data)
    }

    pub fn is_leaf(&self) -> bool {
        self.header().flags == FLAG_LEAF
    }

    pub fn nr_entries(&self) -> usize {
        self.header().nr_entries as usize
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn keys_offset(&self) -> usize {
        HEADER_SIZE
    }

    fn values_offset(&self) -> usize {
        HEADER_SIZE + 8 * self.max_entries
    }

    pub fn key(&self, i: usize) -> u64 {
        let off = self.keys_offset() + 8 * i;
        LE::read_u64(&self.data[off..off + 8])
    }

    pub fn value(&self, i: usize) -> &[u8] {
        let off = self.values_offset() + self.value_size * i;
        &self.data[off..off + self.value_size]
    }

    pub fn first_key(&self) -> Option<u64> {
        if self.nr_entries() == 0 {
            None
        } else {
            Some(self.key(0))
        }
    }

    pub fn search(&self, key: u64) -> Result<usize, usize> {
        let n = self.nr_entries();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(&key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    pub fn child_index(&self, key: u64) -> usize {
        match self.search(key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }
}
