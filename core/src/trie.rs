// core/src/trie.rs
//
// Byte-keyed double-array trie. Transitions are encoded in two parallel
// signed arrays: `next = base[n] + c` is a child of `n` iff `base[n] > 0`,
// `next != n`, `next < capacity`, and `check[next] == n`. A key terminates
// through a transition by byte 0 into a terminal slot whose `base` holds
// `-(id + 1)`; the sign discriminates terminal from internal slots.
//
// The trainer mutates a `DoubleArrayTrie`; the frozen model keeps only the
// two arrays and reads them through `TrieView`.

use crate::error::{Error, Result};

/// Root node index. Slot 0 stays free so `check == 0` can mean "empty".
pub const ROOT: usize = 1;

/// Hard ceiling on the addressable array size.
const MAX_CAPACITY: usize = 1 << 26;

const INITIAL_CAPACITY: usize = 1024;

/// Decoded content of one double-array slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieSlot {
    Free,
    Internal { base: i32 },
    Terminal { id: u32 },
}

/// Mutable double-array trie used during training.
#[derive(Debug, Clone)]
pub struct DoubleArrayTrie {
    base: Vec<i32>,
    check: Vec<i32>,
}

impl Default for DoubleArrayTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleArrayTrie {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(ROOT + 2).min(MAX_CAPACITY);
        let mut trie = Self {
            base: vec![0; capacity],
            check: vec![0; capacity],
        };
        trie.check[ROOT] = ROOT as i32;
        trie
    }

    pub fn capacity(&self) -> usize {
        self.base.len()
    }

    /// Highest occupied slot index plus one; the arrays beyond it are free.
    pub fn used_capacity(&self) -> usize {
        let mut end = self.check.len();
        while end > ROOT + 1 && self.check[end - 1] == 0 {
            end -= 1;
        }
        end
    }

    /// Borrow the raw arrays, e.g. for model export.
    pub fn as_arrays(&self) -> (&[i32], &[i32]) {
        (&self.base, &self.check)
    }

    /// Read-only view over this trie's arrays.
    pub fn view(&self) -> TrieView<'_> {
        TrieView {
            base: &self.base,
            check: &self.check,
        }
    }

    /// Insert `key` as a set member; idempotent, preserves an existing value.
    pub fn add_bytes(&mut self, key: &[u8]) -> Result<()> {
        if self.view().contains_bytes(key) {
            return Ok(());
        }
        self.insert(key, 0)
    }

    /// Insert `key` with terminal value `id`, overwriting any previous value.
    pub fn insert(&mut self, key: &[u8], id: u32) -> Result<()> {
        if key.is_empty() {
            return Err(Error::BadArg("empty trie key"));
        }
        if key.contains(&0) {
            return Err(Error::BadArg("trie key contains NUL"));
        }
        if id >= i32::MAX as u32 {
            return Err(Error::Full("trie terminal id range"));
        }
        let mut node = ROOT;
        for &c in key {
            node = self.ensure_transition(node, c)?;
        }
        let term = self.ensure_transition(node, 0)?;
        self.base[term] = -((id as i64 + 1) as i32);
        Ok(())
    }

    /// Decode one slot.
    pub fn slot(&self, idx: usize) -> TrieSlot {
        self.view().slot(idx)
    }

    pub fn contains_bytes(&self, key: &[u8]) -> bool {
        self.view().contains_bytes(key)
    }

    pub fn get_value(&self, key: &[u8]) -> Option<u32> {
        self.view().get_value(key)
    }

    pub fn search_prefix_bytes(&self, key: &[u8]) -> usize {
        self.view().search_prefix_bytes(key)
    }

    // ---- insertion internals ----

    /// Make sure the transition `node -c->` exists, creating or relocating as
    /// needed. Returns the child index.
    fn ensure_transition(&mut self, node: usize, c: u8) -> Result<usize> {
        if self.base[node] <= 0 {
            // first child: claim a base for this node
            let b = self.find_base(&[c], node)?;
            self.base[node] = b as i32;
            let idx = b + c as usize;
            self.occupy(idx, node);
            return Ok(idx);
        }

        let idx = self.base[node] as usize + c as usize;
        if idx >= self.capacity() {
            self.grow_to(idx + 1)?;
        }
        if self.check[idx] == node as i32 {
            return Ok(idx);
        }
        if self.check[idx] == 0 && idx != node {
            self.occupy(idx, node);
            return Ok(idx);
        }

        // collision: move every existing child of `node` to a base where the
        // whole sibling set, plus `c`, fits
        let mut children = self.child_bytes(node);
        children.push(c);
        let new_base = self.find_base(&children, node)?;
        self.relocate(node, new_base, &children[..children.len() - 1]);
        let idx = new_base + c as usize;
        self.occupy(idx, node);
        Ok(idx)
    }

    fn occupy(&mut self, idx: usize, parent: usize) {
        self.check[idx] = parent as i32;
        self.base[idx] = 0;
    }

    /// Bytes of all existing children of `node`, ascending.
    fn child_bytes(&self, node: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let b = self.base[node];
        if b <= 0 {
            return out;
        }
        for c in 0..=255u16 {
            let idx = b as usize + c as usize;
            if idx != node && idx < self.capacity() && self.check[idx] == node as i32 {
                out.push(c as u8);
            }
        }
        out
    }

    /// Find the smallest base >= 1 where every slot `base + c` is free, not
    /// equal to `avoid`, and inside (a possibly grown) capacity.
    fn find_base(&mut self, children: &[u8], avoid: usize) -> Result<usize> {
        let max_c = *children.iter().max().unwrap_or(&0) as usize;
        let mut b = 1usize;
        loop {
            if b + max_c >= self.capacity() {
                self.grow_to(b + max_c + 1)?;
            }
            let fits = children.iter().all(|&c| {
                let idx = b + c as usize;
                idx != avoid && self.check[idx] == 0
            });
            if fits {
                return Ok(b);
            }
            b += 1;
            if b + max_c >= MAX_CAPACITY {
                return Err(Error::Full("trie base address space"));
            }
        }
    }

    /// Move the existing children of `node` from `base[node]` to `new_base`.
    ///
    /// Grandchild `check` entries are repointed with a two-pass sentinel
    /// scheme: pass one rewrites `check == old_child` to `-new_child`, pass
    /// two flips the sign back. An in-flight mapping can therefore never
    /// chain-update a grandchild that already moved, even when the source
    /// and destination slot ranges overlap.
    fn relocate(&mut self, node: usize, new_base: usize, children: &[u8]) {
        let old_base = self.base[node] as usize;
        let cap = self.capacity();

        for &c in children {
            let old = old_base + c as usize;
            let new = new_base + c as usize;
            self.base[new] = self.base[old];
            self.check[new] = node as i32;
            let child_base = self.base[old];
            if child_base > 0 {
                for cc in 0..=255usize {
                    let g = child_base as usize + cc;
                    if g < cap && self.check[g] == old as i32 {
                        self.check[g] = -(new as i32);
                    }
                }
            }
            self.base[old] = 0;
            self.check[old] = 0;
        }

        for &c in children {
            let new = new_base + c as usize;
            let child_base = self.base[new];
            if child_base > 0 {
                for cc in 0..=255usize {
                    let g = child_base as usize + cc;
                    if g < cap && self.check[g] == -(new as i32) {
                        self.check[g] = new as i32;
                    }
                }
            }
        }

        self.base[node] = new_base as i32;
    }

    /// Grow both arrays together. Either the whole reservation succeeds or
    /// the trie is left exactly as it was.
    fn grow_to(&mut self, need: usize) -> Result<()> {
        if need <= self.capacity() {
            return Ok(());
        }
        if need > MAX_CAPACITY {
            return Err(Error::Full("trie capacity"));
        }
        let new_cap = (self.capacity() * 2).max(need).min(MAX_CAPACITY);
        let mut new_base = vec![0i32; new_cap];
        let mut new_check = vec![0i32; new_cap];
        new_base[..self.base.len()].copy_from_slice(&self.base);
        new_check[..self.check.len()].copy_from_slice(&self.check);
        self.base = new_base;
        self.check = new_check;
        Ok(())
    }
}

/// Borrowed read-only double-array, used at inference and export.
#[derive(Debug, Clone, Copy)]
pub struct TrieView<'a> {
    base: &'a [i32],
    check: &'a [i32],
}

impl<'a> TrieView<'a> {
    /// Wrap raw arrays, e.g. freshly loaded from a model file.
    pub fn from_arrays(base: &'a [i32], check: &'a [i32]) -> Self {
        Self { base, check }
    }

    pub fn capacity(&self) -> usize {
        self.base.len()
    }

    pub fn slot(&self, idx: usize) -> TrieSlot {
        if idx >= self.check.len() || self.check[idx] == 0 {
            return TrieSlot::Free;
        }
        let b = self.base[idx];
        if b < 0 {
            TrieSlot::Terminal {
                id: (-(b as i64) - 1) as u32,
            }
        } else {
            TrieSlot::Internal { base: b }
        }
    }

    /// One transition step; `None` when no such child exists.
    #[inline]
    pub fn step(&self, node: usize, c: u8) -> Option<usize> {
        let b = *self.base.get(node)?;
        if b <= 0 {
            return None;
        }
        let next = b as usize + c as usize;
        if next == node || next >= self.check.len() || self.check[next] != node as i32 {
            return None;
        }
        Some(next)
    }

    /// Terminal value at `node`, if a key ends here.
    #[inline]
    pub fn value(&self, node: usize) -> Option<u32> {
        let term = self.step(node, 0)?;
        match self.slot(term) {
            TrieSlot::Terminal { id } => Some(id),
            _ => None,
        }
    }

    /// Node reached after consuming `key`, or 0 when the path does not exist.
    pub fn search_prefix_bytes(&self, key: &[u8]) -> usize {
        let mut node = ROOT;
        for &c in key {
            match self.step(node, c) {
                Some(next) => node = next,
                None => return 0,
            }
        }
        node
    }

    pub fn get_value(&self, key: &[u8]) -> Option<u32> {
        if key.is_empty() {
            return None;
        }
        let node = self.search_prefix_bytes(key);
        if node == 0 {
            return None;
        }
        self.value(node)
    }

    pub fn contains_bytes(&self, key: &[u8]) -> bool {
        self.get_value(key).is_some()
    }
}
