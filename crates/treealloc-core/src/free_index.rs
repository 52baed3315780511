//! Size-keyed AVL multiset of free blocks.
//!
//! Keys are block sizes and may repeat. Equal sizes are ordered by block
//! address, so every free block has a unique position and can be removed by
//! identity in O(log n). An entry equal in both size and address routes right.
//! Among several free blocks of the best-fit size, `best_fit` returns the one
//! nearest the root, so the choice follows block addresses and tree shape
//! rather than the order the blocks were freed in.
//!
//! Balance factor is `height(right) - height(left)`; a node at +-2 is repaired
//! with a single or double rotation on the way back up from every insert and
//! delete.

use std::cmp::Ordering;

use crate::block::Block;

type Link = Option<Box<Node>>;

struct Node {
    key: usize,
    block: Block,
    height: i32,
    left: Link,
    right: Link,
}

impl Node {
    fn new(key: usize, block: Block) -> Self {
        Self {
            key,
            block,
            height: 1,
            left: None,
            right: None,
        }
    }

    #[inline]
    fn order(&self) -> (usize, usize) {
        (self.key, self.block.addr())
    }
}

#[inline]
fn height(link: &Link) -> i32 {
    link.as_ref().map_or(0, |n| n.height)
}

#[inline]
fn fix_height(node: &mut Node) {
    node.height = height(&node.left).max(height(&node.right)) + 1;
}

#[inline]
fn bfactor(node: &Node) -> i32 {
    height(&node.right) - height(&node.left)
}

fn rotate_right(mut p: Box<Node>) -> Box<Node> {
    let Some(mut q) = p.left.take() else {
        return p;
    };
    p.left = q.right.take();
    fix_height(&mut p);
    q.right = Some(p);
    fix_height(&mut q);
    q
}

fn rotate_left(mut q: Box<Node>) -> Box<Node> {
    let Some(mut p) = q.right.take() else {
        return q;
    };
    q.right = p.left.take();
    fix_height(&mut q);
    p.left = Some(q);
    fix_height(&mut p);
    p
}

fn balance(mut node: Box<Node>) -> Box<Node> {
    fix_height(&mut node);
    match bfactor(&node) {
        2 => {
            if node.right.as_deref().is_some_and(|r| bfactor(r) < 0) {
                node.right = node.right.take().map(rotate_right);
            }
            rotate_left(node)
        }
        -2 => {
            if node.left.as_deref().is_some_and(|l| bfactor(l) > 0) {
                node.left = node.left.take().map(rotate_left);
            }
            rotate_right(node)
        }
        _ => node,
    }
}

fn insert(link: Link, key: usize, block: Block) -> Box<Node> {
    let Some(mut node) = link else {
        return Box::new(Node::new(key, block));
    };
    if (key, block.addr()) < node.order() {
        node.left = Some(insert(node.left.take(), key, block));
    } else {
        node.right = Some(insert(node.right.take(), key, block));
    }
    balance(node)
}

/// Detaches the minimum of a subtree. Returns the rebalanced remainder and
/// the detached node.
fn take_min(mut node: Box<Node>) -> (Link, Box<Node>) {
    match node.left.take() {
        None => {
            let rest = node.right.take();
            (rest, node)
        }
        Some(left) => {
            let (rest, min) = take_min(left);
            node.left = rest;
            (Some(balance(node)), min)
        }
    }
}

/// Unlinks `node` and splices its in-order successor into its place.
fn unlink(mut node: Box<Node>) -> Link {
    let left = node.left.take();
    let Some(right) = node.right.take() else {
        return left;
    };
    let (rest, mut min) = take_min(right);
    min.right = rest;
    min.left = left;
    Some(balance(min))
}

fn remove_key(link: Link, key: usize, removed: &mut Option<Block>) -> Link {
    let mut node = link?;
    match key.cmp(&node.key) {
        Ordering::Less => node.left = remove_key(node.left.take(), key, removed),
        Ordering::Greater => node.right = remove_key(node.right.take(), key, removed),
        Ordering::Equal => {
            *removed = Some(node.block);
            return unlink(node);
        }
    }
    Some(balance(node))
}

fn remove_exact(link: Link, key: usize, block: Block, removed: &mut bool) -> Link {
    let mut node = link?;
    match (key, block.addr()).cmp(&node.order()) {
        Ordering::Less => node.left = remove_exact(node.left.take(), key, block, removed),
        Ordering::Greater => node.right = remove_exact(node.right.take(), key, block, removed),
        Ordering::Equal => {
            *removed = true;
            return unlink(node);
        }
    }
    Some(balance(node))
}

/// Returns the subtree height if `link` is a correctly balanced, correctly
/// ordered AVL subtree whose entries lie within `(lo, hi]`-style bounds.
fn verify(link: &Link, lo: Option<(usize, usize)>, hi: Option<(usize, usize)>) -> Option<i32> {
    let Some(node) = link else {
        return Some(0);
    };
    let here = node.order();
    if lo.is_some_and(|lo| here < lo) || hi.is_some_and(|hi| here > hi) {
        return None;
    }
    let lh = verify(&node.left, lo, Some(here))?;
    let rh = verify(&node.right, Some(here), hi)?;
    if (rh - lh).abs() > 1 || node.height != lh.max(rh) + 1 {
        return None;
    }
    Some(node.height)
}

/// The free-block index.
#[derive(Default)]
pub struct FreeIndex {
    root: Link,
    len: usize,
}

impl FreeIndex {
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the tree, zero when empty.
    pub fn height(&self) -> i32 {
        height(&self.root)
    }

    /// Indexes `block` under `size`.
    pub fn insert(&mut self, size: usize, block: Block) {
        self.root = Some(insert(self.root.take(), size, block));
        self.len += 1;
    }

    /// Smallest indexed size `>= size` along the best-fit descent.
    ///
    /// A node whose key fits becomes the candidate (if it beats the current
    /// one) and the search continues left for a tighter fit; a node that is
    /// too small sends the search right.
    pub fn best_fit(&self, size: usize) -> Option<(usize, Block)> {
        let mut current = self.root.as_deref();
        let mut best: Option<&Node> = None;
        while let Some(node) = current {
            if node.key >= size {
                if best.is_none_or(|b| node.key < b.key) {
                    best = Some(node);
                }
                current = node.left.as_deref();
            } else {
                current = node.right.as_deref();
            }
        }
        best.map(|n| (n.key, n.block))
    }

    /// Removes the first entry with key `size` met on a plain equality
    /// descent, ignoring addresses.
    ///
    /// On an unchanged index this is the node [`FreeIndex::best_fit`] picks
    /// for the same key, but nothing ties the two calls together. The engine
    /// removes by identity with [`FreeIndex::remove`].
    pub fn remove_key(&mut self, size: usize) -> Option<Block> {
        let mut removed = None;
        self.root = remove_key(self.root.take(), size, &mut removed);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Removes exactly the entry `(size, block)`. Returns whether it existed.
    pub fn remove(&mut self, size: usize, block: Block) -> bool {
        let mut removed = false;
        self.root = remove_exact(self.root.take(), size, block, &mut removed);
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Whether `(size, block)` is indexed.
    pub fn contains(&self, size: usize, block: Block) -> bool {
        let target = (size, block.addr());
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            match target.cmp(&node.order()) {
                Ordering::Less => current = node.left.as_deref(),
                Ordering::Greater => current = node.right.as_deref(),
                Ordering::Equal => return true,
            }
        }
        false
    }

    /// Number of entries with key `size`.
    pub fn count_key(&self, size: usize) -> usize {
        self.iter().filter(|&(key, _)| key == size).count()
    }

    /// Entries in ascending `(size, address)` order.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    /// True when ordering, stored heights, balance and `len` all agree.
    pub fn is_well_formed(&self) -> bool {
        verify(&self.root, None, None).is_some() && self.iter().count() == self.len
    }
}

impl std::fmt::Debug for FreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|(size, block)| (size, block.addr())))
            .finish()
    }
}

/// In-order iterator over `(size, block)` entries.
pub struct Iter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iter<'a> {
    fn push_left(&mut self, mut node: Option<&'a Node>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (usize, Block);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((node.key, node.block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    /// Fabricates distinct block handles. The index never dereferences them.
    fn fake_block(n: usize) -> Block {
        let addr = 0x10_0000 + n * 0x40;
        unsafe { Block::from_raw(NonNull::new(addr as *mut u8).unwrap()) }
    }

    #[test]
    fn empty_index() {
        let mut index = FreeIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.best_fit(16), None);
        assert_eq!(index.remove_key(16), None);
        assert!(!index.remove(16, fake_block(0)));
        assert!(index.is_well_formed());
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_key() {
        let mut index = FreeIndex::new();
        for (i, size) in [128, 64, 512, 256, 32].into_iter().enumerate() {
            index.insert(size, fake_block(i));
        }
        assert_eq!(index.best_fit(1).map(|(k, _)| k), Some(32));
        assert_eq!(index.best_fit(64).map(|(k, _)| k), Some(64));
        assert_eq!(index.best_fit(65).map(|(k, _)| k), Some(128));
        assert_eq!(index.best_fit(300).map(|(k, _)| k), Some(512));
        assert_eq!(index.best_fit(513), None);
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let mut index = FreeIndex::new();
        for i in 0..1024 {
            index.insert(32 + i * 16, fake_block(i));
            assert!(index.is_well_formed(), "unbalanced after insert {i}");
        }
        assert_eq!(index.len(), 1024);
        // 1.44 * log2(1025) ~ 14.4
        assert!(index.height() <= 15, "height {}", index.height());
    }

    #[test]
    fn iteration_is_sorted() {
        let mut index = FreeIndex::new();
        let sizes = [96, 32, 96, 64, 512, 32, 128];
        for (i, size) in sizes.into_iter().enumerate() {
            index.insert(size, fake_block(i));
        }
        let keys: Vec<usize> = index.iter().map(|(k, _)| k).collect();
        let mut sorted = sizes.to_vec();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(index.count_key(96), 2);
        assert_eq!(index.count_key(32), 2);
        assert_eq!(index.count_key(48), 0);
    }

    #[test]
    fn remove_exact_targets_the_named_block() {
        let mut index = FreeIndex::new();
        let a = fake_block(1);
        let b = fake_block(2);
        let c = fake_block(3);
        index.insert(64, a);
        index.insert(64, b);
        index.insert(64, c);

        assert!(index.remove(64, b));
        assert!(!index.remove(64, b));
        assert!(index.contains(64, a));
        assert!(!index.contains(64, b));
        assert!(index.contains(64, c));
        assert_eq!(index.len(), 2);
        assert!(index.is_well_formed());
    }

    #[test]
    fn remove_key_takes_first_equal_node_on_descent() {
        // a < b < c by address; after rebalancing b is the root.
        let mut index = FreeIndex::new();
        let (a, b, c) = (fake_block(1), fake_block(2), fake_block(3));
        for block in [a, b, c] {
            index.insert(64, block);
        }
        let order: Vec<Block> = std::iter::from_fn(|| index.remove_key(64)).collect();
        assert_eq!(order, vec![b, c, a]);
        assert!(index.is_empty());
    }

    #[test]
    fn equal_sizes_resolve_by_address_not_free_order() {
        let orders = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];
        for order in orders {
            let mut index = FreeIndex::new();
            for n in order {
                index.insert(64, fake_block(n));
            }
            assert_eq!(index.best_fit(48), Some((64, fake_block(2))), "order {order:?}");
        }
    }

    #[test]
    fn best_fit_and_remove_key_meet_at_the_same_node() {
        let mut index = FreeIndex::new();
        let mut x: u64 = 0xDEAD_BEEF_CAFE_F00D;
        for i in 0..300 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            // Few distinct sizes so duplicates are everywhere.
            index.insert(32 + (x as usize % 8) * 16, fake_block(i));
        }
        for request in [1, 40, 48, 49, 100, 128, 144] {
            let Some((key, fit)) = index.best_fit(request) else {
                continue;
            };
            assert_eq!(index.remove_key(key), Some(fit), "request {request}");
            assert!(index.is_well_formed());
        }
    }

    #[test]
    fn mixed_removals_keep_avl_shape() {
        let mut index = FreeIndex::new();
        let mut entries = Vec::new();
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        for i in 0..500 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let size = 32 + (x as usize % 64) * 16;
            index.insert(size, fake_block(i));
            entries.push((size, fake_block(i)));
        }
        for (n, (size, block)) in entries.iter().enumerate() {
            if n % 3 == 0 {
                assert!(index.remove(*size, *block));
                assert!(index.is_well_formed(), "malformed after removal {n}");
            }
        }
        while let Some((size, block)) = index.best_fit(0) {
            assert!(index.remove(size, block));
        }
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }
}
