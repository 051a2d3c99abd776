//! A generic-over-key/value B+ tree whose nodes live one page each, whose
//! splits allocate fresh pages through the [`Pager`], and whose root is
//! persisted via the pager's metadata page.
//!
//! Recursive search-then-insert with a "return the promoted separator on
//! overflow" protocol. Full nodes are split top-down, pre-emptively, before
//! the recursion descends into them, so `put` never needs to back up and
//! retry a split.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::config::{Config, PageId};
use crate::error::Result;
use crate::fixed::FixedSized;
use crate::node::{
    self, read_child, read_key, read_next_leaf, read_value, write_child, write_key,
    write_next_leaf, write_value, InternalLayout, LeafLayout, NodeHeader, NodeKind,
};
use crate::pager::Pager;

pub struct Tree<K, V> {
    pager: Pager,
    root: PageId,
    leaf: LeafLayout,
    internal: InternalLayout,
    _marker: PhantomData<(K, V)>,
}

impl<K: FixedSized, V: FixedSized> Tree<K, V> {
    /// Begins a transaction, allocates one page as an empty leaf, makes it
    /// the root, and commits.
    pub fn init(mut pager: Pager, config: Config) -> Result<Self> {
        let leaf = node::leaf_layout(K::ENCODED_SIZE, K::ALIGN, V::ENCODED_SIZE, V::ALIGN, config.order_hint);
        let internal = node::internal_layout(K::ENCODED_SIZE, K::ALIGN, config.order_hint);
        pager.begin_tx()?;
        let mut tree = Tree {
            pager,
            root: 0,
            leaf,
            internal,
            _marker: PhantomData,
        };
        let pid = tree.create_leaf()?;
        tree.pager.set_root_page(pid)?;
        tree.root = pid;
        tree.pager.commit_tx()?;
        Ok(tree)
    }

    /// Delegates to [`Tree::init`] if the pager has no root yet, otherwise
    /// opens a handle onto the existing root.
    pub fn open(pager: Pager, config: Config) -> Result<Self> {
        if pager.root_page() == 0 {
            Self::init(pager, config)
        } else {
            let leaf = node::leaf_layout(
                K::ENCODED_SIZE,
                K::ALIGN,
                V::ENCODED_SIZE,
                V::ALIGN,
                config.order_hint,
            );
            let internal = node::internal_layout(K::ENCODED_SIZE, K::ALIGN, config.order_hint);
            let root = pager.root_page();
            Ok(Tree {
                pager,
                root,
                leaf,
                internal,
                _marker: PhantomData,
            })
        }
    }

    pub fn begin_tx(&mut self) -> Result<()> {
        self.pager.begin_tx()
    }

    pub fn commit_tx(&mut self) -> Result<()> {
        self.pager.commit_tx()
    }

    /// Restores the pager's pre-transaction state, then resyncs the
    /// in-memory root in case a root split happened and was undone.
    pub fn rollback_tx(&mut self) -> Result<()> {
        self.pager.rollback_tx()?;
        self.root = self.pager.root_page();
        Ok(())
    }

    /// No transaction needed. Descends from the root following the first
    /// child whose key range could contain `target`; returns `None` on any
    /// underlying page-read error.
    pub fn get<F>(&self, key: &K, cmp: F) -> Option<V>
    where
        F: Fn(&K, &K) -> Ordering,
    {
        let mut pid = self.root;
        loop {
            let page = self.pager.get_page(pid).ok()?;
            let header = NodeHeader::read_from(page);
            let count = header.key_count as usize;
            match header.kind {
                NodeKind::Leaf => {
                    let idx = node::lower_bound::<K>(page, self.leaf.keys_offset, count, key, &cmp);
                    if idx < count {
                        let found = read_key::<K>(page, self.leaf.keys_offset, idx);
                        if cmp(&found, key) == Ordering::Equal {
                            return Some(read_value::<V>(page, self.leaf.values_offset, idx));
                        }
                    }
                    return None;
                }
                NodeKind::Internal => {
                    let idx =
                        node::lower_bound::<K>(page, self.internal.keys_offset, count, key, &cmp);
                    pid = read_child(page, self.internal.children_offset, idx);
                }
            }
        }
    }

    /// Must be called inside a transaction. Splits the root first if it is
    /// full so the recursive insert never visits a full node.
    pub fn put<F>(&mut self, key: K, value: V, cmp: F) -> Result<()>
    where
        F: Fn(&K, &K) -> Ordering + Copy,
    {
        let root_full = {
            let page = self.pager.get_page(self.root)?;
            self.is_full(&NodeHeader::read_from(page))
        };
        if root_full {
            self.split_root()?;
        }
        self.insert_non_full(self.root, key, value, cmp)
    }

    /// Walks the whole tree checking sort order and uniform leaf depth;
    /// returns the total number of keys. Diagnostic helper exercised by
    /// tests, not part of the persisted format.
    pub fn verify(&self) -> Result<u64> {
        let mut leaf_depth: Option<usize> = None;
        self.verify_node(self.root, 0, &mut leaf_depth)
    }

    fn verify_node(&self, pid: PageId, depth: usize, leaf_depth: &mut Option<usize>) -> Result<u64> {
        let page = self.pager.get_page(pid)?;
        let header = NodeHeader::read_from(page);
        let n = header.key_count as usize;
        match header.kind {
            NodeKind::Leaf => {
                assert!(n <= self.leaf.order, "leaf key_count exceeds ORDER_LEAF");
                match *leaf_depth {
                    Some(d) => assert_eq!(d, depth, "leaves are not all at the same depth"),
                    None => *leaf_depth = Some(depth),
                }
                let mut prev: Option<K> = None;
                for i in 0..n {
                    let k = read_key::<K>(page, self.leaf.keys_offset, i);
                    if let Some(p) = prev {
                        assert!(p < k, "leaf keys not strictly sorted");
                    }
                    prev = Some(k);
                }
                Ok(n as u64)
            }
            NodeKind::Internal => {
                assert!(n <= self.internal.order, "internal key_count exceeds ORDER_INTERNAL");
                let mut prev: Option<K> = None;
                for i in 0..n {
                    let k = read_key::<K>(page, self.internal.keys_offset, i);
                    if let Some(p) = prev {
                        assert!(p < k, "internal keys not strictly sorted");
                    }
                    prev = Some(k);
                }
                let mut total = 0u64;
                for i in 0..=n {
                    let child = read_child(page, self.internal.children_offset, i);
                    total += self.verify_node(child, depth + 1, leaf_depth)?;
                }
                Ok(total)
            }
        }
    }

    /// Visits every leaf via the sibling chain and returns the keys seen, in
    /// order, to let tests check chain termination and ordering.
    pub fn leaf_chain_keys(&self) -> Result<Vec<K>> {
        let mut pid = self.leftmost_leaf()?;
        let mut out = Vec::new();
        loop {
            if pid == 0 {
                break;
            }
            let page = self.pager.get_page(pid)?;
            let header = NodeHeader::read_from(page);
            let n = header.key_count as usize;
            for i in 0..n {
                out.push(read_key::<K>(page, self.leaf.keys_offset, i));
            }
            pid = read_next_leaf(page, self.leaf.next_leaf_offset);
        }
        Ok(out)
    }

    fn leftmost_leaf(&self) -> Result<PageId> {
        let mut pid = self.root;
        loop {
            let page = self.pager.get_page(pid)?;
            let header = NodeHeader::read_from(page);
            match header.kind {
                NodeKind::Leaf => return Ok(pid),
                NodeKind::Internal => pid = read_child(page, self.internal.children_offset, 0),
            }
        }
    }

    fn is_full(&self, header: &NodeHeader) -> bool {
        match header.kind {
            NodeKind::Leaf => header.key_count as usize >= self.leaf.order,
            NodeKind::Internal => header.key_count as usize >= self.internal.order,
        }
    }

    fn create_leaf(&mut self) -> Result<PageId> {
        let pid = self.pager.alloc_page()?;
        let page = self.pager.get_page_for_write(pid)?;
        page.fill(0);
        NodeHeader {
            kind: NodeKind::Leaf,
            key_count: 0,
        }
        .write_into(page);
        Ok(pid)
    }

    fn create_internal(&mut self) -> Result<PageId> {
        let pid = self.pager.alloc_page()?;
        let page = self.pager.get_page_for_write(pid)?;
        page.fill(0);
        NodeHeader {
            kind: NodeKind::Internal,
            key_count: 0,
        }
        .write_into(page);
        Ok(pid)
    }

    fn split_root(&mut self) -> Result<()> {
        let old_root = self.root;
        let kind = {
            let page = self.pager.get_page(old_root)?;
            NodeHeader::read_from(page).kind
        };
        let (sep_key, new_right) = match kind {
            NodeKind::Leaf => self.split_leaf(old_root)?,
            NodeKind::Internal => self.split_internal(old_root)?,
        };
        let new_root_pid = self.create_internal()?;
        {
            let page = self.pager.get_page_for_write(new_root_pid)?;
            write_key::<K>(page, self.internal.keys_offset, 0, &sep_key);
            write_child(page, self.internal.children_offset, 0, old_root);
            write_child(page, self.internal.children_offset, 1, new_right);
            NodeHeader {
                kind: NodeKind::Internal,
                key_count: 1,
            }
            .write_into(page);
        }
        self.root = new_root_pid;
        self.pager.set_root_page(new_root_pid)?;
        Ok(())
    }

    /// Split point `(n+1)/2`; the new right leaf takes `[split, n)`. The
    /// separator promoted to the parent is a *copy* of the right leaf's
    /// first key, which also stays in the leaf, per B+ tree semantics.
    fn split_leaf(&mut self, pid: PageId) -> Result<(K, PageId)> {
        let (keys, values, n, next_leaf) = {
            let page = self.pager.get_page(pid)?;
            let header = NodeHeader::read_from(page);
            let n = header.key_count as usize;
            let mut keys = Vec::with_capacity(n);
            let mut values = Vec::with_capacity(n);
            for i in 0..n {
                keys.push(read_key::<K>(page, self.leaf.keys_offset, i));
                values.push(read_value::<V>(page, self.leaf.values_offset, i));
            }
            let next_leaf = read_next_leaf(page, self.leaf.next_leaf_offset);
            (keys, values, n, next_leaf)
        };
        let split = (n + 1) / 2;
        let new_pid = self.create_leaf()?;
        {
            let page = self.pager.get_page_for_write(new_pid)?;
            for (i, idx) in (split..n).enumerate() {
                write_key::<K>(page, self.leaf.keys_offset, i, &keys[idx]);
                write_value::<V>(page, self.leaf.values_offset, i, &values[idx]);
            }
            NodeHeader {
                kind: NodeKind::Leaf,
                key_count: (n - split) as u16,
            }
            .write_into(page);
            write_next_leaf(page, self.leaf.next_leaf_offset, next_leaf);
        }
        {
            let page = self.pager.get_page_for_write(pid)?;
            NodeHeader {
                kind: NodeKind::Leaf,
                key_count: split as u16,
            }
            .write_into(page);
            write_next_leaf(page, self.leaf.next_leaf_offset, new_pid);
        }
        Ok((keys[split], new_pid))
    }

    /// Split point `n/2`; `keys[split]` is *removed* from the internal (moved
    /// up, not copied), since internal nodes never duplicate separators.
    fn split_internal(&mut self, pid: PageId) -> Result<(K, PageId)> {
        let (keys, children, n) = {
            let page = self.pager.get_page(pid)?;
            let header = NodeHeader::read_from(page);
            let n = header.key_count as usize;
            let mut keys = Vec::with_capacity(n);
            for i in 0..n {
                keys.push(read_key::<K>(page, self.internal.keys_offset, i));
            }
            let mut children = Vec::with_capacity(n + 1);
            for i in 0..=n {
                children.push(read_child(page, self.internal.children_offset, i));
            }
            (keys, children, n)
        };
        let split = n / 2;
        let sep = keys[split];
        let new_pid = self.create_internal()?;
        {
            let page = self.pager.get_page_for_write(new_pid)?;
            for (i, idx) in (split + 1..n).enumerate() {
                write_key::<K>(page, self.internal.keys_offset, i, &keys[idx]);
            }
            for (i, idx) in (split + 1..=n).enumerate() {
                write_child(page, self.internal.children_offset, i, children[idx]);
            }
            NodeHeader {
                kind: NodeKind::Internal,
                key_count: (n - split - 1) as u16,
            }
            .write_into(page);
        }
        {
            let page = self.pager.get_page_for_write(pid)?;
            NodeHeader {
                kind: NodeKind::Internal,
                key_count: split as u16,
            }
            .write_into(page);
        }
        Ok((sep, new_pid))
    }

    /// Shifts `keys[idx..)` and `children[idx+1..)` one slot right and
    /// inserts the separator/new child at `idx`.
    fn insert_separator(&mut self, pid: PageId, idx: usize, sep: &K, new_right: PageId) -> Result<()> {
        let (keys, children, n) = {
            let page = self.pager.get_page(pid)?;
            let header = NodeHeader::read_from(page);
            let n = header.key_count as usize;
            let mut keys = Vec::with_capacity(n);
            for i in 0..n {
                keys.push(read_key::<K>(page, self.internal.keys_offset, i));
            }
            let mut children = Vec::with_capacity(n + 1);
            for i in 0..=n {
                children.push(read_child(page, self.internal.children_offset, i));
            }
            (keys, children, n)
        };
        let page = self.pager.get_page_for_write(pid)?;
        for i in (idx..n).rev() {
            write_key::<K>(page, self.internal.keys_offset, i + 1, &keys[i]);
        }
        write_key::<K>(page, self.internal.keys_offset, idx, sep);
        for i in (idx + 1..=n).rev() {
            write_child(page, self.internal.children_offset, i + 1, children[i]);
        }
        write_child(page, self.internal.children_offset, idx + 1, new_right);
        NodeHeader {
            kind: NodeKind::Internal,
            key_count: (n + 1) as u16,
        }
        .write_into(page);
        Ok(())
    }

    /// Inserts `key`/`value` into the leaf at `pid`. If `key` already exists,
    /// overwrites its value in place without increasing `key_count`.
    fn insert_into_leaf<F>(&mut self, pid: PageId, key: K, value: V, cmp: F) -> Result<()>
    where
        F: Fn(&K, &K) -> Ordering,
    {
        let page = self.pager.get_page_for_write(pid)?;
        let header = NodeHeader::read_from(page);
        let count = header.key_count as usize;
        let idx = node::lower_bound::<K>(page, self.leaf.keys_offset, count, &key, &cmp);
        if idx < count {
            let existing = read_key::<K>(page, self.leaf.keys_offset, idx);
            if cmp(&existing, &key) == Ordering::Equal {
                write_value::<V>(page, self.leaf.values_offset, idx, &value);
                return Ok(());
            }
        }
        for i in (idx..count).rev() {
            let k = read_key::<K>(page, self.leaf.keys_offset, i);
            let v = read_value::<V>(page, self.leaf.values_offset, i);
            write_key::<K>(page, self.leaf.keys_offset, i + 1, &k);
            write_value::<V>(page, self.leaf.values_offset, i + 1, &v);
        }
        write_key::<K>(page, self.leaf.keys_offset, idx, &key);
        write_value::<V>(page, self.leaf.values_offset, idx, &value);
        NodeHeader {
            kind: NodeKind::Leaf,
            key_count: (count + 1) as u16,
        }
        .write_into(page);
        Ok(())
    }

    /// Descends from `pid`, pre-emptively splitting any full child before
    /// following it, so the recursion never visits a full node.
    fn insert_non_full<F>(&mut self, pid: PageId, key: K, value: V, cmp: F) -> Result<()>
    where
        F: Fn(&K, &K) -> Ordering + Copy,
    {
        let kind = {
            let page = self.pager.get_page(pid)?;
            NodeHeader::read_from(page).kind
        };
        match kind {
            NodeKind::Leaf => self.insert_into_leaf(pid, key, value, cmp),
            NodeKind::Internal => {
                let (idx, mut child) = {
                    let page = self.pager.get_page(pid)?;
                    let header = NodeHeader::read_from(page);
                    let count = header.key_count as usize;
                    let idx =
                        node::lower_bound::<K>(page, self.internal.keys_offset, count, &key, &cmp);
                    (idx, read_child(page, self.internal.children_offset, idx))
                };
                let child_full = {
                    let page = self.pager.get_page(child)?;
                    self.is_full(&NodeHeader::read_from(page))
                };
                if child_full {
                    let child_kind = {
                        let page = self.pager.get_page(child)?;
                        NodeHeader::read_from(page).kind
                    };
                    let (sep, new_right) = match child_kind {
                        NodeKind::Leaf => self.split_leaf(child)?,
                        NodeKind::Internal => self.split_internal(child)?,
                    };
                    self.insert_separator(pid, idx, &sep, new_right)?;
                    if cmp(&key, &sep) != Ordering::Less {
                        child = new_right;
                    }
                }
                self.insert_non_full(child, key, value, cmp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ord;
    use tempfile::tempdir;

    fn bytes_cmp(a: &u32, b: &u32) -> Ordering {
        Ord::cmp(a, b)
    }

    fn open_tree(dir: &tempfile::TempDir, name: &str, order_hint: usize) -> Tree<u32, u32> {
        let pager = Pager::init(&dir.path().join(name)).unwrap();
        Tree::open(pager, Config::with_order_hint(order_hint)).unwrap()
    }

    #[test]
    fn empty_tree_read_returns_none() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, "a.db", 0);
        assert_eq!(tree.get(&42, bytes_cmp), None);
        assert_ne!(tree.pager.root_page(), 0);
    }

    #[test]
    fn three_inserts_no_split() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, "a.db", 0);
        tree.begin_tx().unwrap();
        tree.put(1, 100, bytes_cmp).unwrap();
        tree.put(2, 200, bytes_cmp).unwrap();
        tree.put(3, 300, bytes_cmp).unwrap();
        tree.commit_tx().unwrap();
        assert_eq!(tree.get(&1, bytes_cmp), Some(100));
        assert_eq!(tree.get(&2, bytes_cmp), Some(200));
        assert_eq!(tree.get(&3, bytes_cmp), Some(300));
        assert_eq!(tree.get(&4, bytes_cmp), None);
    }

    #[test]
    fn overwrite_does_not_grow_tree() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, "a.db", 0);
        tree.begin_tx().unwrap();
        tree.put(2, 200, bytes_cmp).unwrap();
        tree.commit_tx().unwrap();
        tree.begin_tx().unwrap();
        tree.put(2, 999, bytes_cmp).unwrap();
        tree.commit_tx().unwrap();
        assert_eq!(tree.get(&2, bytes_cmp), Some(999));
        assert_eq!(tree.verify().unwrap(), 1);
    }

    #[test]
    fn rollback_after_overwrite_restores_old_value() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, "a.db", 0);
        tree.begin_tx().unwrap();
        tree.put(2, 200, bytes_cmp).unwrap();
        tree.commit_tx().unwrap();

        tree.begin_tx().unwrap();
        tree.put(2, 999, bytes_cmp).unwrap();
        tree.rollback_tx().unwrap();
        assert_eq!(tree.get(&2, bytes_cmp), Some(200));
    }

    #[test]
    fn rollback_of_absent_key_makes_it_absent_again() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, "a.db", 0);
        tree.begin_tx().unwrap();
        tree.put(5, 500, bytes_cmp).unwrap();
        tree.rollback_tx().unwrap();
        assert_eq!(tree.get(&5, bytes_cmp), None);
    }

    #[test]
    fn leaf_split_cascade_keeps_chain_sorted_and_reachable() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, "a.db", 4);
        tree.begin_tx().unwrap();
        for k in 0..800u32 {
            tree.put(k, k + 1, bytes_cmp).unwrap();
        }
        tree.commit_tx().unwrap();

        assert_eq!(tree.get(&0, bytes_cmp), Some(1));
        assert_eq!(tree.get(&400, bytes_cmp), Some(401));
        assert_eq!(tree.get(&799, bytes_cmp), Some(800));
        assert_eq!(tree.verify().unwrap(), 800);

        let chain = tree.leaf_chain_keys().unwrap();
        assert_eq!(chain.len(), 800);
        assert!(chain.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reopen_after_commit_preserves_data_and_structure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let pager = Pager::init(&path).unwrap();
            let mut tree: Tree<u32, u32> = Tree::open(pager, Config::with_order_hint(4)).unwrap();
            tree.begin_tx().unwrap();
            for k in 0..800u32 {
                tree.put(k, k + 1, bytes_cmp).unwrap();
            }
            tree.commit_tx().unwrap();
        }
        let pager = Pager::init(&path).unwrap();
        let tree: Tree<u32, u32> = Tree::open(pager, Config::with_order_hint(4)).unwrap();
        assert_eq!(tree.get(&0, bytes_cmp), Some(1));
        assert_eq!(tree.get(&400, bytes_cmp), Some(401));
        assert_eq!(tree.get(&799, bytes_cmp), Some(800));
        assert_eq!(tree.verify().unwrap(), 800);
    }

    #[test]
    fn duplicate_key_equal_to_separator_goes_right() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, "a.db", 4);
        tree.begin_tx().unwrap();
        for k in 0..50u32 {
            tree.put(k, k, bytes_cmp).unwrap();
        }
        tree.commit_tx().unwrap();
        assert_eq!(tree.verify().unwrap(), 50);
        for k in 0..50u32 {
            assert_eq!(tree.get(&k, bytes_cmp), Some(k));
        }
    }
}
