/// Crit-bit (PATRICIA) trie over the padded session key.
///
/// Each slot embeds one [`TrieNode`](super::layout::TrieNode) which is
/// both the slot's leaf and, while the slot is indexed, possibly one
/// branch node. A trie with `n` leaves needs `n - 1` branch nodes, so the
/// embedded nodes always suffice. Lookup, insert and delete walk at most
/// one branch per key bit.
///
/// Links are tagged: a branch node is addressed by its owner's slot index,
/// a leaf by the slot index with `LEAF_TAG` set.
use super::arena::Arena;
use super::layout::{KEY_LEN, LINK_NONE};
use crate::key::PaddedKey;

const LEAF_TAG: u32 = 1 << 31;

/// The slot's branch node is linked into the trie.
const NODE_IN_USE: u32 = 1;
/// The slot's leaf is linked into the trie.
const LEAF_IN_TREE: u32 = 2;

#[inline]
fn leaf(index: u32) -> u32 {
    index | LEAF_TAG
}

#[inline]
fn is_leaf(link: u32) -> bool {
    link & LEAF_TAG != 0
}

#[inline]
fn slot_of(link: u32) -> u32 {
    link & !LEAF_TAG
}

#[inline]
fn key_bit(key: &PaddedKey, bit: u32) -> usize {
    ((key[(bit >> 3) as usize] >> (7 - (bit & 7))) & 1) as usize
}

/// First bit (MSB-first) at which two keys differ.
fn first_difference(a: &PaddedKey, b: &PaddedKey) -> Option<u32> {
    (0..KEY_LEN).find_map(|i| {
        let diff = a[i] ^ b[i];
        (diff != 0).then(|| i as u32 * 8 + diff.leading_zeros())
    })
}

pub fn init(arena: &mut Arena) {
    arena.roots().trie_root = LINK_NONE;
    for i in 0..arena.capacity() {
        arena.slot(i).trie = Default::default();
    }
}

pub fn is_indexed(arena: &mut Arena, index: u32) -> bool {
    arena.slot(index).trie.flags & LEAF_IN_TREE != 0
}

/// Walk to the leaf that shares the longest tested prefix with `key`.
fn closest_leaf(arena: &mut Arena, key: &PaddedKey) -> Option<u32> {
    let mut link = arena.roots().trie_root;
    if link == LINK_NONE {
        return None;
    }
    while !is_leaf(link) {
        let node = &arena.slot(link).trie;
        link = node.child[key_bit(key, node.bit)];
    }
    Some(slot_of(link))
}

/// Exact-match lookup. Returns the owning slot.
pub fn lookup(arena: &mut Arena, key: &PaddedKey) -> Option<u32> {
    let index = closest_leaf(arena, key)?;
    (arena.slot(index).key == *key).then_some(index)
}

/// Point `link`'s parent reference at `parent`.
fn set_parent(arena: &mut Arena, link: u32, parent: u32) {
    if is_leaf(link) {
        arena.slot(slot_of(link)).trie.leaf_parent = parent;
    } else {
        arena.slot(link).trie.node_parent = parent;
    }
}

/// Replace `old` with `new` among the children of `parent`.
fn replace_child(arena: &mut Arena, parent: u32, old: u32, new: u32) {
    if parent == LINK_NONE {
        arena.roots().trie_root = new;
        return;
    }
    let node = &mut arena.slot(parent).trie;
    if node.child[0] == old {
        node.child[0] = new;
    } else {
        debug_assert_eq!(node.child[1], old);
        node.child[1] = new;
    }
}

/// Link slot `index` into the trie under the key already written to it.
///
/// Returns the slot that owns the key afterwards: `index` itself, or the
/// slot that was already indexed under the same key (in which case
/// `index` stays unindexed).
pub fn insert(arena: &mut Arena, index: u32) -> u32 {
    debug_assert!(arena.slot(index).trie.flags == 0, "slot {index} still linked");
    let key = arena.slot(index).key;

    let Some(closest) = closest_leaf(arena, &key) else {
        let node = &mut arena.slot(index).trie;
        node.leaf_parent = LINK_NONE;
        node.flags = LEAF_IN_TREE;
        arena.roots().trie_root = leaf(index);
        return index;
    };

    let other = arena.slot(closest).key;
    let Some(crit) = first_difference(&key, &other) else {
        return closest;
    };

    // Branch bits grow strictly along any path; stop at the first one
    // past the critical bit.
    let mut parent = LINK_NONE;
    let mut link = arena.roots().trie_root;
    while !is_leaf(link) {
        let node = &arena.slot(link).trie;
        if node.bit > crit {
            break;
        }
        parent = link;
        link = node.child[key_bit(&key, node.bit)];
    }

    let dir = key_bit(&key, crit);
    {
        let node = &mut arena.slot(index).trie;
        node.bit = crit;
        node.child[dir] = leaf(index);
        node.child[1 - dir] = link;
        node.node_parent = parent;
        node.leaf_parent = index;
        node.flags = NODE_IN_USE | LEAF_IN_TREE;
    }
    set_parent(arena, link, index);
    replace_child(arena, parent, link, index);
    index
}

/// Unlink slot `index`. No-op when it is not indexed.
///
/// Only trie links are touched; the slot's key and payload stay intact.
pub fn delete(arena: &mut Arena, index: u32) {
    if !is_indexed(arena, index) {
        return;
    }

    let parent = arena.slot(index).trie.leaf_parent;
    if parent == LINK_NONE {
        arena.roots().trie_root = LINK_NONE;
        arena.slot(index).trie.flags = 0;
        return;
    }

    // Splice the parent branch out, lifting our sibling into its place.
    let (sibling, grandparent) = {
        let p = &arena.slot(parent).trie;
        let side = usize::from(p.child[0] == leaf(index));
        (p.child[side], p.node_parent)
    };
    replace_child(arena, grandparent, parent, sibling);
    set_parent(arena, sibling, grandparent);
    arena.slot(parent).trie.flags &= !NODE_IN_USE;

    // Our own branch node may still be linked elsewhere. Move it into the
    // storage the splice just released so it survives our departure.
    if parent != index && arena.slot(index).trie.flags & NODE_IN_USE != 0 {
        let moved = arena.slot(index).trie;
        {
            let node = &mut arena.slot(parent).trie;
            node.child = moved.child;
            node.node_parent = moved.node_parent;
            node.bit = moved.bit;
            node.flags |= NODE_IN_USE;
        }
        replace_child(arena, moved.node_parent, index, parent);
        set_parent(arena, moved.child[0], parent);
        set_parent(arena, moved.child[1], parent);
    }

    arena.slot(index).trie.flags = 0;
}


#[cfg(test)]
mod tests {
    use super::checks::collect;
    use super::*;
    use crate::key::pad_key;
    use crate::shm::arena::testing::HeapRegion;

    fn put(arena: &mut Arena, index: u32, key: &[u8]) -> u32 {
        arena.slot(index).key = pad_key(key).unwrap();
        insert(arena, index)
    }

    fn find(arena: &mut Arena, key: &[u8]) -> Option<u32> {
        lookup(arena, &pad_key(key).unwrap())
    }

    /// Deterministic 32-byte keys that share long prefixes.
    fn key_for(n: u32) -> PaddedKey {
        let mut key = [0u8; KEY_LEN];
        key[0] = 0x5A;
        key[KEY_LEN - 4..].copy_from_slice(&n.wrapping_mul(0x9E37_79B9).to_be_bytes());
        key[KEY_LEN - 5] = (n % 3) as u8;
        key
    }

    #[test]
    fn insert_and_lookup() {
        let mut region = HeapRegion::new(8);
        let mut arena = region.arena();

        assert_eq!(put(&mut arena, 0, b"hello"), 0);
        assert_eq!(find(&mut arena, b"hello"), Some(0));
        assert!(is_indexed(&mut arena, 0));
    }

    #[test]
    fn lookup_missing() {
        let mut region = HeapRegion::new(8);
        let mut arena = region.arena();

        assert_eq!(find(&mut arena, b"nope"), None);

        put(&mut arena, 0, b"hello");
        assert_eq!(find(&mut arena, b"world"), None);
        // Prefix of an indexed key is a different padded key.
        assert_eq!(find(&mut arena, b"hell"), None);
    }

    #[test]
    fn duplicate_insert_reports_existing_owner() {
        let mut region = HeapRegion::new(8);
        let mut arena = region.arena();

        put(&mut arena, 0, b"same");
        put(&mut arena, 1, b"other");
        assert_eq!(put(&mut arena, 2, b"same"), 0);
        assert!(!is_indexed(&mut arena, 2));
        assert_eq!(find(&mut arena, b"same"), Some(0));
        assert_eq!(collect(&mut arena).len(), 2);
    }

    #[test]
    fn delete_leaves_payload_alone() {
        let mut region = HeapRegion::new(4);
        let mut arena = region.arena();

        put(&mut arena, 1, b"k");
        arena.slot(1).data[..3].copy_from_slice(b"abc");
        arena.slot(1).data_len = 3;

        delete(&mut arena, 1);
        assert_eq!(find(&mut arena, b"k"), None);
        assert_eq!(arena.slot(1).key, pad_key(b"k").unwrap());
        assert_eq!(&arena.slot(1).data[..3], b"abc");

        // Deleting again is a no-op.
        delete(&mut arena, 1);
        assert!(collect(&mut arena).is_empty());
    }

    #[test]
    fn delete_relocates_branch_nodes() {
        let capacity = 64;
        let mut region = HeapRegion::new(capacity);
        let mut arena = region.arena();

        for i in 0..capacity {
            arena.slot(i).key = key_for(i);
            assert_eq!(insert(&mut arena, i), i);
        }
        assert_eq!(collect(&mut arena).len(), capacity as usize);

        // Remove in an order unrelated to insertion so owned branch nodes
        // sit all over the trie.
        let mut removed = Vec::new();
        for step in 0..capacity {
            let victim = (step * 37 + 11) % capacity;
            delete(&mut arena, victim);
            removed.push(victim);

            let live = collect(&mut arena);
            assert_eq!(live.len(), (capacity - step - 1) as usize);
            for i in 0..capacity {
                let expected = (!removed.contains(&i)).then_some(i);
                assert_eq!(lookup(&mut arena, &key_for(i)), expected, "key {i}");
            }
        }
        assert_eq!(arena.roots().trie_root, LINK_NONE);
    }

    #[test]
    fn reinsert_after_churn() {
        let capacity = 16;
        let mut region = HeapRegion::new(capacity);
        let mut arena = region.arena();

        for i in 0..capacity {
            arena.slot(i).key = key_for(i);
            insert(&mut arena, i);
        }
        // Recycle every slot under a new key, the way the engine steals
        // LRU slots: delete, overwrite, insert.
        for round in 1..4u32 {
            for i in 0..capacity {
                delete(&mut arena, i);
                arena.slot(i).key = key_for(i + round * 1000);
                assert_eq!(insert(&mut arena, i), i);
                collect(&mut arena);
            }
            for i in 0..capacity {
                assert_eq!(lookup(&mut arena, &key_for(i + round * 1000)), Some(i));
                assert_eq!(lookup(&mut arena, &key_for(i + (round - 1) * 1000)), None);
            }
        }
    }

    #[test]
    fn keys_differing_in_last_bit() {
        let mut region = HeapRegion::new(4);
        let mut arena = region.arena();

        let mut a = [0xFFu8; KEY_LEN];
        let mut b = a;
        a[KEY_LEN - 1] = 0xFE;
        b[KEY_LEN - 1] = 0xFF;

        arena.slot(0).key = a;
        arena.slot(1).key = b;
        insert(&mut arena, 0);
        insert(&mut arena, 1);

        assert_eq!(lookup(&mut arena, &a), Some(0));
        assert_eq!(lookup(&mut arena, &b), Some(1));
        assert_eq!(first_difference(&a, &b), Some(KEY_LEN as u32 * 8 - 1));
    }
}
