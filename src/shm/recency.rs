/// Active and free lists: two circular doubly linked lists with sentinel
/// heads stored in the header.
///
/// Every slot is on exactly one of them. The active list runs from most
/// recently used (head) to least recently used (tail). A slot is indexed
/// in the trie if and only if it is on the active list.
use super::arena::Arena;
use super::layout::{ListLink, ACTIVE_HEAD, FREE_HEAD};
use super::trie;

/// Resolve a list position: a sentinel in the header or a slot.
fn link<'a>(arena: &'a mut Arena, at: u32) -> &'a mut ListLink {
    match at {
        ACTIVE_HEAD => &mut arena.roots().active,
        FREE_HEAD => &mut arena.roots().free,
        index => &mut arena.slot(index).list,
    }
}

/// Empty active list, every slot chained onto the free list in index order.
pub fn init(arena: &mut Arena) {
    let capacity = arena.capacity();
    arena.roots().active = ListLink {
        prev: ACTIVE_HEAD,
        next: ACTIVE_HEAD,
    };

    let mut prev = FREE_HEAD;
    for i in 0..capacity {
        link(arena, prev).next = i;
        arena.slot(i).list.prev = prev;
        prev = i;
    }
    link(arena, prev).next = FREE_HEAD;
    arena.roots().free.prev = prev;
}

/// Remove a slot from whichever list holds it. The slot must be relinked
/// before the lock is released.
pub fn unset(arena: &mut Arena, index: u32) {
    let ListLink { prev, next } = arena.slot(index).list;
    link(arena, next).prev = prev;
    link(arena, prev).next = next;
}

fn push_front(arena: &mut Arena, head: u32, index: u32) {
    let first = link(arena, head).next;
    arena.slot(index).list = ListLink {
        prev: head,
        next: first,
    };
    link(arena, first).prev = index;
    link(arena, head).next = index;
}

/// Move a slot to the free list head, dropping it from the trie.
pub fn set_free(arena: &mut Arena, index: u32) {
    unset(arena, index);
    trie::delete(arena, index);
    push_front(arena, FREE_HEAD, index);
}

/// Move a slot to the MRU end of the active list.
pub fn set_active(arena: &mut Arena, index: u32) {
    unset(arena, index);
    push_front(arena, ACTIVE_HEAD, index);
}

/// The slot the next store should use: the oldest free slot, otherwise
/// the LRU active slot. `None` only for a zero-capacity table.
pub fn next_acquirable(arena: &mut Arena) -> Option<u32> {
    let free_tail = arena.roots().free.prev;
    if free_tail != FREE_HEAD {
        return Some(free_tail);
    }
    let active_tail = arena.roots().active.prev;
    (active_tail != ACTIVE_HEAD).then_some(active_tail)
}

/// Number of slots on one list. Walks without allocating and stops after
/// `capacity` steps so a corrupted list cannot spin forever.
pub fn len(arena: &mut Arena, head: u32) -> u32 {
    let capacity = arena.capacity();
    let mut count = 0;
    let mut at = link(arena, head).next;
    while at != head && count <= capacity {
        count += 1;
        at = arena.slot(at).list.next;
    }
    count
}

/// Slots on one list, head to tail.
#[cfg(test)]
pub fn collect(arena: &mut Arena, head: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut at = link(arena, head).next;
    while at != head && out.len() <= arena.capacity() as usize {
        out.push(at);
        at = arena.slot(at).list.next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::pad_key;
    use crate::shm::arena::testing::HeapRegion;

    fn activate(arena: &mut Arena, index: u32, key: &[u8]) {
        trie::delete(arena, index);
        arena.slot(index).key = pad_key(key).unwrap();
        trie::insert(arena, index);
        set_active(arena, index);
    }

    #[test]
    fn fresh_table_is_all_free() {
        let mut region = HeapRegion::new(4);
        let mut arena = region.arena();

        assert!(collect(&mut arena, ACTIVE_HEAD).is_empty());
        assert_eq!(collect(&mut arena, FREE_HEAD), vec![0, 1, 2, 3]);
    }

    #[test]
    fn free_slots_are_taken_before_stealing() {
        let mut region = HeapRegion::new(3);
        let mut arena = region.arena();

        let mut used = Vec::new();
        for k in [b"a", b"b", b"c"] {
            let index = next_acquirable(&mut arena).unwrap();
            assert!(!used.contains(&index));
            activate(&mut arena, index, k);
            used.push(index);
        }
        assert!(collect(&mut arena, FREE_HEAD).is_empty());

        // Full: the LRU active slot (first one used) comes back.
        assert_eq!(next_acquirable(&mut arena), Some(used[0]));
    }

    #[test]
    fn set_active_moves_to_head() {
        let mut region = HeapRegion::new(3);
        let mut arena = region.arena();

        activate(&mut arena, 0, b"a");
        activate(&mut arena, 1, b"b");
        activate(&mut arena, 2, b"c");
        assert_eq!(collect(&mut arena, ACTIVE_HEAD), vec![2, 1, 0]);

        set_active(&mut arena, 0);
        assert_eq!(collect(&mut arena, ACTIVE_HEAD), vec![0, 2, 1]);
        assert_eq!(next_acquirable(&mut arena), Some(1));
    }

    #[test]
    fn set_free_unindexes() {
        let mut region = HeapRegion::new(2);
        let mut arena = region.arena();

        activate(&mut arena, 0, b"a");
        activate(&mut arena, 1, b"b");

        set_free(&mut arena, 1);
        assert!(!trie::is_indexed(&mut arena, 1));
        assert_eq!(trie::lookup(&mut arena, &pad_key(b"b").unwrap()), None);
        assert_eq!(collect(&mut arena, ACTIVE_HEAD), vec![0]);
        assert_eq!(collect(&mut arena, FREE_HEAD), vec![1]);

        // The freed slot is reused before the active one.
        assert_eq!(next_acquirable(&mut arena), Some(1));
    }

    #[test]
    fn len_counts_without_collecting() {
        let mut region = HeapRegion::new(5);
        let mut arena = region.arena();

        assert_eq!(len(&mut arena, ACTIVE_HEAD), 0);
        assert_eq!(len(&mut arena, FREE_HEAD), 5);

        activate(&mut arena, 0, b"a");
        activate(&mut arena, 3, b"b");
        set_free(&mut arena, 0);

        assert_eq!(len(&mut arena, ACTIVE_HEAD), 1);
        assert_eq!(len(&mut arena, FREE_HEAD), 4);
        assert_eq!(
            len(&mut arena, FREE_HEAD) as usize,
            collect(&mut arena, FREE_HEAD).len()
        );
    }

    #[test]
    fn single_free_slot_is_still_preferred() {
        let mut region = HeapRegion::new(2);
        let mut arena = region.arena();

        let first = next_acquirable(&mut arena).unwrap();
        activate(&mut arena, first, b"a");

        let second = next_acquirable(&mut arena).unwrap();
        assert_ne!(first, second);
    }
}
