/// `#[repr(C)]` structures that live in the shared session segment.
///
/// All structs use fixed-size fields and explicit padding so the
/// layout is identical across compilations and processes. Every
/// cross-record reference is a slot index, never a pointer, since each
/// process maps the segment at its own address.

/// Magic bytes at the start of the header to validate the mapping.
pub const MAGIC: [u8; 8] = *b"SHSESS01";

/// Bumped whenever the shared layout changes.
pub const LAYOUT_VERSION: u32 = 1;

/// Fixed length of a padded session key (maximum TLS session id length).
pub const KEY_LEN: usize = 32;

/// Maximum length of an encoded session payload.
pub const MAX_DATA_LEN: usize = 512;

/// Bytes reserved for the cross-process lock at offset 0: one cache line.
pub const LOCK_SIZE: usize = 64;

/// Offset of [`Header`] from the start of the region.
pub const HEADER_OFFSET: usize = LOCK_SIZE;

/// Lock area plus header. Slots start right after.
pub const HEADER_SIZE: usize = LOCK_SIZE + std::mem::size_of::<Header>();

/// Size of one slot record, key and payload included.
pub const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

/// Largest supported number of slots. Keeps tagged trie links clear of
/// the sentinel values below.
pub const MAX_CAPACITY: u32 = 1 << 24;

/// "No link" in the trie, also used as the parent of the root.
pub const LINK_NONE: u32 = u32::MAX;

/// Sentinel index addressing the active list head in the header.
pub const ACTIVE_HEAD: u32 = u32::MAX - 1;

/// Sentinel index addressing the free list head in the header.
pub const FREE_HEAD: u32 = u32::MAX - 2;

/// Prev/next pair of a circular doubly linked list.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListLink {
    pub prev: u32,
    pub next: u32,
}

/// Written once by the creating process, read-only afterwards.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub magic: [u8; 8],     // 0..8
    pub version: u32,       // 8..12
    pub capacity: u32,      // 12..16
    pub key_len: u32,       // 16..20
    pub max_data_len: u32,  // 20..24
    pub slot_size: u32,     // 24..28
    pub _reserved: u32,     // 28..32
}

/// Mutable list/trie roots. Only touched while holding the lock.
#[repr(C)]
#[derive(Debug)]
pub struct Roots {
    pub trie_root: u32,      // 0..4   (LINK_NONE = empty)
    pub _pad: u32,           // 4..8
    pub active: ListLink,    // 8..16
    pub free: ListLink,      // 16..24
    pub _reserved: [u8; 8],  // 24..32
}

/// Header lives right after the lock area.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    pub geometry: Geometry, // 0..32
    pub roots: Roots,       // 32..64
}

const _: () = assert!(std::mem::size_of::<Geometry>() == 32);
const _: () = assert!(std::mem::size_of::<Roots>() == 32);
const _: () = assert!(std::mem::size_of::<Header>() == 64);

/// Offset of [`Roots`] from the start of the region.
pub const ROOTS_OFFSET: usize = HEADER_OFFSET + std::mem::size_of::<Geometry>();

/// Trie node embedded in every slot.
///
/// The node plays two roles: the slot's leaf (its own key), and at most
/// one internal branch node somewhere in the trie.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TrieNode {
    pub child: [u32; 2],  // 0..8   tagged links of the branch node
    pub node_parent: u32, // 8..12  parent of the branch node (LINK_NONE = root)
    pub leaf_parent: u32, // 12..16 parent of the leaf (LINK_NONE = root)
    pub bit: u32,         // 16..20 critical bit tested by the branch node
    pub flags: u32,       // 20..24
}

/// One cached session.
#[repr(C)]
pub struct Slot {
    pub key: [u8; KEY_LEN],       // 0..32
    pub created_at: i64,          // 32..40 (unix seconds)
    pub data_len: u32,            // 40..44
    pub _pad: u32,                // 44..48
    pub list: ListLink,           // 48..56
    pub trie: TrieNode,           // 56..80
    pub data: [u8; MAX_DATA_LEN], // 80..
}

/// Per-slot bookkeeping in front of the payload.
pub const SLOT_HEADER_SIZE: usize = 80;

const _: () = assert!(SLOT_SIZE == SLOT_HEADER_SIZE + MAX_DATA_LEN);
const _: () = assert!(SLOT_SIZE % 8 == 0);

impl Geometry {
    /// Geometry of a segment built with this crate's constants.
    pub fn for_capacity(capacity: u32) -> Self {
        Geometry {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            capacity,
            key_len: KEY_LEN as u32,
            max_data_len: MAX_DATA_LEN as u32,
            slot_size: SLOT_SIZE as u32,
            _reserved: 0,
        }
    }

    /// Whether a mapped segment was laid out by a compatible build.
    pub fn is_compatible(&self, capacity: u32) -> bool {
        self.magic == MAGIC
            && self.version == LAYOUT_VERSION
            && self.capacity == capacity
            && self.key_len == KEY_LEN as u32
            && self.max_data_len == MAX_DATA_LEN as u32
            && self.slot_size == SLOT_SIZE as u32
    }
}

/// Compute the total size of the shared object.
pub fn region_size(capacity: u32) -> usize {
    HEADER_SIZE + capacity as usize * SLOT_SIZE
}

/// Derive the slot count from a mapped object's byte size.
///
/// Returns `None` when the size cannot have been produced by `region_size`.
pub fn capacity_for(size: usize) -> Option<u32> {
    let slots = size.checked_sub(HEADER_SIZE)?;
    if slots % SLOT_SIZE != 0 {
        return None;
    }
    u32::try_from(slots / SLOT_SIZE).ok()
}

/// Offset of slot `index` from the start of the region.
pub fn slot_offset(index: u32) -> usize {
    HEADER_SIZE + index as usize * SLOT_SIZE
}
