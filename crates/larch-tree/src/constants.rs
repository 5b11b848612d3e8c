//! Tree constants: slot state bits, level encoding, search result flags.

// Slot state bits

/// The slot's record is deleted and committed; its target is cleared.
pub const KNOWN_DELETED_BIT: u8 = 0x1;
/// The slot changed since the node was last logged.
pub const DIRTY_BIT: u8 = 0x2;
/// The slot's child should be migrated out of its log file when logged.
pub const MIGRATE_BIT: u8 = 0x4;
/// The slot's record is deleted by a transaction that may not have committed.
pub const PENDING_DELETED_BIT: u8 = 0x8;

// Levels

/// Level bit for nodes of the id catalog database.
pub const DBMAP_LEVEL: i32 = 0x20000;
/// Level bit for nodes of ordinary databases.
pub const MAIN_LEVEL: i32 = 0x10000;
/// Mask selecting the height within a tree.
pub const LEVEL_MASK: i32 = 0x0ffff;
/// Lowest level.
pub const MIN_LEVEL: i32 = -1;
/// Level of a main tree BIN.
pub const BIN_LEVEL: i32 = MAIN_LEVEL | 1;
/// Level of a duplicate tree DBIN.
pub const DBIN_LEVEL: i32 = 1;
/// Level of a freshly created duplicate tree root.
pub const DIN_ROOT_LEVEL: i32 = 2;

// findEntry / insertEntry1 result flags

/// OR'd into a `find_entry` result when the key matched exactly.
pub const EXACT_MATCH: i32 = 1 << 16;
/// OR'd into an `insert_entry1` result when a new slot was created.
pub const INSERT_SUCCESS: i32 = 1 << 17;
/// Mask selecting the index from a flagged result.
pub const INDEX_MASK: i32 = 0xffff;

/// Retries of a search that needed an exclusive root latch.
pub const RELATCH_RETRIES: usize = 2;
