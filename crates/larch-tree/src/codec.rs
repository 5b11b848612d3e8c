//! Log entry payloads for tree nodes.
//!
//! All integers are little-endian. Byte strings are a u32 length followed by
//! the bytes. LSNs are written as their u64 value. A node's slot LSNs are
//! written in the array's own form: compact arrays keep their base file
//! number and 4 byte entries.
//!
//! Internal node layout:
//!
//! ```text
//! +---------+-------+-------+---------+----------+--------+-----------+
//! | node_id | db_id | level | is_root | capacity | id_key | n_entries |
//! |  u64    |  u32  |  i32  |   u8    |   u32    | bytes  |    u32    |
//! +---------+-------+-------+---------+----------+--------+-----------+
//! | lsn array | n x (key, state u8) | kind specific tail              |
//! +-----------+---------------------+---------------------------------+
//! ```

use crate::bin_delta::{BinDelta, DeltaInfo};
use crate::child_ref::ChildReference;
use crate::constants::DIRTY_BIT;
use crate::env::Database;
use crate::in_node::{BinState, DinState, In, InKind};
use crate::ln::{Ln, LnKind};
use crate::lsn_array::{LsnArray, BYTES_PER_LSN_ENTRY};
use crate::node::NodeKind;
use crate::slots::SlotArray;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use larch_common::{DatabaseId, LarchError, NodeId, Result, TxnId};
use larch_log::constants::HEADER_SIZE;
use larch_log::{LogEntryType, Lsn};
use std::sync::Arc;

const LSN_FORM_LONG: u8 = 0;
const LSN_FORM_COMPACT: u8 = 1;

const LN_DATA: u8 = 0;
const LN_DUP_COUNT: u8 = 1;
const LN_MAP: u8 = 2;
const LN_NAME: u8 = 3;

/// Transaction fields of a transactional leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortInfo {
    pub txn_id: TxnId,
    pub abort_lsn: Lsn,
    pub abort_known_deleted: bool,
}

/// A decoded leaf entry.
#[derive(Debug)]
pub struct LnLogEntry {
    pub db_id: DatabaseId,
    pub key: Vec<u8>,
    /// Main tree key of a deleted duplicate.
    pub del_dup_key: Option<Vec<u8>>,
    pub abort: Option<AbortInfo>,
    pub ln: Ln,
}

/// Marks the removal of an emptied subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteInfo {
    pub db_id: DatabaseId,
    pub deleted_node_id: NodeId,
    /// Identifier key of the removed node, or the main tree key of a
    /// removed duplicate tree.
    pub deleted_id_key: Vec<u8>,
    /// Duplicate tree key, for removals inside a duplicate tree.
    pub dup_key: Option<Vec<u8>>,
}

impl DeleteInfo {
    pub fn entry_type(&self) -> LogEntryType {
        if self.dup_key.is_some() {
            LogEntryType::InDupDeleteInfo
        } else {
            LogEntryType::InDeleteInfo
        }
    }

    /// Logs the removal unless the database defers writes.
    pub fn optional_log(&self, db: &Database) -> Result<Lsn> {
        if db.is_deferred_write() {
            return Ok(Lsn::NULL);
        }
        db.env()
            .log()
            .log(self.entry_type(), write_delete_info(self), false, false, Lsn::NULL, 0)
    }
}

// ============================================================================
// Writing
// ============================================================================

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_lsn(buf: &mut BytesMut, lsn: Lsn) {
    buf.put_u64_le(lsn.0);
}

fn put_lsn_array(buf: &mut BytesMut, lsns: &LsnArray) {
    match lsns.compact_bytes() {
        Some(bytes) => {
            buf.put_u8(LSN_FORM_COMPACT);
            buf.put_i64_le(lsns.base_file_number());
            buf.put_slice(bytes);
        }
        None => {
            buf.put_u8(LSN_FORM_LONG);
            for i in 0..lsns.len() {
                put_lsn(buf, lsns.get(i));
            }
        }
    }
}

/// Encodes an internal node.
pub fn write_in(node: &In) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + node.n_entries() * 16);
    buf.put_u64_le(node.node_id().0);
    buf.put_u32_le(node.database().id().0);
    buf.put_i32_le(node.level());
    buf.put_u8(node.is_root() as u8);
    buf.put_u32_le(node.max_entries() as u32);
    put_bytes(&mut buf, node.identifier_key());
    buf.put_u32_le(node.n_entries() as u32);
    put_lsn_array(&mut buf, node.lsn_array());
    for i in 0..node.n_entries() {
        put_bytes(&mut buf, node.key(i));
        buf.put_u8(node.state(i));
    }

    match node.kind() {
        InKind::Upper | InKind::Bottom(_) => {}
        InKind::DupUpper(din) => {
            put_bytes(&mut buf, din.dup_key());
            match din.dup_count_ln_ref() {
                Some(reference) => {
                    buf.put_u8(1);
                    put_bytes(&mut buf, reference.key());
                    put_lsn(&mut buf, reference.lsn());
                    buf.put_u8(reference.state());
                }
                None => buf.put_u8(0),
            }
        }
        InKind::DupBottom { dup_key, .. } => put_bytes(&mut buf, dup_key),
    }
    buf.freeze()
}

/// Encodes a leaf entry.
pub fn write_ln(
    db_id: DatabaseId,
    key: &[u8],
    del_dup_key: Option<&[u8]>,
    abort: Option<&AbortInfo>,
    ln: &Ln,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(48 + key.len() + ln.data().map_or(0, <[u8]>::len));
    buf.put_u32_le(db_id.0);
    buf.put_u64_le(ln.node_id().0);
    put_bytes(&mut buf, key);
    match del_dup_key {
        Some(dup_key) => {
            buf.put_u8(1);
            put_bytes(&mut buf, dup_key);
        }
        None => buf.put_u8(0),
    }
    match abort {
        Some(abort) => {
            buf.put_u8(1);
            buf.put_u64_le(abort.txn_id.0);
            put_lsn(&mut buf, abort.abort_lsn);
            buf.put_u8(abort.abort_known_deleted as u8);
        }
        None => buf.put_u8(0),
    }
    match ln.kind() {
        LnKind::Data => buf.put_u8(LN_DATA),
        LnKind::DupCount { count } => {
            buf.put_u8(LN_DUP_COUNT);
            buf.put_i32_le(*count);
        }
        LnKind::Map { db_id, root_lsn } => {
            buf.put_u8(LN_MAP);
            buf.put_u32_le(db_id.0);
            put_lsn(&mut buf, *root_lsn);
        }
        LnKind::Name { db_id } => {
            buf.put_u8(LN_NAME);
            buf.put_u32_le(db_id.0);
        }
    }
    match ln.data() {
        Some(data) => {
            buf.put_u8(1);
            put_bytes(&mut buf, data);
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

/// Encodes a bottom node delta.
pub fn write_bin_delta(delta: &BinDelta) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + delta.len() * 24);
    buf.put_u64_le(delta.node_id.0);
    buf.put_u32_le(delta.db_id.0);
    put_lsn(&mut buf, delta.last_full_lsn);
    buf.put_u32_le(delta.deltas_since_full);
    buf.put_u32_le(delta.entries.len() as u32);
    for entry in &delta.entries {
        put_bytes(&mut buf, &entry.key);
        put_lsn(&mut buf, entry.lsn);
        buf.put_u8(entry.state);
    }
    buf.freeze()
}

/// Encodes a subtree removal record.
pub fn write_delete_info(info: &DeleteInfo) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + info.deleted_id_key.len());
    buf.put_u32_le(info.db_id.0);
    buf.put_u64_le(info.deleted_node_id.0);
    put_bytes(&mut buf, &info.deleted_id_key);
    match &info.dup_key {
        Some(dup_key) => {
            buf.put_u8(1);
            put_bytes(&mut buf, dup_key);
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

// ============================================================================
// Reading
// ============================================================================

fn corrupted(lsn: Lsn, reason: String) -> LarchError {
    LarchError::LogCorrupted {
        lsn: lsn.to_string(),
        reason,
    }
}

/// Bounds-checked cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    lsn: Lsn,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], lsn: Lsn) -> Self {
        Self { buf, lsn }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(corrupted(self.lsn, format!("payload truncated reading {}", what)));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn flag(&mut self, what: &str) -> Result<bool> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(corrupted(self.lsn, format!("invalid {} flag {}", what, other))),
        }
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self, what: &str) -> Result<i64> {
        self.need(8, what)?;
        Ok(self.buf.get_i64_le())
    }

    /// Reads an entry count, rejecting one the rest of the payload cannot
    /// hold at `min_entry_size` bytes per entry.
    fn count(&mut self, min_entry_size: usize, what: &str) -> Result<usize> {
        let n = self.u32(what)? as usize;
        if n.saturating_mul(min_entry_size) > self.buf.remaining() {
            return Err(corrupted(
                self.lsn,
                format!("{} {} exceeds the {} bytes left", what, n, self.buf.remaining()),
            ));
        }
        Ok(n)
    }

    fn lsn(&mut self, what: &str) -> Result<Lsn> {
        Ok(Lsn(self.u64(what)?))
    }

    fn raw(&mut self, n: usize, what: &str) -> Result<Vec<u8>> {
        self.need(n, what)?;
        let out = self.buf[..n].to_vec();
        self.buf.advance(n);
        Ok(out)
    }

    fn bytes(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.u32(what)? as usize;
        self.raw(len, what)
    }

    fn optional_bytes(&mut self, what: &str) -> Result<Option<Vec<u8>>> {
        if self.flag(what)? {
            Ok(Some(self.bytes(what)?))
        } else {
            Ok(None)
        }
    }

    fn lsn_array(&mut self, n: usize) -> Result<LsnArray> {
        match self.u8("lsn form")? {
            LSN_FORM_COMPACT => {
                let base = self.i64("lsn base")?;
                let bytes = self.raw(n * BYTES_PER_LSN_ENTRY, "compact lsns")?;
                Ok(LsnArray::from_compact(bytes, base))
            }
            LSN_FORM_LONG => {
                self.need(n.saturating_mul(8), "long lsns")?;
                let mut lsns = Vec::with_capacity(n);
                for _ in 0..n {
                    lsns.push(self.lsn("slot lsn")?);
                }
                Ok(LsnArray::from_long(lsns))
            }
            other => Err(corrupted(self.lsn, format!("unknown lsn form {}", other))),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(corrupted(
                self.lsn,
                format!("{} trailing bytes", self.buf.remaining()),
            ));
        }
        Ok(())
    }
}

/// Decodes an internal node of `kind` logged at `lsn`. Slot dirty bits are
/// cleared: the logged version is the node's current state.
pub fn read_in(db: &Arc<Database>, kind: NodeKind, payload: &[u8], lsn: Lsn) -> Result<In> {
    let mut r = Reader::new(payload, lsn);
    let node_id = NodeId(r.u64("node id")?);
    let db_id = DatabaseId(r.u32("database id")?);
    if db_id != db.id() {
        return Err(corrupted(
            lsn,
            format!("node {} belongs to database {}, not {}", node_id, db_id.0, db.id().0),
        ));
    }
    let level = r.i32("level")?;
    let is_root = r.flag("is root")?;
    let capacity = r.u32("capacity")? as usize;
    let identifier_key = r.bytes("identifier key")?;
    // Each slot carries at least a compact lsn, a key length and a state.
    let n = r.count(BYTES_PER_LSN_ENTRY + 4 + 1, "entry count")?;
    if n > capacity {
        return Err(corrupted(lsn, format!("{} entries exceed capacity {}", n, capacity)));
    }
    let lsns = r.lsn_array(n)?;
    let mut keys = Vec::with_capacity(n);
    let mut states = Vec::with_capacity(n);
    for _ in 0..n {
        keys.push(r.bytes("slot key")?);
        states.push(r.u8("slot state")? & !DIRTY_BIT);
    }

    let in_kind = match kind {
        NodeKind::Internal => InKind::Upper,
        NodeKind::Bin => InKind::Bottom(BinState::default()),
        NodeKind::Din => {
            let dup_key = r.bytes("dup key")?;
            let reference = if r.flag("dup count reference")? {
                let key = r.bytes("dup count key")?;
                let ref_lsn = r.lsn("dup count lsn")?;
                let state = r.u8("dup count state")? & !DIRTY_BIT;
                Some(ChildReference::with_state(None, key, ref_lsn, state))
            } else {
                None
            };
            InKind::DupUpper(DinState::new(dup_key, reference))
        }
        NodeKind::Dbin => InKind::DupBottom {
            bin: BinState::default(),
            dup_key: r.bytes("dup key")?,
        },
    };
    r.finish()?;

    let slots = SlotArray::from_parts(capacity, keys, lsns, states);
    Ok(In::from_log(db, node_id, level, identifier_key, is_root, slots, in_kind))
}

/// Decodes a leaf entry logged at `lsn`.
pub fn read_ln(payload: &[u8], lsn: Lsn) -> Result<LnLogEntry> {
    let mut r = Reader::new(payload, lsn);
    let db_id = DatabaseId(r.u32("database id")?);
    let node_id = NodeId(r.u64("node id")?);
    let key = r.bytes("key")?;
    let del_dup_key = r.optional_bytes("deleted dup key")?;
    let abort = if r.flag("abort info")? {
        Some(AbortInfo {
            txn_id: TxnId(r.u64("txn id")?),
            abort_lsn: r.lsn("abort lsn")?,
            abort_known_deleted: r.flag("abort known deleted")?,
        })
    } else {
        None
    };
    let kind = match r.u8("leaf kind")? {
        LN_DATA => LnKind::Data,
        LN_DUP_COUNT => LnKind::DupCount {
            count: r.i32("dup count")?,
        },
        LN_MAP => LnKind::Map {
            db_id: DatabaseId(r.u32("mapped database")?),
            root_lsn: r.lsn("root lsn")?,
        },
        LN_NAME => LnKind::Name {
            db_id: DatabaseId(r.u32("named database")?),
        },
        other => return Err(corrupted(lsn, format!("unknown leaf kind {}", other))),
    };
    let data = r.optional_bytes("data")?;
    r.finish()?;

    let mut ln = Ln::with_id(node_id, data, kind);
    ln.post_fetch_init(HEADER_SIZE + payload.len());
    Ok(LnLogEntry {
        db_id,
        key,
        del_dup_key,
        abort,
        ln,
    })
}

/// Decodes a bottom node delta logged at `lsn`.
pub fn read_bin_delta(payload: &[u8], lsn: Lsn) -> Result<BinDelta> {
    let mut r = Reader::new(payload, lsn);
    let node_id = NodeId(r.u64("node id")?);
    let db_id = DatabaseId(r.u32("database id")?);
    let last_full_lsn = r.lsn("last full lsn")?;
    let deltas_since_full = r.u32("delta count")?;
    // Key length, lsn and state.
    let n = r.count(4 + 8 + 1, "delta entries")?;
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        entries.push(DeltaInfo {
            key: r.bytes("delta key")?,
            lsn: r.lsn("delta lsn")?,
            state: r.u8("delta state")?,
        });
    }
    r.finish()?;
    Ok(BinDelta {
        node_id,
        db_id,
        last_full_lsn,
        deltas_since_full,
        entries,
    })
}

/// Decodes a subtree removal record.
pub fn read_delete_info(payload: &[u8], lsn: Lsn) -> Result<DeleteInfo> {
    let mut r = Reader::new(payload, lsn);
    let info = DeleteInfo {
        db_id: DatabaseId(r.u32("database id")?),
        deleted_node_id: NodeId(r.u64("node id")?),
        deleted_id_key: r.bytes("id key")?,
        dup_key: r.optional_bytes("dup key")?,
    };
    r.finish()?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DatabaseConfig, Environment};
    use larch_common::EnvironmentConfig;

    fn database() -> Arc<Database> {
        let env = Environment::open(EnvironmentConfig::default()).unwrap();
        Arc::new(Database::new(DatabaseId(3), env, DatabaseConfig::new()))
    }

    #[test]
    fn test_bin_keeps_compact_lsns() {
        let db = database();
        let mut bin = In::new_bin(&db, b"k1".to_vec(), 8, 1);
        for (i, file) in [5u32, 6, 4].iter().enumerate() {
            let key = format!("k{}", i + 1).into_bytes();
            bin.insert_entry(ChildReference::new(None, key, Lsn::new(*file, 100))).unwrap();
        }
        bin.set_known_deleted(2);
        assert!(bin.lsn_array().is_compact());

        let payload = write_in(&bin);
        let read = read_in(&db, NodeKind::Bin, &payload, Lsn::new(9, 0)).unwrap();
        assert_eq!(read.node_id(), bin.node_id());
        assert_eq!(read.n_entries(), 3);
        assert!(read.lsn_array().is_compact());
        assert_eq!(read.lsn(1), Lsn::new(6, 100));
        assert_eq!(read.lsn(2), Lsn::new(4, 100));
        assert!(read.is_entry_known_deleted(2));
        assert!(!read.is_entry_dirty(0));
        assert_eq!(read.identifier_key(), b"k1");
    }

    #[test]
    fn test_long_lsns_survive() {
        let db = database();
        let mut node = In::new_in(&db, b"a".to_vec(), 4, 2);
        node.insert_entry(ChildReference::new(None, b"a".to_vec(), Lsn::new(1, 10))).unwrap();
        node.insert_entry(ChildReference::new(None, b"b".to_vec(), Lsn::new(300, 10))).unwrap();
        node.set_is_root(true);
        assert!(!node.lsn_array().is_compact());

        let read = read_in(&db, NodeKind::Internal, &write_in(&node), Lsn::new(9, 0)).unwrap();
        assert!(read.is_root());
        assert_eq!(read.lsn(1), Lsn::new(300, 10));
        assert_eq!(read.max_entries(), 4);
    }

    #[test]
    fn test_din_tail() {
        let db = database();
        let reference = ChildReference::new(None, b"main".to_vec(), Lsn::new(2, 8));
        let din = In::new_din(&db, b"d".to_vec(), 4, b"main".to_vec(), reference, 2);
        let read = read_in(&db, NodeKind::Din, &write_in(&din), Lsn::new(9, 0)).unwrap();
        assert_eq!(read.dup_key(), Some(&b"main"[..]));
        assert_eq!(read.dup_count_ln_ref().unwrap().lsn(), Lsn::new(2, 8));
    }

    #[test]
    fn test_wrong_database_rejected() {
        let db = database();
        let other = Arc::new(Database::new(DatabaseId(4), db.env().clone(), DatabaseConfig::new()));
        let bin = In::new_bin(&other, b"a".to_vec(), 4, 1);
        let err = read_in(&db, NodeKind::Bin, &write_in(&bin), Lsn::new(1, 0)).unwrap_err();
        assert!(matches!(err, LarchError::LogCorrupted { .. }));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let db = database();
        let bin = In::new_bin(&db, b"a".to_vec(), 4, 1);
        let payload = write_in(&bin);
        let err = read_in(&db, NodeKind::Bin, &payload[..payload.len() - 1], Lsn::new(1, 0)).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_ln_entry_fields() {
        let db = database();
        let mut ln = Ln::new(db.env(), b"value".to_vec());
        let abort = AbortInfo {
            txn_id: TxnId(7),
            abort_lsn: Lsn::new(1, 1),
            abort_known_deleted: true,
        };
        let payload = write_ln(db.id(), b"key", Some(b"main"), Some(&abort), &ln);
        let entry = read_ln(&payload, Lsn::new(2, 0)).unwrap();
        assert_eq!(entry.key, b"key");
        assert_eq!(entry.del_dup_key.as_deref(), Some(&b"main"[..]));
        assert_eq!(entry.abort, Some(abort));
        assert_eq!(entry.ln.data(), Some(&b"value"[..]));
        assert!(!entry.ln.is_dirty());

        ln.make_deleted();
        let entry = read_ln(&write_ln(db.id(), b"key", None, None, &ln), Lsn::new(2, 0)).unwrap();
        assert!(entry.ln.is_deleted());
        assert_eq!(entry.ln.data(), None);
        assert_eq!(entry.del_dup_key, None);
    }

    #[test]
    fn test_oversized_entry_count_rejected() {
        let db = database();
        let mut bin = In::new_bin(&db, b"a".to_vec(), 4, 1);
        bin.insert_entry(ChildReference::new(None, b"a".to_vec(), Lsn::new(1, 0))).unwrap();
        let mut payload = write_in(&bin).to_vec();
        // node id, database id, level, root flag, capacity, then the
        // length-prefixed identifier key.
        let count_at = 8 + 4 + 4 + 1 + 4 + 4 + 1;
        assert_eq!(payload[count_at..count_at + 4], 1u32.to_le_bytes());
        payload[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = read_in(&db, NodeKind::Bin, &payload, Lsn::new(1, 0)).unwrap_err();
        assert!(matches!(err, LarchError::LogCorrupted { .. }));
        assert!(err.to_string().contains("entry count"));
    }

    #[test]
    fn test_oversized_delta_count_rejected() {
        let delta = BinDelta {
            node_id: NodeId(9),
            db_id: DatabaseId(3),
            last_full_lsn: Lsn::new(1, 0),
            deltas_since_full: 1,
            entries: Vec::new(),
        };
        let mut payload = write_bin_delta(&delta).to_vec();
        // node id, database id, last full lsn, delta count.
        let count_at = 8 + 4 + 8 + 4;
        payload[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = read_bin_delta(&payload, Lsn::new(2, 0)).unwrap_err();
        assert!(err.to_string().contains("delta entries"));
    }

    #[test]
    fn test_delete_info() {
        let info = DeleteInfo {
            db_id: DatabaseId(3),
            deleted_node_id: NodeId(44),
            deleted_id_key: b"k".to_vec(),
            dup_key: Some(b"d".to_vec()),
        };
        assert_eq!(read_delete_info(&write_delete_info(&info), Lsn::new(1, 0)).unwrap(), info);
    }

    #[test]
    fn test_delete_info_log_type() {
        let db = database();
        let mut info = DeleteInfo {
            db_id: db.id(),
            deleted_node_id: NodeId(45),
            deleted_id_key: b"k".to_vec(),
            dup_key: None,
        };
        let lsn = info.optional_log(&db).unwrap();
        assert_eq!(db.env().log().get(lsn).unwrap().entry_type, LogEntryType::InDeleteInfo);
        info.dup_key = Some(b"d".to_vec());
        let lsn = info.optional_log(&db).unwrap();
        let record = db.env().log().get(lsn).unwrap();
        assert_eq!(record.entry_type, LogEntryType::InDupDeleteInfo);
        assert!(!record.provisional);
    }
}
