//! Packed graph nodes over the mapped graph file.
//!
//! Nodes are appended at caller-reserved byte offsets (`goff`) and
//! addressed by that offset forever after. Mutation of a live node —
//! weight adds, in-degree bumps, hole fills — happens under the per-node
//! lock array; the mapped file's own lock only guards remapping.

use std::path::Path;
use std::ptr;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, StoreError};
use crate::mapped::MappedFile;
use crate::model::{
    node_stride, weight_add, Goff, HOLE, MAX_LINKS, NODE_LINKED_COUNT_OFFSET,
    NODE_LINK_COUNT_OFFSET, NODE_SLOTS_OFFSET, NODE_WEIGHT_HI_OFFSET, NODE_WEIGHT_LO_OFFSET,
};

/// Prime cardinality randomizes lock distribution across nodes.
const NODE_LOCK_COUNT: u64 = 197;

pub(crate) struct GraphFile {
    file: MappedFile,
    node_locks: Vec<Mutex<()>>,
}

impl GraphFile {
    pub fn open(path: &Path, grow_increment: u64) -> Result<Self> {
        let file = MappedFile::open(path, grow_increment)?;
        let node_locks = (0..NODE_LOCK_COUNT).map(|_| Mutex::new(())).collect();
        Ok(Self { file, node_locks })
    }

    fn lock_node(&self, goff: Goff) -> MutexGuard<'_, ()> {
        self.node_locks[(goff % NODE_LOCK_COUNT) as usize].lock()
    }

    /// Writes a fresh node: zero weight, zero in-degree, and the given
    /// slot array. No node lock is taken — the node is not published to
    /// any other thread until its metadata row commits.
    pub fn init_node(&self, goff: Goff, slots: &[i64]) -> Result<()> {
        if slots.len() > MAX_LINKS {
            return Err(StoreError::InvalidParameter("too many links for one node"));
        }
        let mut buf = vec![0u8; node_stride(slots.len()) as usize];
        buf[NODE_LINK_COUNT_OFFSET as usize] = slots.len() as u8;
        for (i, slot) in slots.iter().enumerate() {
            let at = NODE_SLOTS_OFFSET as usize + 8 * i;
            buf[at..at + 8].copy_from_slice(&slot.to_le_bytes());
        }
        self.file.write(goff, &buf)
    }

    pub fn link_count(&self, goff: Goff) -> Result<u8> {
        self.file
            .with_range(goff + NODE_LINK_COUNT_OFFSET, 1, |p| unsafe { *p })
    }

    /// Snapshot of the slot array. Holes read as `-1`; a concurrent fill
    /// is observed either way, never torn (fills are whole-slot writes
    /// under the node lock).
    pub fn links(&self, goff: Goff) -> Result<Vec<i64>> {
        let count = self.link_count(goff)? as usize;
        let _guard = self.lock_node(goff);
        self.file
            .with_range(goff + NODE_SLOTS_OFFSET, 8 * count as u64, |p| {
                (0..count)
                    .map(|i| unsafe { read_i64(p.add(8 * i)) })
                    .collect()
            })
    }

    /// Fills a hole. Write-once: returns `Ok(true)` if this call resolved
    /// the slot, `Ok(false)` if another thread already resolved it to the
    /// same target (insertion backfill and worker hole repair can race on
    /// one slot), and corruption if the slot holds anything else.
    pub fn set_link(&self, goff: Goff, slot: u32, target: Goff) -> Result<bool> {
        let count = self.link_count(goff)?;
        if slot >= u32::from(count) {
            return Err(StoreError::Corruption(format!(
                "link slot {slot} out of range for node at {goff} (link_count {count})"
            )));
        }
        let _guard = self.lock_node(goff);
        self.file
            .with_range(goff + NODE_SLOTS_OFFSET + 8 * u64::from(slot), 8, |p| {
                let current = unsafe { read_i64(p) };
                if current == target as i64 {
                    return Ok(false);
                }
                if current != HOLE {
                    return Err(StoreError::Corruption(format!(
                        "slot {slot} of node at {goff} already resolved to {current}"
                    )));
                }
                unsafe { write_i64(p, target as i64) };
                Ok(true)
            })?
    }

    /// Increments the in-degree counter.
    pub fn bump_linked_count(&self, goff: Goff) -> Result<u64> {
        let _guard = self.lock_node(goff);
        self.file
            .with_range(goff + NODE_LINKED_COUNT_OFFSET, 8, |p| {
                let next = unsafe { read_u64(p) } + 1;
                unsafe { write_u64(p, next) };
                next
            })
    }

    pub fn linked_count(&self, goff: Goff) -> Result<u64> {
        let _guard = self.lock_node(goff);
        self.file
            .with_range(goff + NODE_LINKED_COUNT_OFFSET, 8, |p| unsafe { read_u64(p) })
    }

    /// 80-bit saturating weight add under the node lock, so concurrent
    /// adds from different source records never lose updates.
    pub fn add_weight(&self, goff: Goff, score: u32) -> Result<()> {
        let _guard = self.lock_node(goff);
        self.file.with_range(goff, NODE_LINKED_COUNT_OFFSET, |p| {
            let lo = unsafe { read_u64(p.add(NODE_WEIGHT_LO_OFFSET as usize)) };
            let hi = unsafe { read_u16(p.add(NODE_WEIGHT_HI_OFFSET as usize)) };
            let (new_lo, new_hi) = weight_add(lo, hi, score);
            unsafe {
                write_u64(p.add(NODE_WEIGHT_LO_OFFSET as usize), new_lo);
                write_u16(p.add(NODE_WEIGHT_HI_OFFSET as usize), new_hi);
            }
        })
    }

    pub fn weight(&self, goff: Goff) -> Result<(u64, u16)> {
        let _guard = self.lock_node(goff);
        self.file.with_range(goff, NODE_LINKED_COUNT_OFFSET, |p| unsafe {
            (
                read_u64(p.add(NODE_WEIGHT_LO_OFFSET as usize)),
                read_u16(p.add(NODE_WEIGHT_HI_OFFSET as usize)),
            )
        })
    }

    /// Recovery pass for a possibly torn node: rewrite the `link_count`
    /// byte from metadata, force `-1` into every slot the dangling table
    /// still claims, and sanity-check the rest. A resolved slot pointing
    /// outside the allocated graph region is unrecoverable (link targets
    /// live only inside the opaque record bytes) and surfaces as
    /// corruption.
    pub fn heal_node(
        &self,
        goff: Goff,
        link_count: u8,
        dangling_slots: &[u32],
        allocated_end: Goff,
    ) -> Result<()> {
        let _guard = self.lock_node(goff);
        let count = link_count as usize;
        self.file
            .with_range(goff + NODE_LINK_COUNT_OFFSET, 1 + 8 * count as u64, |p| {
                unsafe { *p = link_count };
                for slot in 0..count {
                    let sp = unsafe { p.add(1 + 8 * slot) };
                    if dangling_slots.contains(&(slot as u32)) {
                        unsafe { write_i64(sp, HOLE) };
                        continue;
                    }
                    let value = unsafe { read_i64(sp) };
                    if value != HOLE && (value < 0 || value as u64 >= allocated_end) {
                        return Err(StoreError::Corruption(format!(
                            "node at {goff}: resolved slot {slot} points at {value}, \
                             past allocated end {allocated_end}"
                        )));
                    }
                }
                Ok(())
            })?
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

unsafe fn read_u64(p: *const u8) -> u64 {
    let mut b = [0u8; 8];
    ptr::copy_nonoverlapping(p, b.as_mut_ptr(), 8);
    u64::from_le_bytes(b)
}

unsafe fn write_u64(p: *mut u8, v: u64) {
    ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), p, 8);
}

unsafe fn read_i64(p: *const u8) -> i64 {
    let mut b = [0u8; 8];
    ptr::copy_nonoverlapping(p, b.as_mut_ptr(), 8);
    i64::from_le_bytes(b)
}

unsafe fn write_i64(p: *mut u8, v: i64) {
    ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), p, 8);
}

unsafe fn read_u16(p: *const u8) -> u16 {
    let mut b = [0u8; 2];
    ptr::copy_nonoverlapping(p, b.as_mut_ptr(), 2);
    u16::from_le_bytes(b)
}

unsafe fn write_u16(p: *mut u8, v: u16) {
    ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), p, 2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node_stride;
    use tempfile::TempDir;

    fn open_graph(dir: &TempDir) -> GraphFile {
        GraphFile::open(&dir.path().join("graph.bin"), 64 * 1024).expect("open graph")
    }

    #[test]
    fn init_and_read_back_node() {
        let dir = TempDir::new().expect("temp dir");
        let graph = open_graph(&dir);

        graph.init_node(0, &[HOLE, 1234]).expect("init");
        assert_eq!(graph.link_count(0).expect("link_count"), 2);
        assert_eq!(graph.links(0).expect("links"), vec![HOLE, 1234]);
        assert_eq!(graph.weight(0).expect("weight"), (0, 0));
        assert_eq!(graph.linked_count(0).expect("linked_count"), 0);
    }

    #[test]
    fn set_link_is_write_once() {
        let dir = TempDir::new().expect("temp dir");
        let graph = open_graph(&dir);

        graph.init_node(0, &[HOLE]).expect("init");
        assert!(graph.set_link(0, 0, 555).expect("fill hole"));
        assert_eq!(graph.links(0).expect("links"), vec![555]);

        // Losing the fill race to the same target is benign.
        assert!(!graph.set_link(0, 0, 555).expect("refill"));
        let err = graph.set_link(0, 0, 777).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn weight_accumulates_across_adds() {
        let dir = TempDir::new().expect("temp dir");
        let graph = open_graph(&dir);

        let goff = node_stride(3);
        graph.init_node(goff, &[]).expect("init");
        graph.add_weight(goff, 10).expect("add");
        graph.add_weight(goff, 5).expect("add");
        assert_eq!(graph.weight(goff).expect("weight"), (15, 0));
    }

    #[test]
    fn heal_restores_dangling_slots() {
        let dir = TempDir::new().expect("temp dir");
        let graph = open_graph(&dir);

        graph.init_node(0, &[HOLE, 42]).expect("init");
        graph.set_link(0, 0, 99).expect("fill");
        // Metadata still says slot 0 is dangling: force it back open.
        graph.heal_node(0, 2, &[0], 1 << 20).expect("heal");
        assert_eq!(graph.links(0).expect("links"), vec![HOLE, 42]);
    }
}
