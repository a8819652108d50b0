//! The record store: append-only data log, memory-mapped record DAG, and
//! a relational index, converging in the background.
//!
//! Lock discipline: the metadata mutex serializes all mutation of the
//! relational index and cursor reservation (single-writer). The mapped
//! files' reader/writer locks are taken read-side for every byte access
//! and write-side only to remap on growth. Per-node mutexes serialize
//! slot fills, in-degree bumps, and weight adds. No code path acquires
//! the metadata mutex while holding a node lock, and file write locks are
//! never held across any other acquisition, so the graph is cycle-free.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crc::{Crc, CRC_64_ECMA_182};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::model::{
    node_stride, Goff, MatchingRecord, NewRecord, RecordHash, Stats, HOLE, MAX_LINKS,
};

mod config;
mod graph;
mod log;
mod meta;
mod weight;

pub use config::Config;

use graph::GraphFile;
use log::DataLog;
use meta::{MetaStore, RecordRow};

const DATA_FILE: &str = "records.log";
const GRAPH_FILE: &str = "graph.bin";
const INDEX_FILE: &str = "index.db";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub(crate) struct StoreInner {
    pub(crate) config: Config,
    pub(crate) meta: Mutex<MetaStore>,
    pub(crate) data: DataLog,
    pub(crate) graph: GraphFile,
    pub(crate) running: AtomicBool,
    next_doff: AtomicU64,
    next_goff: AtomicU64,
}

/// An open record store rooted at one directory. Stores are independent;
/// any number may coexist in a process. Dropping the store (or calling
/// [`close`]) stops and joins the propagation worker.
///
/// [`close`]: RecordStore::close
pub struct RecordStore {
    path: PathBuf,
    inner: Arc<StoreInner>,
    worker: Option<JoinHandle<()>>,
}

impl RecordStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(dir, Config::default())
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let meta = MetaStore::open(&dir.join(INDEX_FILE))?;
        let data = DataLog::open(&dir.join(DATA_FILE), config.data_grow_increment)?;
        let graph = GraphFile::open(&dir.join(GRAPH_FILE), config.graph_grow_increment)?;

        // Append cursors: whichever is further along, the checkpointed
        // counter or what the committed rows imply.
        let next_doff = meta.counter("next_doff")?.unwrap_or(0).max(meta.max_doff()?);
        let next_goff = meta.counter("next_goff")?.unwrap_or(0).max(meta.max_goff()?);
        if next_doff > data.size() {
            return Err(StoreError::Corruption(format!(
                "metadata data cursor {next_doff} exceeds {DATA_FILE} size {}",
                data.size()
            )));
        }
        if next_goff > graph.size() {
            return Err(StoreError::Corruption(format!(
                "metadata graph cursor {next_goff} exceeds {GRAPH_FILE} size {}",
                graph.size()
            )));
        }

        // Torn-write pass over records that were still pending: their
        // nodes are the only ones a crash can have left half-written.
        for (goff, link_count) in meta.pending_heal_rows()? {
            let dangling_slots = meta.dangling_slots_for_holder(goff)?;
            graph.heal_node(goff, link_count, &dangling_slots, next_goff)?;
        }

        let record_count = meta.record_count()?;
        let inner = Arc::new(StoreInner {
            config,
            meta: Mutex::new(meta),
            data,
            graph,
            running: AtomicBool::new(true),
            next_doff: AtomicU64::new(next_doff),
            next_goff: AtomicU64::new(next_goff),
        });

        let worker = thread::Builder::new()
            .name("lfdb-weight".into())
            .spawn({
                let inner = Arc::clone(&inner);
                move || weight::run(inner)
            })?;

        info!(path = %dir.display(), records = record_count, "record store opened");
        Ok(Self {
            path: dir.to_path_buf(),
            inner,
            worker: Some(worker),
        })
    }

    /// Admits a validated record: appends its bytes to the data log,
    /// allocates its graph node, resolves (or records as dangling) its
    /// links, fills holes elsewhere that were waiting for it, and queues
    /// it for weight propagation. Re-inserting an existing hash is a
    /// success and changes nothing.
    ///
    /// Success means the record is durable and queryable by hash; its
    /// score reaches ancestors asynchronously (see [`has_pending`]).
    ///
    /// [`has_pending`]: RecordStore::has_pending
    pub fn put_record(&self, rec: &NewRecord<'_>) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(StoreError::Cancelled);
        }
        if rec.links.len() > MAX_LINKS {
            return Err(StoreError::InvalidParameter("record has more than 256 links"));
        }
        if rec.bytes.is_empty() {
            return Err(StoreError::InvalidParameter("record bytes must not be empty"));
        }
        if rec.hash == [0u8; 32] {
            return Err(StoreError::InvalidParameter("record hash must not be zero"));
        }

        let inner = &*self.inner;
        let mut meta = inner.meta.lock();

        if meta.get_goff_by_hash(&rec.hash)?.is_some() {
            debug!("duplicate record ignored");
            return Ok(());
        }

        let doff = inner.next_doff.load(Ordering::Relaxed);
        let goff = inner.next_goff.load(Ordering::Relaxed);
        let end_doff = doff + rec.bytes.len() as u64;
        let end_goff = goff + node_stride(rec.links.len());

        // The append lands before the metadata transaction: if anything
        // below fails the bytes are orphaned but inert, and a retry of
        // the same record is an ordinary insertion.
        inner.data.append(doff, rec.bytes)?;

        let mut slots = Vec::with_capacity(rec.links.len());
        for link in rec.links {
            match meta.get_goff_by_hash(link)? {
                Some(target) => slots.push(target as i64),
                None => slots.push(HOLE),
            }
        }
        inner.graph.init_node(goff, &slots)?;

        meta.begin()?;
        let admitted = (|| {
            Self::link_and_index(inner, &meta, rec, &slots, doff, goff)?;
            meta.set_counter("next_doff", end_doff)?;
            meta.set_counter("next_goff", end_goff)
        })();
        let admitted = admitted.and_then(|()| meta.commit());
        match admitted {
            Ok(()) => {
                inner.next_doff.store(end_doff, Ordering::Relaxed);
                inner.next_goff.store(end_goff, Ordering::Relaxed);
                // The record is committed; a failed periodic checkpoint is
                // not the caller's problem.
                if let Err(err) = meta.maybe_checkpoint(inner.config.checkpoint_interval) {
                    warn!(%err, "metadata checkpoint failed");
                }
                Ok(())
            }
            Err(StoreError::Duplicate) => {
                meta.rollback();
                Ok(())
            }
            Err(err) => {
                meta.rollback();
                Err(err)
            }
        }
    }

    /// Metadata half of the insertion pipeline, inside one transaction.
    fn link_and_index(
        inner: &StoreInner,
        meta: &MetaStore,
        rec: &NewRecord<'_>,
        slots: &[i64],
        doff: u64,
        goff: Goff,
    ) -> Result<()> {
        let mut holes = 0u64;
        for (i, link) in rec.links.iter().enumerate() {
            if slots[i] == HOLE {
                meta.add_dangling(link, goff, i as u32)?;
                meta.add_hole(goff, goff, i as u32)?;
                meta.add_wanted(link, rec.ts)?;
                holes += 1;
            } else {
                let target = slots[i] as u64;
                inner.graph.bump_linked_count(target)?;
                meta.bump_linked_count(target)?;
            }
        }

        meta.add_record(&RecordRow {
            hash: rec.hash,
            doff,
            dlen: rec.bytes.len() as u64,
            goff,
            link_count: rec.links.len() as u8,
            id: rec.id.to_vec(),
            owner: rec.owner.to_vec(),
            ts: rec.ts,
            ttl: rec.ttl,
            score: rec.score,
            sel0: rec.sel0.map(<[u8]>::to_vec),
            sel1: rec.sel1.map(<[u8]>::to_vec),
            change_owner: rec.change_owner.map(<[u8]>::to_vec),
        })?;
        meta.delete_wanted(&rec.hash)?;

        // Holes elsewhere that were waiting for exactly this record.
        let waiting = meta.dangling_links(&rec.hash)?;
        if !waiting.is_empty() {
            debug!(goff, holes = waiting.len(), "filling holes for arrived record");
        }
        for (holder_goff, slot) in waiting {
            if inner.graph.set_link(holder_goff, slot, goff)? {
                inner.graph.bump_linked_count(goff)?;
                meta.bump_linked_count(goff)?;
                // Unblock everything waiting on this slot, the holder
                // itself included, then retire the hole rows.
                meta.decrement_pending_waiting_on(holder_goff, slot)?;
                meta.delete_holes_at(holder_goff, slot)?;
            }
        }
        meta.delete_dangling(&rec.hash)?;

        meta.flag_weight_pending(goff, holes)?;
        Ok(())
    }

    /// Record bytes by hash.
    pub fn get_by_hash(&self, hash: &RecordHash) -> Result<Vec<u8>> {
        let located = self.inner.meta.lock().get_by_hash(hash)?;
        let (doff, dlen) = located.ok_or(StoreError::NotFound)?;
        self.inner.data.read(doff, dlen)
    }

    /// Streams records matching every present filter, in admission order,
    /// until the callback returns false. The callback runs outside the
    /// metadata lock and may call back into the store.
    pub fn get_matching(
        &self,
        id: Option<&[u8]>,
        owner: Option<&[u8]>,
        sel0: Option<&[u8]>,
        sel1: Option<&[u8]>,
        mut f: impl FnMut(MatchingRecord) -> bool,
    ) -> Result<()> {
        let rows = self.inner.meta.lock().matching(id, owner, sel0, sel1)?;
        for row in rows {
            let weight = self.inner.graph.weight(row.goff)?;
            let keep_going = f(MatchingRecord {
                doff: row.doff,
                dlen: row.dlen,
                goff: row.goff,
                ts: row.ts,
                exp: row.ts.saturating_add(row.ttl),
                owner: row.owner,
                change_owner: row.change_owner,
                weight,
            });
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Up to `desired` hashes a newly authored record should link to.
    pub fn get_links(&self, desired: usize) -> Result<Vec<RecordHash>> {
        self.inner.meta.lock().link_candidates(desired)
    }

    pub fn stats(&self) -> Result<Stats> {
        let meta = self.inner.meta.lock();
        Ok(Stats {
            record_count: meta.record_count()?,
            data_size: meta.data_size()?,
        })
    }

    /// Integrity digest: every record's hash and 80-bit weight folded into
    /// CRC-64/ECMA in canonical (ascending hash) order. Two converged
    /// replicas agree on this value no matter what order records arrived
    /// in; it is only meaningful at quiescence.
    pub fn crc64(&self) -> Result<u64> {
        let rows = self.inner.meta.lock().digest_rows()?;
        let mut digest = CRC64.digest();
        for (hash, goff) in rows {
            let (lo, hi) = self.inner.graph.weight(goff)?;
            digest.update(&hash);
            digest.update(&lo.to_le_bytes());
            digest.update(&hi.to_le_bytes());
        }
        Ok(digest.finalize())
    }

    /// True while any fully linked record still awaits weight
    /// application. False means every admitted record's score is
    /// reflected in every reachable ancestor.
    pub fn has_pending(&self) -> Result<bool> {
        self.inner.meta.lock().has_pending()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the propagation worker, flushes both mapped files, and
    /// checkpoints the metadata WAL.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.inner.data.flush()?;
        self.inner.graph.flush()?;
        self.inner.meta.lock().checkpoint()?;
        info!(path = %self.path.display(), "record store closed");
        Ok(())
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            debug!(%err, "error while closing record store");
        }
    }
}
