//! Relational metadata index over rusqlite.
//!
//! Holds everything about a record except its bytes and its graph node:
//! lookup columns, dangling-link bookkeeping, the wanted-hash set, hole
//! retry state, and the pending queue driving weight propagation. All
//! mutation happens under the store's metadata lock; this type assumes a
//! single writer.

use std::path::Path;
use std::time::{Duration, Instant};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::model::{node_stride, Doff, Goff, RecordHash, HASH_SIZE};

const SCHEMA_VERSION: u64 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS record (
    hash BLOB PRIMARY KEY NOT NULL,
    doff INTEGER NOT NULL,
    dlen INTEGER NOT NULL,
    goff INTEGER NOT NULL,
    linked_count INTEGER NOT NULL DEFAULT 0,
    link_count INTEGER NOT NULL,
    id BLOB NOT NULL,
    owner BLOB NOT NULL,
    ts INTEGER NOT NULL,
    ttl INTEGER NOT NULL,
    score INTEGER NOT NULL,
    sel0 BLOB,
    sel1 BLOB,
    change_owner BLOB
);
CREATE UNIQUE INDEX IF NOT EXISTS record_goff ON record(goff);
CREATE INDEX IF NOT EXISTS record_id ON record(id);
CREATE INDEX IF NOT EXISTS record_owner ON record(owner);
CREATE INDEX IF NOT EXISTS record_sel0 ON record(sel0) WHERE sel0 IS NOT NULL;
CREATE INDEX IF NOT EXISTS record_sel1 ON record(sel1) WHERE sel1 IS NOT NULL;
CREATE INDEX IF NOT EXISTS record_linked ON record(linked_count, goff);

CREATE TABLE IF NOT EXISTS dangling (
    hash_wanted BLOB NOT NULL,
    holder_goff INTEGER NOT NULL,
    link_slot INTEGER NOT NULL,
    PRIMARY KEY (hash_wanted, holder_goff, link_slot)
);
CREATE INDEX IF NOT EXISTS dangling_holder ON dangling(holder_goff);

CREATE TABLE IF NOT EXISTS wanted (
    hash BLOB PRIMARY KEY NOT NULL,
    first_seen_ts INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS hole (
    waiting_goff INTEGER NOT NULL,
    holder_goff INTEGER NOT NULL,
    link_slot INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (waiting_goff, holder_goff, link_slot)
);
CREATE INDEX IF NOT EXISTS hole_slot ON hole(holder_goff, link_slot);

CREATE TABLE IF NOT EXISTS pending (
    goff INTEGER PRIMARY KEY NOT NULL,
    hole_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS apply (
    waiting_goff INTEGER NOT NULL,
    ancestor_goff INTEGER NOT NULL,
    PRIMARY KEY (waiting_goff, ancestor_goff)
);

CREATE TABLE IF NOT EXISTS config (
    k TEXT PRIMARY KEY NOT NULL,
    v INTEGER NOT NULL
);
";

#[derive(Debug, Clone)]
pub(crate) struct RecordRow {
    pub hash: RecordHash,
    pub doff: Doff,
    pub dlen: u64,
    pub goff: Goff,
    pub link_count: u8,
    pub id: Vec<u8>,
    pub owner: Vec<u8>,
    pub ts: u64,
    pub ttl: u64,
    pub score: u32,
    pub sel0: Option<Vec<u8>>,
    pub sel1: Option<Vec<u8>>,
    pub change_owner: Option<Vec<u8>>,
}

/// Metadata of one record, addressed by its graph node.
#[derive(Debug, Clone)]
pub(crate) struct RecordInfo {
    pub hash: RecordHash,
    pub ts: u64,
    pub score: u32,
    pub owner: Vec<u8>,
    pub link_count: u8,
}

/// A dangling slot of a holder node, joined with its hole retry count.
#[derive(Debug, Clone)]
pub(crate) struct DanglingSlot {
    pub hash_wanted: RecordHash,
    pub link_slot: u32,
    pub retries: u32,
}

/// Row shape consumed by `get_matching`, before the weight is attached.
#[derive(Debug, Clone)]
pub(crate) struct MatchRow {
    pub doff: Doff,
    pub dlen: u64,
    pub goff: Goff,
    pub ts: u64,
    pub ttl: u64,
    pub owner: Vec<u8>,
    pub change_owner: Option<Vec<u8>>,
}

pub(crate) struct MetaStore {
    conn: Connection,
    last_checkpoint: Instant,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let meta = Self {
            conn,
            last_checkpoint: Instant::now(),
        };
        match meta.counter("schema_version")? {
            None => meta.set_counter("schema_version", SCHEMA_VERSION)?,
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(StoreError::Corruption(format!(
                    "unsupported metadata schema version {v}"
                )))
            }
        }
        Ok(meta)
    }

    // -- transactions -----------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&mut self) {
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            debug!(%err, "rollback failed (transaction may not be open)");
        }
    }

    // -- record -----------------------------------------------------------

    pub fn add_record(&self, row: &RecordRow) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO record (hash, doff, dlen, goff, linked_count, link_count, \
             id, owner, ts, ttl, score, sel0, sel1, change_owner) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        let result = stmt.execute(params![
            row.hash.as_slice(),
            row.doff as i64,
            row.dlen as i64,
            row.goff as i64,
            i64::from(row.link_count),
            row.id,
            row.owner,
            row.ts as i64,
            row.ttl as i64,
            i64::from(row.score),
            row.sel0,
            row.sel1,
            row.change_owner,
        ]);
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_by_hash(&self, hash: &RecordHash) -> Result<Option<(Doff, u64)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT doff, dlen FROM record WHERE hash = ?1")?;
        let row = stmt
            .query_row(params![hash.as_slice()], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
            })
            .optional()?;
        Ok(row)
    }

    pub fn get_goff_by_hash(&self, hash: &RecordHash) -> Result<Option<Goff>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT goff FROM record WHERE hash = ?1")?;
        let row = stmt
            .query_row(params![hash.as_slice()], |row| {
                Ok(row.get::<_, i64>(0)? as u64)
            })
            .optional()?;
        Ok(row)
    }

    pub fn record_info_by_goff(&self, goff: Goff) -> Result<Option<RecordInfo>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT hash, ts, score, owner, link_count FROM record WHERE goff = ?1",
        )?;
        let row = stmt
            .query_row(params![goff as i64], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u32,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)? as u8,
                ))
            })
            .optional()?;
        match row {
            Some((blob, ts, score, owner, link_count)) => Ok(Some(RecordInfo {
                hash: hash_from_blob(blob)?,
                ts,
                score,
                owner,
                link_count,
            })),
            None => Ok(None),
        }
    }

    /// Mirror of the graph node's in-degree counter, kept so candidate
    /// ranking can run in SQL.
    pub fn bump_linked_count(&self, goff: Goff) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE record SET linked_count = linked_count + 1 WHERE goff = ?1")?;
        stmt.execute(params![goff as i64])?;
        Ok(())
    }

    /// Hashes a freshly authored record should link to. Tips first (newest
    /// leading), then thinly linked records; records whose own link
    /// closure is still incomplete are skipped.
    pub fn link_candidates(&self, desired: usize) -> Result<Vec<RecordHash>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT hash FROM record \
             WHERE goff NOT IN (SELECT holder_goff FROM dangling) \
             ORDER BY (linked_count = 0) DESC, \
                      CASE WHEN linked_count = 0 THEN goff ELSE -linked_count END DESC, \
                      goff DESC \
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![desired as i64], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::with_capacity(desired);
        for row in rows {
            out.push(hash_from_blob(row?)?);
        }
        Ok(out)
    }

    // -- dangling / wanted / hole ----------------------------------------

    pub fn add_dangling(&self, hash: &RecordHash, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO dangling (hash_wanted, holder_goff, link_slot) \
             VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![hash.as_slice(), holder_goff as i64, i64::from(slot)])?;
        Ok(())
    }

    /// Every slot still waiting for `hash`, as `(holder_goff, link_slot)`.
    pub fn dangling_links(&self, hash: &RecordHash) -> Result<Vec<(Goff, u32)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT holder_goff, link_slot FROM dangling WHERE hash_wanted = ?1",
        )?;
        let rows = stmt.query_map(params![hash.as_slice()], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u32))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn delete_dangling(&self, hash: &RecordHash) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM dangling WHERE hash_wanted = ?1")?;
        stmt.execute(params![hash.as_slice()])?;
        Ok(())
    }

    pub fn delete_dangling_slot(&self, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM dangling WHERE holder_goff = ?1 AND link_slot = ?2")?;
        stmt.execute(params![holder_goff as i64, i64::from(slot)])?;
        Ok(())
    }

    /// Unresolved slots of one holder node, joined with the holder's own
    /// hole retry state.
    pub fn dangling_for_holder(&self, holder_goff: Goff) -> Result<Vec<DanglingSlot>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT d.hash_wanted, d.link_slot, COALESCE(h.retry_count, 0) \
             FROM dangling d \
             LEFT JOIN hole h ON h.waiting_goff = d.holder_goff \
                 AND h.holder_goff = d.holder_goff AND h.link_slot = d.link_slot \
             WHERE d.holder_goff = ?1 ORDER BY d.link_slot",
        )?;
        let rows = stmt.query_map(params![holder_goff as i64], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)? as u32,
                row.get::<_, i64>(2)? as u32,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (blob, link_slot, retries) = row?;
            out.push(DanglingSlot {
                hash_wanted: hash_from_blob(blob)?,
                link_slot,
                retries,
            });
        }
        Ok(out)
    }

    pub fn dangling_slots_for_holder(&self, holder_goff: Goff) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT link_slot FROM dangling WHERE holder_goff = ?1")?;
        let rows = stmt.query_map(params![holder_goff as i64], |row| {
            Ok(row.get::<_, i64>(0)? as u32)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn add_wanted(&self, hash: &RecordHash, now_ts: u64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO wanted (hash, first_seen_ts, retries) VALUES (?1, ?2, 0) \
             ON CONFLICT(hash) DO UPDATE SET retries = retries + 1",
        )?;
        stmt.execute(params![hash.as_slice(), now_ts as i64])?;
        Ok(())
    }

    pub fn delete_wanted(&self, hash: &RecordHash) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM wanted WHERE hash = ?1")?;
        stmt.execute(params![hash.as_slice()])?;
        Ok(())
    }

    pub fn wanted_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM wanted")?
            .query_row([], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Records that `waiting_goff`'s weight application is blocked on the
    /// unresolved slot `(holder_goff, link_slot)`. A record waiting on its
    /// own slot uses `waiting_goff == holder_goff`.
    pub fn add_hole(&self, waiting_goff: Goff, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO hole (waiting_goff, holder_goff, link_slot, retry_count) \
             VALUES (?1, ?2, ?3, 0)",
        )?;
        stmt.execute(params![
            waiting_goff as i64,
            holder_goff as i64,
            i64::from(slot)
        ])?;
        Ok(())
    }

    pub fn bump_hole_retry(&self, waiting_goff: Goff, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE hole SET retry_count = retry_count + 1 \
             WHERE waiting_goff = ?1 AND holder_goff = ?2 AND link_slot = ?3",
        )?;
        stmt.execute(params![
            waiting_goff as i64,
            holder_goff as i64,
            i64::from(slot)
        ])?;
        Ok(())
    }

    /// Every `(holder_goff, link_slot)` the record at `waiting_goff` is
    /// blocked on.
    pub fn holes_waiting(&self, waiting_goff: Goff) -> Result<Vec<(Goff, u32)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT holder_goff, link_slot FROM hole WHERE waiting_goff = ?1",
        )?;
        let rows = stmt.query_map(params![waiting_goff as i64], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u32))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn delete_holes_waiting(&self, waiting_goff: Goff) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM hole WHERE waiting_goff = ?1")?;
        stmt.execute(params![waiting_goff as i64])?;
        Ok(())
    }

    pub fn delete_hole_row(&self, waiting_goff: Goff, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "DELETE FROM hole \
             WHERE waiting_goff = ?1 AND holder_goff = ?2 AND link_slot = ?3",
        )?;
        stmt.execute(params![
            waiting_goff as i64,
            holder_goff as i64,
            i64::from(slot)
        ])?;
        Ok(())
    }

    /// When the slot `(holder_goff, link_slot)` resolves, every record
    /// blocked on it moves one step closer to application. Must run
    /// before [`delete_holes_at`].
    ///
    /// [`delete_holes_at`]: MetaStore::delete_holes_at
    pub fn decrement_pending_waiting_on(&self, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE pending SET hole_count = hole_count - 1 \
             WHERE hole_count > 0 AND goff IN \
                 (SELECT waiting_goff FROM hole WHERE holder_goff = ?1 AND link_slot = ?2)",
        )?;
        stmt.execute(params![holder_goff as i64, i64::from(slot)])?;
        Ok(())
    }

    pub fn delete_holes_at(&self, holder_goff: Goff, slot: u32) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM hole WHERE holder_goff = ?1 AND link_slot = ?2")?;
        stmt.execute(params![holder_goff as i64, i64::from(slot)])?;
        Ok(())
    }

    // -- pending ----------------------------------------------------------

    pub fn flag_weight_pending(&self, goff: Goff, hole_count: u64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO pending (goff, hole_count) VALUES (?1, ?2) \
             ON CONFLICT(goff) DO UPDATE SET hole_count = excluded.hole_count",
        )?;
        stmt.execute(params![goff as i64, hole_count as i64])?;
        Ok(())
    }

    /// Admission-ordered snapshot of `(goff, hole_count)` for the worker.
    pub fn pending_snapshot(&self) -> Result<Vec<(Goff, u64)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT goff, hole_count FROM pending ORDER BY goff ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn update_pending_hole_count(&self, goff: Goff, hole_count: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE pending SET hole_count = ?2 WHERE goff = ?1")?;
        stmt.execute(params![goff as i64, hole_count as i64])?;
        Ok(())
    }

    pub fn decrement_pending_holes(&self, goff: Goff) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE pending SET hole_count = hole_count - 1 \
             WHERE goff = ?1 AND hole_count > 0",
        )?;
        stmt.execute(params![goff as i64])?;
        Ok(())
    }

    /// Stages the verified closure of `waiting_goff` before any weight is
    /// written. The `(waiting, waiting)` row marks an application in
    /// progress; each ancestor row is deleted once its add has landed, so
    /// an interrupted application resumes with only the remainder.
    pub fn stage_apply(&self, waiting_goff: Goff, ancestors: &[Goff]) -> Result<()> {
        self.clear_staged_apply(waiting_goff)?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO apply (waiting_goff, ancestor_goff) VALUES (?1, ?2)",
        )?;
        stmt.execute(params![waiting_goff as i64, waiting_goff as i64])?;
        for &ancestor in ancestors {
            stmt.execute(params![waiting_goff as i64, ancestor as i64])?;
        }
        Ok(())
    }

    /// Ancestors of an in-progress application that have not yet received
    /// the score, or `None` when no application is staged for this record.
    pub fn staged_apply(&self, waiting_goff: Goff) -> Result<Option<Vec<Goff>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT ancestor_goff FROM apply WHERE waiting_goff = ?1")?;
        let rows = stmt.query_map(params![waiting_goff as i64], |row| {
            Ok(row.get::<_, i64>(0)? as u64)
        })?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().filter(|&a| a != waiting_goff).collect()))
    }

    pub fn delete_staged_apply(&self, waiting_goff: Goff, ancestor_goff: Goff) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "DELETE FROM apply WHERE waiting_goff = ?1 AND ancestor_goff = ?2",
        )?;
        stmt.execute(params![waiting_goff as i64, ancestor_goff as i64])?;
        Ok(())
    }

    pub fn clear_staged_apply(&self, waiting_goff: Goff) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM apply WHERE waiting_goff = ?1")?;
        stmt.execute(params![waiting_goff as i64])?;
        Ok(())
    }

    pub fn delete_completed_pending(&self, goff: Goff) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM pending WHERE goff = ?1")?;
        stmt.execute(params![goff as i64])?;
        Ok(())
    }

    /// True while any record with a complete link set still awaits weight
    /// application. Records with open holes are excluded: they cannot
    /// converge until the wanted records arrive.
    pub fn has_pending(&self) -> Result<bool> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM pending WHERE hole_count = 0)")?
            .query_row([], |row| row.get(0))?;
        Ok(n != 0)
    }

    /// Pending rows joined with their record's link count, for the
    /// torn-write pass at open.
    pub fn pending_heal_rows(&self) -> Result<Vec<(Goff, u8)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT p.goff, r.link_count FROM pending p \
             JOIN record r ON r.goff = p.goff ORDER BY p.goff ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u8))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // -- queries ----------------------------------------------------------

    pub fn matching(
        &self,
        id: Option<&[u8]>,
        owner: Option<&[u8]>,
        sel0: Option<&[u8]>,
        sel1: Option<&[u8]>,
    ) -> Result<Vec<MatchRow>> {
        let mut sql = String::from(
            "SELECT doff, dlen, goff, ts, ttl, owner, change_owner FROM record",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Vec<u8>> = Vec::new();
        for (clause, value) in [
            ("id = ?", id),
            ("owner = ?", owner),
            ("sel0 = ?", sel0),
            ("sel1 = ?", sel1),
        ] {
            if let Some(value) = value {
                clauses.push(clause);
                args.push(value.to_vec());
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY goff ASC");

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(MatchRow {
                doff: row.get::<_, i64>(0)? as u64,
                dlen: row.get::<_, i64>(1)? as u64,
                goff: row.get::<_, i64>(2)? as u64,
                ts: row.get::<_, i64>(3)? as u64,
                ttl: row.get::<_, i64>(4)? as u64,
                owner: row.get(5)?,
                change_owner: row.get(6)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// `(hash, goff)` pairs in ascending hash order — the canonical record
    /// enumeration used by the integrity digest, stable across replicas
    /// regardless of arrival order.
    pub fn digest_rows(&self) -> Result<Vec<(RecordHash, Goff)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT hash, goff FROM record ORDER BY hash ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (blob, goff) = row?;
            out.push((hash_from_blob(blob)?, goff));
        }
        Ok(out)
    }

    pub fn record_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM record")?
            .query_row([], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn data_size(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT COALESCE(MAX(doff + dlen), 0) FROM record")?
            .query_row([], |row| row.get(0))?;
        Ok(n as u64)
    }

    // -- cursors / config -------------------------------------------------

    pub fn set_counter(&self, key: &str, value: u64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO config (k, v) VALUES (?1, ?2) \
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        )?;
        stmt.execute(params![key, value as i64])?;
        Ok(())
    }

    pub fn counter(&self, key: &str) -> Result<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT v FROM config WHERE k = ?1")?;
        let row = stmt
            .query_row(params![key], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(row.map(|v| v as u64))
    }

    /// End of the last record's byte range, for cursor reconstruction.
    pub fn max_doff(&self) -> Result<Doff> {
        self.data_size()
    }

    /// End of the last graph node, for cursor reconstruction.
    pub fn max_goff(&self) -> Result<Goff> {
        let row = self
            .conn
            .prepare_cached("SELECT goff, link_count FROM record ORDER BY goff DESC LIMIT 1")?
            .query_row([], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as usize))
            })
            .optional()?;
        Ok(match row {
            Some((goff, link_count)) => goff + node_stride(link_count),
            None => 0,
        })
    }

    // -- maintenance ------------------------------------------------------

    pub fn maybe_checkpoint(&mut self, interval: Duration) -> Result<()> {
        if self.last_checkpoint.elapsed() < interval {
            return Ok(());
        }
        self.checkpoint()
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        self.last_checkpoint = Instant::now();
        debug!("metadata WAL checkpoint");
        Ok(())
    }
}

fn hash_from_blob(blob: Vec<u8>) -> Result<RecordHash> {
    <[u8; HASH_SIZE]>::try_from(blob.as_slice()).map_err(|_| {
        StoreError::Corruption(format!("stored hash has length {}", blob.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_meta(dir: &TempDir) -> MetaStore {
        MetaStore::open(&dir.path().join("index.db")).expect("open meta")
    }

    fn row(hash_byte: u8, goff: Goff) -> RecordRow {
        RecordRow {
            hash: [hash_byte; 32],
            doff: u64::from(hash_byte) * 100,
            dlen: 100,
            goff,
            link_count: 0,
            id: vec![1],
            owner: vec![2],
            ts: 1000,
            ttl: 60,
            score: 5,
            sel0: None,
            sel1: None,
            change_owner: None,
        }
    }

    #[test]
    fn add_record_rejects_duplicate_hash() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        meta.add_record(&row(1, 0)).expect("insert");
        let err = meta.add_record(&row(1, 19)).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));

        assert_eq!(meta.get_by_hash(&[1u8; 32]).expect("get"), Some((100, 100)));
        assert_eq!(meta.get_goff_by_hash(&[1u8; 32]).expect("get"), Some(0));
        assert_eq!(meta.get_by_hash(&[9u8; 32]).expect("get"), None);
    }

    #[test]
    fn dangling_and_wanted_lifecycle() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);
        let wanted = [7u8; 32];

        meta.add_dangling(&wanted, 0, 1).expect("dangling");
        meta.add_dangling(&wanted, 35, 0).expect("dangling");
        meta.add_hole(0, 0, 1).expect("hole");
        meta.add_wanted(&wanted, 123).expect("wanted");
        assert_eq!(meta.wanted_count().expect("count"), 1);

        let mut slots = meta.dangling_links(&wanted).expect("links");
        slots.sort_unstable();
        assert_eq!(slots, vec![(0, 1), (35, 0)]);

        let holder = meta.dangling_for_holder(0).expect("holder");
        assert_eq!(holder.len(), 1);
        assert_eq!(holder[0].hash_wanted, wanted);
        assert_eq!(holder[0].link_slot, 1);
        assert_eq!(holder[0].retries, 0);

        meta.bump_hole_retry(0, 0, 1).expect("retry");
        assert_eq!(meta.dangling_for_holder(0).expect("holder")[0].retries, 1);

        meta.delete_dangling(&wanted).expect("delete");
        meta.delete_wanted(&wanted).expect("delete");
        assert!(meta.dangling_links(&wanted).expect("links").is_empty());
        assert_eq!(meta.wanted_count().expect("count"), 0);
    }

    #[test]
    fn pending_lifecycle_and_quiescence() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        meta.flag_weight_pending(0, 2).expect("flag");
        meta.flag_weight_pending(35, 0).expect("flag");
        assert_eq!(meta.pending_snapshot().expect("snap"), vec![(0, 2), (35, 0)]);
        assert!(meta.has_pending().expect("pending"));

        meta.delete_completed_pending(35).expect("done");
        // The remaining row still has open holes, so the store is not
        // reporting convergeable work.
        assert!(!meta.has_pending().expect("pending"));

        meta.decrement_pending_holes(0).expect("dec");
        meta.decrement_pending_holes(0).expect("dec");
        meta.decrement_pending_holes(0).expect("dec floor");
        assert_eq!(meta.pending_snapshot().expect("snap"), vec![(0, 0)]);
        assert!(meta.has_pending().expect("pending"));
    }

    #[test]
    fn filling_a_slot_unblocks_every_waiter() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        // Node 35 has an open slot; both 35 itself and a descendant at
        // goff 70 are blocked on it.
        meta.flag_weight_pending(35, 1).expect("flag");
        meta.flag_weight_pending(70, 1).expect("flag");
        meta.add_hole(35, 35, 0).expect("own hole");
        meta.add_hole(70, 35, 0).expect("frontier hole");
        assert_eq!(meta.holes_waiting(70).expect("holes"), vec![(35, 0)]);

        meta.decrement_pending_waiting_on(35, 0).expect("unblock");
        meta.delete_holes_at(35, 0).expect("clear");

        assert_eq!(
            meta.pending_snapshot().expect("snap"),
            vec![(35, 0), (70, 0)]
        );
        assert!(meta.holes_waiting(35).expect("holes").is_empty());
        assert!(meta.holes_waiting(70).expect("holes").is_empty());
    }

    #[test]
    fn staged_apply_tracks_unconfirmed_ancestors() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        assert_eq!(meta.staged_apply(100).expect("staged"), None);

        meta.stage_apply(100, &[0, 35]).expect("stage");
        let mut remaining = meta.staged_apply(100).expect("staged").expect("in progress");
        remaining.sort_unstable();
        assert_eq!(remaining, vec![0, 35]);

        meta.delete_staged_apply(100, 0).expect("confirm");
        assert_eq!(meta.staged_apply(100).expect("staged"), Some(vec![35]));

        // The marker row keeps the application visible even after every
        // ancestor is confirmed.
        meta.delete_staged_apply(100, 35).expect("confirm");
        assert_eq!(meta.staged_apply(100).expect("staged"), Some(vec![]));

        meta.clear_staged_apply(100).expect("retire");
        assert_eq!(meta.staged_apply(100).expect("staged"), None);
    }

    #[test]
    fn link_candidates_prefer_fresh_tips() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        meta.add_record(&row(1, 0)).expect("insert");
        meta.add_record(&row(2, 19)).expect("insert");
        meta.add_record(&row(3, 38)).expect("insert");
        // Record 1 is linked-to twice, record 2 once, record 3 is a tip.
        meta.bump_linked_count(0).expect("bump");
        meta.bump_linked_count(0).expect("bump");
        meta.bump_linked_count(19).expect("bump");

        let candidates = meta.link_candidates(3).expect("candidates");
        assert_eq!(candidates[0], [3u8; 32]);
        assert_eq!(candidates[1], [2u8; 32]);
        assert_eq!(candidates[2], [1u8; 32]);
    }

    #[test]
    fn link_candidates_skip_incomplete_records() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        meta.add_record(&row(1, 0)).expect("insert");
        meta.add_record(&row(2, 19)).expect("insert");
        meta.add_dangling(&[9u8; 32], 19, 0).expect("dangling");

        let candidates = meta.link_candidates(10).expect("candidates");
        assert_eq!(candidates, vec![[1u8; 32]]);
    }

    #[test]
    fn matching_filters_compose() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);

        let mut a = row(1, 0);
        a.owner = vec![10];
        a.sel0 = Some(vec![100]);
        let mut b = row(2, 19);
        b.owner = vec![10];
        let mut c = row(3, 38);
        c.owner = vec![20];
        for r in [&a, &b, &c] {
            meta.add_record(r).expect("insert");
        }

        assert_eq!(meta.matching(None, None, None, None).expect("all").len(), 3);
        let owned = meta.matching(None, Some(&[10]), None, None).expect("owner");
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].goff, 0);
        assert_eq!(owned[1].goff, 19);
        let selected = meta
            .matching(None, Some(&[10]), Some(&[100]), None)
            .expect("owner+sel0");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].goff, 0);
    }

    #[test]
    fn cursors_reconstruct_from_rows() {
        let dir = TempDir::new().expect("temp dir");
        let meta = open_meta(&dir);
        assert_eq!(meta.max_doff().expect("doff"), 0);
        assert_eq!(meta.max_goff().expect("goff"), 0);

        let mut r = row(1, 0);
        r.link_count = 2;
        meta.add_record(&r).expect("insert");
        assert_eq!(meta.max_doff().expect("doff"), 200);
        assert_eq!(meta.max_goff().expect("goff"), node_stride(2));
    }
}
