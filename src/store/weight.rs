//! Background weight propagation.
//!
//! One worker thread per store. Each pass snapshots the pending queue in
//! ascending `goff` order — admission order, so a record arriving out of
//! order is applied after its own link closure — and tries to apply each
//! record's score to every transitively reachable ancestor.
//!
//! Application is all-or-nothing: the worker first walks the closure
//! without side effects, and only if no `-1` slot was encountered anywhere
//! does it add the score to the collected ancestors. A closure that is
//! still holed (the record's own slots or an ancestor's) gets its blocking
//! slots recorded in the hole table, keyed by this waiting record; the
//! record then sleeps in `pending` until an insertion fills one of those
//! slots and decrements its hole count. This is what makes weights
//! insertion-order independent: a score always reaches the entire closure
//! exactly once, no matter how late the missing records arrive.
//!
//! The verified closure is staged in the `apply` table before the first
//! weight is written and each ancestor's staged row is deleted as its add
//! lands. An application that errors partway leaves the unconfirmed
//! remainder staged; the next pass (or the next open) resumes from that
//! remainder instead of re-walking, so no ancestor receives the score
//! twice.
//!
//! A clean walk cannot be invalidated concurrently: slot arrays only ever
//! change by filling a `-1`, so a closure observed hole-free is frozen.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, trace, warn};

use crate::error::{Result, StoreError};
use crate::model::{Goff, HOLE};

use super::StoreInner;

pub(crate) fn run(inner: Arc<StoreInner>) {
    debug!("weight propagation worker started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker_loop(&inner)));
    match outcome {
        Ok(()) => debug!("weight propagation worker stopped"),
        Err(_) => {
            // The store stays queryable but stops converging until it is
            // reopened.
            error!("weight propagation worker panicked");
        }
    }
}

fn worker_loop(inner: &StoreInner) {
    while inner.running.load(Ordering::Acquire) {
        let snapshot = match inner.meta.lock().pending_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "failed to snapshot pending records");
                thread::sleep(inner.config.worker_poll);
                continue;
            }
        };
        if snapshot.is_empty() {
            thread::sleep(inner.config.worker_poll);
            continue;
        }

        let mut progressed = false;
        for (goff, hole_count) in snapshot {
            if !inner.running.load(Ordering::Acquire) {
                return;
            }
            match apply_one(inner, goff, hole_count) {
                Ok(true) => progressed = true,
                Ok(false) => {}
                Err(err) => warn!(goff, %err, "weight application failed"),
            }
        }
        if !progressed {
            // Everything left is waiting on records that have not arrived.
            thread::sleep(inner.config.worker_poll);
        }
    }
}

/// Outcome of a side-effect-free closure walk.
enum Closure {
    /// Every reachable ancestor, each exactly once.
    Complete(Vec<Goff>),
    /// Slots (holder, slot) that stopped the walk.
    Blocked(Vec<(Goff, u32)>),
    /// Shutdown observed mid-walk.
    Interrupted,
}

/// Applies one pending record. `Ok(true)` means its score reached every
/// ancestor and the pending row was removed.
fn apply_one(inner: &StoreInner, goff: Goff, hole_count: u64) -> Result<bool> {
    let Some(info) = inner.meta.lock().record_info_by_goff(goff)? else {
        return Err(StoreError::Corruption(format!(
            "pending record at {goff} has no metadata row"
        )));
    };

    // An application staged by an earlier pass takes priority: its
    // closure was already verified complete and some ancestors may have
    // received the score, so re-walking would count them twice.
    if let Some(remaining) = inner.meta.lock().staged_apply(goff)? {
        trace!(goff, remaining = remaining.len(), "resuming staged application");
        apply_staged(inner, goff, info.score, &remaining)?;
        return Ok(true);
    }

    if hole_count > 0 {
        repair_own_holes(inner, goff)?;
        // Holes recorded on earlier passes may have been filled by an
        // insertion that raced our bookkeeping; drop the ones that no
        // longer exist before deciding to stay asleep.
        if sweep_resolved_holes(inner, goff)? > 0 {
            return Ok(false);
        }
        inner.meta.lock().update_pending_hole_count(goff, 0)?;
    }

    match collect_closure(inner, goff)? {
        Closure::Interrupted => Ok(false),
        Closure::Blocked(blocked) => {
            trace!(goff, blocked = blocked.len(), "closure still holed");
            let meta = inner.meta.lock();
            meta.delete_holes_waiting(goff)?;
            for &(holder, slot) in &blocked {
                meta.add_hole(goff, holder, slot)?;
            }
            meta.update_pending_hole_count(goff, blocked.len() as u64)?;
            Ok(false)
        }
        Closure::Complete(ancestors) => {
            {
                let mut meta = inner.meta.lock();
                meta.begin()?;
                match meta.stage_apply(goff, &ancestors) {
                    Ok(()) => meta.commit()?,
                    Err(err) => {
                        meta.rollback();
                        return Err(err);
                    }
                }
            }
            apply_staged(inner, goff, info.score, &ancestors)?;
            Ok(true)
        }
    }
}

/// Adds `score` to each remaining staged ancestor, confirming every add
/// by deleting its staged row, then retires the staging marker, hole
/// rows, and pending row together. A run interrupted partway leaves the
/// unconfirmed remainder staged, so the retry never repeats an add.
fn apply_staged(inner: &StoreInner, goff: Goff, score: u32, remaining: &[Goff]) -> Result<()> {
    for &node in remaining {
        inner.graph.add_weight(node, score)?;
        inner.meta.lock().delete_staged_apply(goff, node)?;
    }
    let mut meta = inner.meta.lock();
    meta.begin()?;
    let retired = (|| {
        meta.clear_staged_apply(goff)?;
        meta.delete_holes_waiting(goff)?;
        meta.delete_completed_pending(goff)
    })();
    match retired {
        Ok(()) => meta.commit()?,
        Err(err) => {
            meta.rollback();
            return Err(err);
        }
    }
    trace!(goff, ancestors = remaining.len(), "weight applied");
    Ok(())
}

/// Tries to resolve the record's own `-1` slots through the dangling
/// table. The insertion backfill normally does this the moment a wanted
/// record arrives; this pass catches slots a crash left behind. Lookups
/// stop after the retry limit to bound search cost.
fn repair_own_holes(inner: &StoreInner, goff: Goff) -> Result<()> {
    let slots = inner.meta.lock().dangling_for_holder(goff)?;
    for slot in &slots {
        if slot.retries >= inner.config.hole_retry_limit {
            continue;
        }
        let target = inner.meta.lock().get_goff_by_hash(&slot.hash_wanted)?;
        match target {
            Some(target) => {
                // A lost fill race means the insertion backfill got here
                // first and already bumped the in-degree.
                if inner.graph.set_link(goff, slot.link_slot, target)? {
                    inner.graph.bump_linked_count(target)?;
                    inner.meta.lock().bump_linked_count(target)?;
                }
                let meta = inner.meta.lock();
                meta.decrement_pending_waiting_on(goff, slot.link_slot)?;
                meta.delete_holes_at(goff, slot.link_slot)?;
                meta.delete_dangling_slot(goff, slot.link_slot)?;
            }
            None => {
                inner
                    .meta
                    .lock()
                    .bump_hole_retry(goff, goff, slot.link_slot)?;
            }
        }
    }
    Ok(())
}

/// Deletes hole rows of this record whose slot has since been filled,
/// decrementing its pending hole count for each. Returns the number of
/// genuinely unresolved holes left.
fn sweep_resolved_holes(inner: &StoreInner, goff: Goff) -> Result<u64> {
    let holes = inner.meta.lock().holes_waiting(goff)?;
    let mut remaining = 0u64;
    for (holder, slot) in holes {
        let slots = inner.graph.links(holder)?;
        let open = slots.get(slot as usize).copied().unwrap_or(HOLE) == HOLE;
        if open {
            remaining += 1;
        } else {
            let meta = inner.meta.lock();
            meta.delete_hole_row(goff, holder, slot)?;
            meta.decrement_pending_holes(goff)?;
        }
    }
    Ok(remaining)
}

/// Walks descendant-to-ancestor link arrows from the record's slots,
/// without side effects. The visited set both deduplicates shared
/// ancestors and breaks cycles a corrupt link array might introduce.
fn collect_closure(inner: &StoreInner, goff: Goff) -> Result<Closure> {
    let mut stack: Vec<Goff> = Vec::new();
    let mut visited: HashSet<Goff> = HashSet::new();
    let mut ancestors: Vec<Goff> = Vec::new();
    let mut blocked: Vec<(Goff, u32)> = Vec::new();

    let mut scan = |node: Goff, stack: &mut Vec<Goff>, blocked: &mut Vec<(Goff, u32)>| {
        let slots = inner.graph.links(node)?;
        for (i, &slot) in slots.iter().enumerate() {
            if slot == HOLE {
                blocked.push((node, i as u32));
            } else if slot < 0 {
                return Err(StoreError::Corruption(format!(
                    "node at {node}: slot {i} holds invalid offset {slot}"
                )));
            } else if visited.insert(slot as u64) {
                stack.push(slot as u64);
            }
        }
        Ok::<(), StoreError>(())
    };

    scan(goff, &mut stack, &mut blocked)?;
    while let Some(node) = stack.pop() {
        if !inner.running.load(Ordering::Acquire) {
            return Ok(Closure::Interrupted);
        }
        ancestors.push(node);
        scan(node, &mut stack, &mut blocked)?;
    }

    if blocked.is_empty() {
        Ok(Closure::Complete(ancestors))
    } else {
        Ok(Closure::Blocked(blocked))
    }
}
