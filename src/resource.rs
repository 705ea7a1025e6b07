// SPDX-License-Identifier: MPL-2.0

//! Queue resource manager (component C2, spec.md §4.2).
//!
//! One process-wide allocator that partitions the queue-ID space of each
//! physical device into non-overlapping ranges handed out to functions
//! (the PF and its VFs), with best-fit placement, coalescing of freed
//! ranges, and live active-queue accounting. Mirrors the
//! `aster_nvme::device::mod::NvmeDeviceError` habit of one small error
//! enum per subsystem, folded into [`crate::error::QdmaError`] at calls
//! that cross the crate boundary.

use std::sync::Mutex;

use crate::error::{QdmaError, QdmaResult};

/// The three counters tracked per function (spec.md §3 "Function entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    H2c,
    C2h,
    Cmpt,
}

const KIND_COUNT: usize = 3;

fn kind_index(kind: QueueKind) -> usize {
    match kind {
        QueueKind::H2c => 0,
        QueueKind::C2h => 1,
        QueueKind::Cmpt => 2,
    }
}

/// `{qbase, total_q}` — a half-open range `[qbase, qbase+total_q)`.
/// `qbase = -1, total_q = 0` is the sentinel "unassigned" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub qbase: i64,
    pub total_q: u32,
}

impl Range {
    pub const UNASSIGNED: Range = Range {
        qbase: -1,
        total_q: 0,
    };

    pub fn end(&self) -> i64 {
        self.qbase + self.total_q as i64
    }

    pub fn is_empty(&self) -> bool {
        self.total_q == 0
    }

    fn contains_range(&self, qbase: i64, total_q: u32) -> bool {
        qbase >= self.qbase && qbase + total_q as i64 <= self.end()
    }
}

/// Per-function record (spec.md §3 "Function entry").
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    func_id: u16,
    assigned: Range,
    active: [u32; KIND_COUNT],
}

impl FunctionEntry {
    fn new(func_id: u16) -> Self {
        Self {
            func_id,
            assigned: Range::UNASSIGNED,
            active: [0; KIND_COUNT],
        }
    }

    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    pub fn assigned(&self) -> Range {
        self.assigned
    }

    pub fn active_count(&self, kind: QueueKind) -> u32 {
        self.active[kind_index(kind)]
    }

    fn active_total(&self) -> u32 {
        self.active.iter().sum()
    }

    fn is_locked(&self) -> bool {
        self.active_total() != 0
    }
}

/// Per-physical-device record (spec.md §3 "Master resource").
#[derive(Debug, Clone)]
pub struct MasterResource {
    device_index: u32,
    pci_bus_range: (u32, u32),
    base: i64,
    total_q: u32,
    /// Sorted by `qbase`, never empty entries, never two adjacent (I-R2).
    free_list: Vec<Range>,
    functions: Vec<FunctionEntry>,
    active_qcnt: u32,
}

impl MasterResource {
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn pci_bus_range(&self) -> (u32, u32) {
        self.pci_bus_range
    }

    pub fn free_list(&self) -> &[Range] {
        &self.free_list
    }

    pub fn active_qcnt(&self) -> u32 {
        self.active_qcnt
    }

    fn function_mut(&mut self, func_id: u16) -> QdmaResult<&mut FunctionEntry> {
        self.functions
            .iter_mut()
            .find(|f| f.func_id == func_id)
            .ok_or(QdmaError::NoFunction)
    }

    fn function(&self, func_id: u16) -> QdmaResult<&FunctionEntry> {
        self.functions
            .iter()
            .find(|f| f.func_id == func_id)
            .ok_or(QdmaError::NoFunction)
    }
}

/// Inserts `range` into `free_list`, keeping it sorted by `qbase`, and
/// coalesces it with a neighbor that shares a boundary (spec.md §4.2
/// "Coalescing").
fn insert_coalesced(free_list: &mut Vec<Range>, range: Range) {
    if range.is_empty() {
        return;
    }
    let pos = free_list.partition_point(|r| r.qbase < range.qbase);
    free_list.insert(pos, range);

    if pos + 1 < free_list.len() && free_list[pos].end() == free_list[pos + 1].qbase {
        free_list[pos].total_q += free_list[pos + 1].total_q;
        free_list.remove(pos + 1);
    }
    if pos > 0 && free_list[pos - 1].end() == free_list[pos].qbase {
        free_list[pos - 1].total_q += free_list[pos].total_q;
        free_list.remove(pos);
    }
}

/// Best-fit placement (spec.md §4.2 "Best-fit allocation"). Carves `qmax`
/// queues out of `free_list`, preferring the range containing `hint` if
/// one is given and fully contains the request, otherwise the smallest
/// range that is still `>= qmax` (ties broken by earliest `qbase`).
/// Returns the awarded `qbase`.
fn allocate_best_fit(free_list: &mut Vec<Range>, qmax: u32, hint: Option<i64>) -> QdmaResult<i64> {
    if qmax == 0 {
        return Err(QdmaError::InvalidParameter);
    }

    let hinted = hint.and_then(|h| {
        free_list
            .iter()
            .position(|r| r.contains_range(h, qmax))
            .map(|idx| (idx, h))
    });

    let (idx, qbase) = match hinted {
        Some(found) => found,
        None => {
            let mut best: Option<(usize, u32)> = None;
            for (i, r) in free_list.iter().enumerate() {
                if r.total_q < qmax {
                    continue;
                }
                match best {
                    Some((_, best_total)) if r.total_q >= best_total => {}
                    _ => best = Some((i, r.total_q)),
                }
            }
            match best {
                Some((i, _)) => (i, free_list[i].qbase),
                None => return Err(QdmaError::NoQueuesLeft),
            }
        }
    };

    let node = free_list[idx];
    let left = Range {
        qbase: node.qbase,
        total_q: (qbase - node.qbase) as u32,
    };
    let right_base = qbase + qmax as i64;
    let right = Range {
        qbase: right_base,
        total_q: (node.end() - right_base) as u32,
    };

    free_list.remove(idx);
    if !right.is_empty() {
        free_list.insert(idx, right);
    }
    if !left.is_empty() {
        free_list.insert(idx, left);
    }

    Ok(qbase)
}

#[derive(Default)]
struct Registry {
    masters: Vec<MasterResource>,
    next_device_index: u32,
}

/// The process-wide queue resource manager. Guarded by a single mutex
/// (spec.md §5 "One process-wide mutex guards the resource manager").
#[derive(Default)]
pub struct ResourceManager {
    inner: Mutex<Registry>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Returns the process-wide instance. A plain [`ResourceManager::new`]
    /// value is just as usable; this exists for callers (like the mailbox
    /// PF-side handlers) that don't have one threaded through explicitly.
    pub fn global() -> &'static ResourceManager {
        static INSTANCE: std::sync::OnceLock<ResourceManager> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(ResourceManager::new)
    }

    pub fn create_master(
        &self,
        bus_start: u32,
        bus_end: u32,
        base: i64,
        total_q: u32,
    ) -> QdmaResult<u32> {
        let mut reg = self.inner.lock().unwrap();
        if let Some(existing) = reg
            .masters
            .iter()
            .find(|m| m.pci_bus_range == (bus_start, bus_end))
        {
            return Err(QdmaError::ResourceExists(existing.device_index));
        }
        let device_index = reg.next_device_index;
        reg.next_device_index += 1;
        reg.masters.push(MasterResource {
            device_index,
            pci_bus_range: (bus_start, bus_end),
            base,
            total_q,
            free_list: vec![Range { qbase: base, total_q }],
            functions: Vec::new(),
            active_qcnt: 0,
        });
        Ok(device_index)
    }

    pub fn destroy_master(&self, device_index: u32) -> QdmaResult<()> {
        let mut reg = self.inner.lock().unwrap();
        let idx = reg
            .masters
            .iter()
            .position(|m| m.device_index == device_index)
            .ok_or(QdmaError::NoDevice)?;
        if !reg.masters[idx].functions.is_empty() {
            // No-op per spec: a master with live function entries is left alone.
            return Ok(());
        }
        reg.masters[idx].free_list.clear();
        reg.masters.remove(idx);
        Ok(())
    }

    fn with_master<R>(
        &self,
        device_index: u32,
        f: impl FnOnce(&mut MasterResource) -> QdmaResult<R>,
    ) -> QdmaResult<R> {
        let mut reg = self.inner.lock().unwrap();
        let master = reg
            .masters
            .iter_mut()
            .find(|m| m.device_index == device_index)
            .ok_or(QdmaError::NoDevice)?;
        f(master)
    }

    pub fn create_function(&self, device_index: u32, func_id: u16) -> QdmaResult<()> {
        self.with_master(device_index, |master| {
            if master.functions.iter().any(|f| f.func_id == func_id) {
                return Err(QdmaError::FunctionExists);
            }
            master.functions.push(FunctionEntry::new(func_id));
            Ok(())
        })
    }

    pub fn destroy_function(&self, device_index: u32, func_id: u16) -> QdmaResult<()> {
        self.with_master(device_index, |master| {
            let idx = master
                .functions
                .iter()
                .position(|f| f.func_id == func_id)
                .ok_or(QdmaError::NoFunction)?;
            let assigned = master.functions[idx].assigned;
            insert_coalesced(&mut master.free_list, assigned);
            master.functions.remove(idx);
            Ok(())
        })
    }

    /// Reconfigures a function's queue count, optionally hinting a
    /// preferred `qbase` (`None` means "anywhere"). On success, returns
    /// the awarded `qbase`.
    pub fn update_function(
        &self,
        device_index: u32,
        func_id: u16,
        new_qmax: u32,
        qbase_hint: Option<i64>,
    ) -> QdmaResult<i64> {
        self.with_master(device_index, |master| {
            let func_idx = master
                .functions
                .iter()
                .position(|f| f.func_id == func_id)
                .ok_or(QdmaError::NoFunction)?;

            if master.functions[func_idx].is_locked() {
                return Err(QdmaError::QmaxConfRejected);
            }

            let prior = master.functions[func_idx].assigned;
            if !prior.is_empty() {
                insert_coalesced(&mut master.free_list, prior);
            }

            match allocate_best_fit(&mut master.free_list, new_qmax, qbase_hint) {
                Ok(qbase) => {
                    master.functions[func_idx].assigned = Range {
                        qbase,
                        total_q: new_qmax,
                    };
                    Ok(qbase)
                }
                Err(e) => {
                    // Restore the prior allocation by re-carving exactly the
                    // range we just returned to the free list (P-R4).
                    if !prior.is_empty() {
                        let restored =
                            allocate_best_fit(&mut master.free_list, prior.total_q, Some(prior.qbase))
                                .expect("the range we just inserted must still be obtainable");
                        debug_assert_eq!(restored, prior.qbase);
                    } else {
                        master.functions[func_idx].assigned = Range::UNASSIGNED;
                    }
                    Err(e)
                }
            }
        })
    }

    pub fn queue_in_range(&self, device_index: u32, func_id: u16, qid_hw: i64) -> QdmaResult<bool> {
        self.with_master(device_index, |master| {
            let func = master.function(func_id)?;
            let a = func.assigned;
            Ok(qid_hw >= a.qbase && qid_hw < a.end())
        })
    }

    pub fn increment_active(&self, device_index: u32, func_id: u16, kind: QueueKind) -> QdmaResult<()> {
        self.with_master(device_index, |master| {
            let func = master.function_mut(func_id)?;
            if func.active_total() + 1 > func.assigned.total_q {
                return Err(QdmaError::NoQueuesLeft);
            }
            func.active[kind_index(kind)] += 1;
            master.active_qcnt += 1;
            Ok(())
        })
    }

    pub fn decrement_active(&self, device_index: u32, func_id: u16, kind: QueueKind) -> QdmaResult<()> {
        self.with_master(device_index, |master| {
            let func = master.function_mut(func_id)?;
            let slot = &mut func.active[kind_index(kind)];
            *slot = slot.saturating_sub(1);
            master.active_qcnt = master.active_qcnt.saturating_sub(1);
            Ok(())
        })
    }

    pub fn get_active_count(&self, device_index: u32) -> QdmaResult<u32> {
        self.with_master(device_index, |master| Ok(master.active_qcnt))
    }

    pub fn get_function_active_count(
        &self,
        device_index: u32,
        func_id: u16,
        kind: QueueKind,
    ) -> QdmaResult<u32> {
        self.with_master(device_index, |master| {
            Ok(master.function(func_id)?.active_count(kind))
        })
    }

    /// Snapshots a master's free list, for tests and introspection.
    pub fn free_list_snapshot(&self, device_index: u32) -> QdmaResult<Vec<Range>> {
        self.with_master(device_index, |master| Ok(master.free_list.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_allocation_and_coalescing() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(0x10, 0x10, 0, 256).unwrap();

        rm.create_function(dev, 0).unwrap();
        let qbase0 = rm.update_function(dev, 0, 64, Some(0)).unwrap();
        assert_eq!(qbase0, 0);

        rm.create_function(dev, 1).unwrap();
        let qbase1 = rm.update_function(dev, 1, 64, None).unwrap();
        assert_eq!(qbase1, 64);

        rm.destroy_function(dev, 0).unwrap();

        rm.create_function(dev, 2).unwrap();
        let qbase2 = rm.update_function(dev, 2, 128, None).unwrap();
        assert_eq!(qbase2, 128);

        assert_eq!(
            rm.free_list_snapshot(dev).unwrap(),
            vec![Range { qbase: 0, total_q: 64 }]
        );
    }

    #[test]
    fn scenario_2_hinted_allocation_with_split() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(0x20, 0x20, 0, 256).unwrap();
        rm.create_function(dev, 7).unwrap();

        let qbase = rm.update_function(dev, 7, 32, Some(100)).unwrap();
        assert_eq!(qbase, 100);

        assert_eq!(
            rm.free_list_snapshot(dev).unwrap(),
            vec![
                Range { qbase: 0, total_q: 100 },
                Range { qbase: 132, total_q: 124 },
            ]
        );
    }

    #[test]
    fn create_master_is_idempotent_on_bus_range() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(1, 1, 0, 16).unwrap();
        let err = rm.create_master(1, 1, 0, 16).unwrap_err();
        assert_eq!(err, QdmaError::ResourceExists(dev));
    }

    #[test]
    fn p_r1_free_list_and_assigned_tile_the_whole_range() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(2, 2, 0, 64).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.create_function(dev, 1).unwrap();
        rm.update_function(dev, 0, 20, None).unwrap();
        rm.update_function(dev, 1, 10, Some(30)).unwrap();
        rm.destroy_function(dev, 0).unwrap();
        rm.update_function(dev, 1, 5, None).unwrap();

        // Rebuild the tiling from whatever is left and check it covers
        // [0, 64) with no gap and no overlap. Only function 1 remains.
        let mut pieces = rm.free_list_snapshot(dev).unwrap();
        pieces.sort_by_key(|r| r.qbase);
        let mut cursor = 0i64;
        let mut covered = 0u32;
        for p in &pieces {
            assert!(p.qbase >= cursor);
            cursor = p.end();
            covered += p.total_q;
        }
        // Add back whatever is assigned (only func 1 here after destroying func 0).
        let assigned_total: u32 = 5;
        assert_eq!(covered + assigned_total, 64);
    }

    #[test]
    fn p_r2_no_two_free_ranges_are_adjacent() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(3, 3, 0, 100).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.create_function(dev, 1).unwrap();
        rm.update_function(dev, 0, 10, Some(0)).unwrap();
        rm.update_function(dev, 1, 10, Some(10)).unwrap();
        rm.destroy_function(dev, 0).unwrap();
        rm.destroy_function(dev, 1).unwrap();

        let free_list = rm.free_list_snapshot(dev).unwrap();
        assert_eq!(free_list, vec![Range { qbase: 0, total_q: 100 }]);
        for w in free_list.windows(2) {
            assert_ne!(w[0].end(), w[1].qbase);
        }
    }

    #[test]
    fn p_r3_increment_then_decrement_is_a_no_op() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(4, 4, 0, 16).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.update_function(dev, 0, 4, None).unwrap();

        let before = rm.get_active_count(dev).unwrap();
        rm.increment_active(dev, 0, QueueKind::H2c).unwrap();
        rm.decrement_active(dev, 0, QueueKind::H2c).unwrap();
        assert_eq!(rm.get_active_count(dev).unwrap(), before);
    }

    #[test]
    fn p_r4_failed_update_restores_prior_assignment() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(5, 5, 0, 32).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.create_function(dev, 1).unwrap();
        rm.update_function(dev, 0, 16, Some(0)).unwrap();
        rm.update_function(dev, 1, 16, Some(16)).unwrap();

        // Function 0 asks to grow past what's left; must fail and leave it
        // exactly where it was.
        let err = rm.update_function(dev, 0, 32, None).unwrap_err();
        assert_eq!(err, QdmaError::NoQueuesLeft);

        assert!(rm.queue_in_range(dev, 0, 0).unwrap());
        assert!(rm.queue_in_range(dev, 0, 15).unwrap());
        assert!(!rm.queue_in_range(dev, 0, 16).unwrap());
    }

    #[test]
    fn increment_active_is_bounded_by_assigned_total() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(6, 6, 0, 8).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.update_function(dev, 0, 2, None).unwrap();

        rm.increment_active(dev, 0, QueueKind::H2c).unwrap();
        rm.increment_active(dev, 0, QueueKind::C2h).unwrap();
        let err = rm.increment_active(dev, 0, QueueKind::Cmpt).unwrap_err();
        assert_eq!(err, QdmaError::NoQueuesLeft);
    }

    #[test]
    fn update_function_rejected_while_active() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(7, 7, 0, 8).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.update_function(dev, 0, 2, None).unwrap();
        rm.increment_active(dev, 0, QueueKind::H2c).unwrap();

        let err = rm.update_function(dev, 0, 4, None).unwrap_err();
        assert_eq!(err, QdmaError::QmaxConfRejected);
    }

    #[test]
    fn destroy_master_is_a_no_op_while_functions_remain() {
        let rm = ResourceManager::new();
        let dev = rm.create_master(8, 8, 0, 8).unwrap();
        rm.create_function(dev, 0).unwrap();
        rm.destroy_master(dev).unwrap();
        // Still present: a function entry keeps the master alive.
        assert!(rm.create_function(dev, 0).is_err());
    }
}
