// SPDX-License-Identifier: MPL-2.0

//! Streaming H2C request processing and C2H completion processing
//! (spec.md §4.3.4, §4.3.5).

use super::request::Cb;

/// A page is chunked into descriptors no larger than this (spec.md §4.3.4).
pub const PAGE_SIZE: u32 = 4096;

/// One streaming descriptor (spec.md §4.3.4).
#[derive(Debug, Clone, Copy)]
pub struct StDescriptor {
    pub src_addr: u64,
    pub len: u32,
    pub payload_len: u32,
    pub sop: bool,
    pub eop: bool,
}

/// Emits the next streaming H2C descriptor for `cb`. `timestamp`, if
/// `ping_pong_en` is set, is latched on the request's first descriptor for
/// the C2H side to recover (spec.md §4.3.4).
pub(crate) fn next_st_h2c_descriptor(cb: &mut Cb, ping_pong_en: bool, timestamp: u32) -> StDescriptor {
    let entry = cb.sg[cb.sg_cursor];
    let remaining_in_entry = entry.len - cb.sg_offset;
    let cap = if cb.ep_addr != 0 {
        (cb.ep_addr as u32).min(PAGE_SIZE)
    } else {
        PAGE_SIZE
    };
    let len = remaining_in_entry.min(cap);
    let src_addr = entry.addr + cb.sg_offset as u64;

    let sop = !cb.sop_emitted;
    if sop && ping_pong_en {
        cb.timestamp = Some(timestamp);
    }
    cb.sop_emitted = true;

    cb.sg_offset += len;
    cb.offset += len;
    cb.desc_nr += 1;
    if cb.sg_offset == entry.len {
        cb.sg_cursor += 1;
        cb.sg_offset = 0;
    }
    let eop = cb.offset == cb.total_len;

    StDescriptor {
        src_addr,
        len,
        payload_len: len,
        sop,
        eop,
    }
}

/// Accumulates ping-pong round-trip latency samples (spec.md §4.3.4).
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyStats {
    pub min: u32,
    pub max: u32,
    pub total: u64,
    pub count: u64,
}

impl LatencyStats {
    pub fn record(&mut self, sample: u32) {
        self.min = if self.count == 0 { sample } else { self.min.min(sample) };
        self.max = self.max.max(sample);
        self.total += sample as u64;
        self.count += 1;
    }
}

/// One completion-ring entry (spec.md §4.3.5). The 32 bytes of
/// user-defined data are opaque to this crate's accounting.
#[derive(Debug, Clone, Copy)]
pub struct CmptEntry {
    pub format: u8,
    pub color: bool,
    pub err: bool,
    pub desc_used: bool,
    pub length: u32,
}

impl CmptEntry {
    pub fn data(color: bool, length: u32) -> Self {
        Self {
            format: 0,
            color,
            err: false,
            desc_used: true,
            length,
        }
    }
}

/// Adaptive CMPT counter-threshold selection with hysteresis (spec.md
/// §4.3.5 step 5, codified per spec.md §9's open question: the counter
/// never drops below `budget - 2` nor rises above half the ring size).
#[derive(Debug, Clone)]
pub struct AdaptiveThreshold {
    thresholds: Vec<u16>,
    idx: usize,
    moving_avg: f64,
    stagnant_low_samples: u32,
}

const EWMA_ALPHA: f64 = 0.25;
const STAGNANT_DECREMENT_THRESHOLD: u32 = 16;

impl AdaptiveThreshold {
    pub fn new(thresholds: Vec<u16>, initial_idx: usize) -> Self {
        assert!(!thresholds.is_empty());
        let idx = initial_idx.min(thresholds.len() - 1);
        Self {
            thresholds,
            idx,
            moving_avg: 0.0,
            stagnant_low_samples: 0,
        }
    }

    pub fn current(&self) -> u16 {
        self.thresholds[self.idx]
    }

    /// Feeds one sample of the pending-packet count, sized against
    /// `budget` and `rngsz` per the codified bounds.
    pub fn sample(&mut self, pending: u32, budget: u32, rngsz: u32) {
        self.moving_avg = self.moving_avg * (1.0 - EWMA_ALPHA) + pending as f64 * EWMA_ALPHA;

        let floor = budget.saturating_sub(2);
        let ceiling = rngsz / 2;
        let hi_band = self.current() as f64 * 1.5;
        let lo_band = self.current() as f64 * 0.5;

        if self.moving_avg > hi_band {
            if self.idx + 1 < self.thresholds.len() && self.thresholds[self.idx + 1] as u32 <= ceiling {
                self.idx += 1;
            }
            self.stagnant_low_samples = 0;
        } else if self.moving_avg < lo_band {
            self.stagnant_low_samples += 1;
            if self.stagnant_low_samples >= STAGNANT_DECREMENT_THRESHOLD
                && self.idx > 0
                && self.thresholds[self.idx - 1] as u32 >= floor
            {
                self.idx -= 1;
                self.stagnant_low_samples = 0;
            }
        } else {
            self.stagnant_low_samples = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descq::request::ScatterEntry;

    #[test]
    fn streaming_h2c_chunks_at_page_size() {
        let sg = vec![ScatterEntry { addr: 0x1000, len: 9000 }];
        let mut cb = Cb::new(sg, 0);
        let mut descs = Vec::new();
        while cb.left() > 0 {
            descs.push(next_st_h2c_descriptor(&mut cb, false, 0));
        }
        assert_eq!(descs.len(), 3);
        assert_eq!(descs[0].len, 4096);
        assert_eq!(descs[1].len, 4096);
        assert_eq!(descs[2].len, 808);
        assert!(descs[0].sop && descs[2].eop);
    }

    #[test]
    fn nonzero_ep_addr_overrides_the_page_size_chunk_cap() {
        let sg = vec![ScatterEntry { addr: 0x1000, len: 5000 }];
        let mut cb = Cb::new(sg, 1024);
        let mut descs = Vec::new();
        while cb.left() > 0 {
            descs.push(next_st_h2c_descriptor(&mut cb, false, 0));
        }
        assert_eq!(descs.len(), 5);
        assert_eq!(descs[0].len, 1024);
        assert_eq!(descs[3].len, 1024);
        assert_eq!(descs[4].len, 904);
    }

    #[test]
    fn ep_addr_larger_than_page_size_is_still_capped() {
        let sg = vec![ScatterEntry { addr: 0x1000, len: 9000 }];
        let mut cb = Cb::new(sg, 1 << 20);
        let desc = next_st_h2c_descriptor(&mut cb, false, 0);
        assert_eq!(desc.len, PAGE_SIZE);
    }

    #[test]
    fn ping_pong_latches_timestamp_on_first_descriptor_only() {
        let sg = vec![ScatterEntry { addr: 0x1000, len: 8192 }];
        let mut cb = Cb::new(sg, 0);
        next_st_h2c_descriptor(&mut cb, true, 42);
        assert_eq!(cb.timestamp, Some(42));
        cb.timestamp = None;
        next_st_h2c_descriptor(&mut cb, true, 99);
        assert_eq!(cb.timestamp, None);
    }

    #[test]
    fn latency_stats_track_min_max_total() {
        let mut stats = LatencyStats::default();
        stats.record(10);
        stats.record(30);
        stats.record(20);
        assert_eq!(stats.min, 10);
        assert_eq!(stats.max, 30);
        assert_eq!(stats.total, 60);
        assert_eq!(stats.count, 3);
    }

    #[test]
    fn adaptive_threshold_never_drops_below_floor() {
        let mut adaptive = AdaptiveThreshold::new(vec![2, 4, 8, 16], 1);
        for _ in 0..200 {
            adaptive.sample(0, 6, 64);
        }
        assert!(adaptive.current() as u32 >= 4u32.saturating_sub(2));
    }

    #[test]
    fn adaptive_threshold_never_exceeds_half_ring() {
        let mut adaptive = AdaptiveThreshold::new(vec![2, 4, 8, 16, 64], 0);
        for _ in 0..200 {
            adaptive.sample(1000, 8, 64);
        }
        assert!(adaptive.current() as u32 <= 32);
    }
}
