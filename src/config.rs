// SPDX-License-Identifier: MPL-2.0

//! Per-queue configuration surface (spec.md §6 "External interfaces").
//!
//! These types are the shape of what a CLI/sysfs layer would hand the
//! core; that layer itself is out of scope (spec.md §1). Constructing a
//! [`QueueConfig`] validates it the same way register enums like
//! `nvme_regs.rs` centralize "the shape of configuration" even though
//! the transport that carries it lives elsewhere.

use crate::error::{QdmaError, QdmaResult};

/// DMA direction, reused as the "kind" tag for active-queue accounting
/// (spec.md §3 "Function entry" active counters) and for queue config.
pub use crate::resource::QueueKind as Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Memory-mapped: descriptors carry explicit src/dst addresses.
    Mm,
    /// Streaming: descriptors carry payload length, not a destination
    /// address; C2H streaming queues have a companion CMPT ring.
    St,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Disable,
    Any,
    Counter,
    User,
    Timer,
    Combo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescSize {
    B8,
    B16,
    B32,
    B64,
}

/// Device families with extra restrictions (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Generic,
    VersalHardIp,
}

/// One entry of the global ring-size table, indexed `[0, 15]` by
/// `desc_rng_sz_idx` / `cmpl_rng_sz_idx`.
pub const RING_SIZES: [u32; 16] = [
    64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072, 2048, 4096, 8192, 16384,
];

/// One entry of the global C2H buffer-size table, indexed `[0, 15]` by
/// `c2h_buf_sz_idx`.
pub const BUFFER_SIZES: [u32; 16] = [
    4096, 8192, 16384, 32768, 65536, 2048, 1024, 512, 256, 128, 64, 32, 9018, 4096, 4096, 4096,
];

/// Default cap on a memory-mapped descriptor's `flag_len` field
/// (spec.md §4.3.3), `2^28 - 1`.
pub const MM_APERTURE_CAP: u32 = (1 << 28) - 1;

/// Default PIDX coalescing threshold (spec.md §6 `pidx_acc`).
pub const DEFAULT_PIDX_ACC: u16 = 8;

/// Default mailbox round-trip timeout (spec.md §4.5).
pub const MBOX_DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default pending-list drain timeout for `queue_stop` (spec.md §5).
pub const Q_PEND_LIST_COMPLETION_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// `None` means "any free index".
    pub qidx: Option<u16>,
    pub direction: Direction,
    pub mode: QueueMode,
    pub desc_rng_sz_idx: u8,
    pub cmpl_rng_sz_idx: u8,
    pub c2h_buf_sz_idx: u8,
    pub cmpl_trig_mode: TriggerMode,
    pub cmpl_desc_sz: DescSize,
    pub sw_desc_sz: DescSize,
    pub cmpl_timer_idx: u8,
    pub cmpl_cnt_th_idx: u8,
    pub cmpt_stat_en: bool,
    pub cmpt_en_intr: bool,
    pub cmpl_udd_en: bool,
    pub pfetch_en: bool,
    pub pfetch_bypass: bool,
    pub desc_bypass: bool,
    pub fetch_credit: bool,
    pub wb_status_en: bool,
    pub cmpl_status_acc_en: bool,
    pub cmpl_status_pend_chk: bool,
    pub cmpl_ovf_chk_dis: bool,
    pub adaptive_rx: bool,
    pub latency_optimize: bool,
    pub init_pidx_dis: bool,
    pub ping_pong_en: bool,
    /// 0 (disabled) or a power of two keyhole window size.
    pub aperture_size: u32,
    pub pidx_acc: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            qidx: None,
            direction: Direction::H2c,
            mode: QueueMode::Mm,
            desc_rng_sz_idx: 0,
            cmpl_rng_sz_idx: 0,
            c2h_buf_sz_idx: 0,
            cmpl_trig_mode: TriggerMode::Disable,
            cmpl_desc_sz: DescSize::B8,
            sw_desc_sz: DescSize::B8,
            cmpl_timer_idx: 0,
            cmpl_cnt_th_idx: 0,
            cmpt_stat_en: false,
            cmpt_en_intr: false,
            cmpl_udd_en: false,
            pfetch_en: false,
            pfetch_bypass: false,
            desc_bypass: false,
            fetch_credit: true,
            wb_status_en: true,
            cmpl_status_acc_en: false,
            cmpl_status_pend_chk: false,
            cmpl_ovf_chk_dis: false,
            adaptive_rx: false,
            latency_optimize: false,
            init_pidx_dis: false,
            ping_pong_en: false,
            aperture_size: 0,
            pidx_acc: DEFAULT_PIDX_ACC,
        }
    }
}

impl QueueConfig {
    /// Validates the static configuration (spec.md §6), independent of
    /// any other queue that might already exist at the same index — the
    /// index-coexistence rules live in `descq::compatible`.
    pub fn validate(&self, device_type: DeviceType) -> QdmaResult<()> {
        if self.direction == Direction::Cmpt && self.mode != QueueMode::Mm {
            return Err(QdmaError::InvalidParameter);
        }
        if self.desc_rng_sz_idx > 15 || self.cmpl_rng_sz_idx > 15 || self.c2h_buf_sz_idx > 15 {
            return Err(QdmaError::InvalidParameter);
        }
        if self.aperture_size != 0 && !self.aperture_size.is_power_of_two() {
            return Err(QdmaError::InvalidParameter);
        }
        if device_type == DeviceType::VersalHardIp {
            if self.cmpl_trig_mode == TriggerMode::Combo {
                return Err(QdmaError::FeatureNotSupported);
            }
            if self.cmpl_desc_sz == DescSize::B64 || self.sw_desc_sz == DescSize::B64 {
                return Err(QdmaError::FeatureNotSupported);
            }
        }
        Ok(())
    }

    pub fn ring_size(&self) -> u32 {
        RING_SIZES[self.desc_rng_sz_idx as usize]
    }

    pub fn cmpl_ring_size(&self) -> u32 {
        RING_SIZES[self.cmpl_rng_sz_idx as usize]
    }

    pub fn c2h_buf_size(&self) -> u32 {
        BUFFER_SIZES[self.c2h_buf_sz_idx as usize]
    }

    /// True if this config carries its own CMPT ring (streaming C2H always
    /// does; MM queues only if explicitly created as an independent CMPT).
    pub fn has_cmpt(&self) -> bool {
        matches!((self.direction, self.mode), (Direction::C2h, QueueMode::St))
            || self.direction == Direction::Cmpt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_aperture() {
        let cfg = QueueConfig {
            aperture_size: 100,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(DeviceType::Generic),
            Err(QdmaError::InvalidParameter)
        );
    }

    #[test]
    fn rejects_combo_trigger_on_versal_hard_ip() {
        let cfg = QueueConfig {
            cmpl_trig_mode: TriggerMode::Combo,
            ..Default::default()
        };
        assert!(cfg.validate(DeviceType::Generic).is_ok());
        assert_eq!(
            cfg.validate(DeviceType::VersalHardIp),
            Err(QdmaError::FeatureNotSupported)
        );
    }

    #[test]
    fn rejects_64b_descriptors_on_versal_hard_ip() {
        let cfg = QueueConfig {
            sw_desc_sz: DescSize::B64,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(DeviceType::VersalHardIp),
            Err(QdmaError::FeatureNotSupported)
        );
    }

    #[test]
    fn streaming_c2h_implies_companion_cmpt() {
        let cfg = QueueConfig {
            direction: Direction::C2h,
            mode: QueueMode::St,
            ..Default::default()
        };
        assert!(cfg.has_cmpt());
    }
}
