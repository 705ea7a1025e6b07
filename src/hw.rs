// SPDX-License-Identifier: MPL-2.0

//! Interfaces to the out-of-scope hardware collaborators (spec.md §1).
//!
//! The register encoder/decoder for context tables, the PCIe enumeration
//! glue, and the interrupt-dump formatting are all named here as traits
//! and owned by whoever embeds this crate — their bit layouts are the
//! vendor's concern, mirroring `aster_nvme`'s `NvmePciTransport`
//! (`transport/pci/device.rs`), which exposes `read_reg32`/`write_reg32`
//! without this crate needing to know the NVMe register map.

use crate::descq::QueueContext;
use crate::error::{QdmaError, QdmaResult};

/// Programs and tears down a queue's hardware context. The actual
/// register/bit layout lives with the vendor; this crate only needs to
/// know *that* programming happens and *when*.
///
/// The read-back and interrupt-context/CSR methods default to
/// [`QdmaError::FeatureNotSupported`] so an embedder that only needs
/// write-side programming (the common case) doesn't have to stub them
/// out; a PF that actually services VF mailbox reads overrides them.
pub trait ContextOps: Send + Sync {
    fn program_queue_context(&self, qid: u32, ctx: &QueueContext) -> QdmaResult<()>;
    fn clear_queue_context(&self, qid: u32) -> QdmaResult<()>;
    fn invalidate_queue_context(&self, qid: u32) -> QdmaResult<()>;

    /// Reads back a queue's programmed context, for `QCTX_READ` mailbox
    /// requests (spec.md §4.5).
    fn read_queue_context(&self, qid: u32) -> QdmaResult<QueueContext> {
        let _ = qid;
        Err(QdmaError::FeatureNotSupported)
    }

    /// Programs a vector's interrupt-aggregation ring context.
    fn program_intr_context(&self, vector: u32, coalesce_usec: u32) -> QdmaResult<()> {
        let _ = (vector, coalesce_usec);
        Err(QdmaError::FeatureNotSupported)
    }

    /// Reads back a vector's interrupt context.
    fn read_intr_context(&self, vector: u32) -> QdmaResult<u32> {
        let _ = vector;
        Err(QdmaError::FeatureNotSupported)
    }

    fn invalidate_intr_context(&self, vector: u32) -> QdmaResult<()> {
        let _ = vector;
        Err(QdmaError::FeatureNotSupported)
    }

    /// Reads one CSR/config-space register, for `CSR_READ` mailbox
    /// requests issued by a VF.
    fn read_csr(&self, offset: u32) -> QdmaResult<u32> {
        let _ = offset;
        Err(QdmaError::FeatureNotSupported)
    }
}

/// Doorbell / index-update surface a descq uses to tell the device about
/// new work and to learn what the device has consumed.
pub trait DoorbellOps: Send + Sync {
    /// Writes the descriptor-ring producer index.
    fn write_pidx(&self, qid: u32, pidx: u16);
    /// Writes the CMPT-ring consumer index.
    fn write_cmpt_cidx(&self, qid: u32, cidx: u16);
    /// Reads the CMPT-ring consumer index the hardware last observed,
    /// used only for diagnostics/tests.
    fn read_cmpt_cidx(&self, qid: u32) -> u16 {
        let _ = qid;
        0
    }
}

/// A fixed-width mailbox register window, one instance per direction
/// (PF's outgoing window to a given VF, or vice versa). Mirrors the
/// "fixed register window" of spec.md §4.5.
pub trait MailboxRegisters: Send + Sync {
    /// Attempts to post `msg` to hardware. `Ok(true)` means accepted,
    /// `Ok(false)` means the hardware send slot is busy.
    fn try_send(&self, msg: &[u32]) -> QdmaResult<bool>;
    /// Drains at most one received message, if any is pending.
    fn try_recv(&self) -> QdmaResult<Option<Vec<u32>>>;
}
