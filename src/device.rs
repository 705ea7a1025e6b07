// SPDX-License-Identifier: MPL-2.0

//! Device object (component C6, spec.md §4.6).
//!
//! One PCIe function's view: capability flags, the mailbox instance, the
//! VF table (PF side only), and the descq list. Register/BAR discovery is
//! left to the embedder (`crate::hw`, spec.md §1 Non-goals); this module
//! owns lifecycle and FLR coordination the way an admin-queue owner
//! (`NvmeController`) owns admin-queue lifecycle without knowing how its
//! BARs were mapped.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::config::{Direction, QueueMode};
use crate::descq::{DescQ, QueueContext};
use crate::error::{QdmaError, QdmaResult};
use crate::hw::{ContextOps, MailboxRegisters};
use crate::list::IndexList;
use crate::mailbox::{Mailbox, Message, Opcode, ReceiveOutcome};
use crate::resource::{QueueKind, ResourceManager};

bitflags! {
    /// Capability flags discovered at probe time (spec.md §4.6).
    pub struct Capabilities: u32 {
        const ST_EN       = 1 << 0;
        const MM_EN       = 1 << 1;
        const MM_CMPT_EN  = 1 << 2;
        const MAILBOX_EN  = 1 << 3;
        const FLR_PRESENT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Online,
    Offline,
}

/// Per-VF bookkeeping the PF keeps across FLR rounds.
#[derive(Debug, Clone)]
struct VfEntry {
    func_id: u16,
    online: bool,
    active_qcnt: u32,
}

/// Base wait for a VF's `RESET_BYE`, before per-queue scaling (spec.md
/// §4.6 "FLR coordination").
const FLR_BASE_TIMEOUT: Duration = Duration::from_millis(100);
const FLR_PER_QUEUE_TIMEOUT: Duration = Duration::from_millis(10);

fn word(payload: &[u32], i: usize) -> QdmaResult<u32> {
    payload.get(i).copied().ok_or(QdmaError::InvalidParameter)
}

fn encode_i64(v: i64) -> (u32, u32) {
    let bits = v as u64;
    (bits as u32, (bits >> 32) as u32)
}

fn decode_i64(lo: u32, hi: u32) -> i64 {
    (((hi as u64) << 32) | lo as u64) as i64
}

fn direction_code(d: Direction) -> u32 {
    match d {
        Direction::H2c => 0,
        Direction::C2h => 1,
        Direction::Cmpt => 2,
    }
}

fn decode_direction(code: u32) -> QdmaResult<Direction> {
    match code {
        0 => Ok(Direction::H2c),
        1 => Ok(Direction::C2h),
        2 => Ok(Direction::Cmpt),
        _ => Err(QdmaError::InvalidParameter),
    }
}

fn mode_code(m: QueueMode) -> u32 {
    match m {
        QueueMode::Mm => 0,
        QueueMode::St => 1,
    }
}

fn decode_mode(code: u32) -> QdmaResult<QueueMode> {
    match code {
        0 => Ok(QueueMode::Mm),
        1 => Ok(QueueMode::St),
        _ => Err(QdmaError::InvalidParameter),
    }
}

fn decode_kind(code: u32) -> QdmaResult<QueueKind> {
    match code {
        0 => Ok(QueueKind::H2c),
        1 => Ok(QueueKind::C2h),
        2 => Ok(QueueKind::Cmpt),
        _ => Err(QdmaError::InvalidParameter),
    }
}

/// Wire encoding for [`QueueContext`] carried in `QCTX_WRITE`/`QCTX_READ`
/// mailbox payloads (spec.md §4.5).
fn encode_queue_context(ctx: &QueueContext) -> Vec<u32> {
    vec![
        ctx.hw_qid,
        direction_code(ctx.direction),
        mode_code(ctx.mode),
        ctx.rngsz,
        ctx.cmpt_rngsz,
        ctx.c2h_bufsz,
        ctx.bypass as u32,
        ctx.pfetch_en as u32,
        ctx.aperture_size,
    ]
}

fn decode_queue_context(payload: &[u32]) -> QdmaResult<QueueContext> {
    Ok(QueueContext {
        hw_qid: word(payload, 0)?,
        direction: decode_direction(word(payload, 1)?)?,
        mode: decode_mode(word(payload, 2)?)?,
        rngsz: word(payload, 3)?,
        cmpt_rngsz: word(payload, 4)?,
        c2h_bufsz: word(payload, 5)?,
        bypass: word(payload, 6)? != 0,
        pfetch_en: word(payload, 7)? != 0,
        aperture_size: word(payload, 8)?,
    })
}

/// One PCIe function (spec.md §4.6).
pub struct Device {
    pub device_index: u32,
    pub func_id: u16,
    pub is_pf: bool,
    pub caps: Capabilities,
    pub mm_channels: u8,
    pub mailbox: Mailbox,
    state: DeviceState,
    flr_pending: bool,
    vfs: Mutex<Vec<VfEntry>>,
    descqs: Mutex<IndexList<DescQ>>,
}

impl Device {
    pub fn new(device_index: u32, func_id: u16, is_pf: bool, caps: Capabilities, mm_channels: u8) -> Self {
        Self {
            device_index,
            func_id,
            is_pf,
            caps,
            mm_channels,
            mailbox: Mailbox::new(func_id),
            state: DeviceState::Closed,
            flr_pending: false,
            vfs: Mutex::new(Vec::new()),
            descqs: Mutex::new(IndexList::new()),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn open(&mut self) -> QdmaResult<()> {
        if self.state != DeviceState::Closed {
            return Err(QdmaError::InvalidParameter);
        }
        self.state = DeviceState::Open;
        Ok(())
    }

    pub fn online(&mut self) -> QdmaResult<()> {
        if self.state != DeviceState::Open && self.state != DeviceState::Offline {
            return Err(QdmaError::InvalidParameter);
        }
        self.state = DeviceState::Online;
        Ok(())
    }

    pub fn offline(&mut self) -> QdmaResult<()> {
        if self.state != DeviceState::Online {
            return Err(QdmaError::InvalidParameter);
        }
        self.state = DeviceState::Offline;
        Ok(())
    }

    pub fn close(&mut self) -> QdmaResult<()> {
        if self.state == DeviceState::Closed {
            return Err(QdmaError::InvalidParameter);
        }
        self.state = DeviceState::Closed;
        Ok(())
    }

    pub fn flr_set(&mut self) {
        self.flr_pending = true;
    }

    pub fn flr_check(&self) -> bool {
        self.flr_pending
    }

    pub fn descqs(&self) -> &Mutex<IndexList<DescQ>> {
        &self.descqs
    }

    fn upsert_vf(&self, func_id: u16, online: bool) {
        let mut vfs = self.vfs.lock().unwrap();
        match vfs.iter_mut().find(|v| v.func_id == func_id) {
            Some(v) => v.online = online,
            None => vfs.push(VfEntry {
                func_id,
                online,
                active_qcnt: 0,
            }),
        }
    }

    /// (ADDED, P-M1) Idempotent: a duplicate `VF_ONLINE` from the same
    /// source leaves the table in the same state as a single one.
    pub fn note_vf_online(&self, func_id: u16) {
        self.upsert_vf(func_id, true);
    }

    pub fn note_vf_offline(&self, func_id: u16) {
        self.upsert_vf(func_id, false);
    }

    pub fn set_vf_active_qcnt(&self, func_id: u16, qcnt: u32) {
        let mut vfs = self.vfs.lock().unwrap();
        if let Some(v) = vfs.iter_mut().find(|v| v.func_id == func_id) {
            v.active_qcnt = qcnt;
        }
    }

    pub fn vf_count_online(&self) -> usize {
        self.vfs.lock().unwrap().iter().filter(|v| v.online).count()
    }

    fn reply_to(&self, req: &Message, opcode: Opcode, payload: Vec<u32>) -> QdmaResult<Message> {
        Message::new(opcode, self.func_id as u8, req.src_func_id, req.correlator, payload)
    }

    /// Dispatches an unsolicited message (one that didn't correlate with
    /// a pending send) by opcode, on the PF side (spec.md §4.5 "Receive
    /// pipeline", §4.2 "queue-resource requests", §1 "Control flow").
    /// Replies are composed synchronously and handed to
    /// [`Mailbox::enqueue_reply`].
    pub fn handle_unsolicited(
        &self,
        msg: &Message,
        rm: &ResourceManager,
        ctx_ops: &dyn ContextOps,
    ) -> QdmaResult<()> {
        let reply = match msg.opcode {
            Opcode::VfOnline => {
                self.note_vf_online(msg.src_func_id);
                Some(self.reply_to(msg, Opcode::VfOnlineResp, Vec::new())?)
            }
            Opcode::VfOffline => {
                self.note_vf_offline(msg.src_func_id);
                Some(self.reply_to(msg, Opcode::VfOfflineResp, Vec::new())?)
            }
            Opcode::FmapProgram => {
                let func_id = word(&msg.payload, 0)? as u16;
                let qmax = word(&msg.payload, 1)?;
                let hint = if word(&msg.payload, 2)? != 0 {
                    Some(decode_i64(word(&msg.payload, 3)?, word(&msg.payload, 4)?))
                } else {
                    None
                };
                let qbase = rm.update_function(self.device_index, func_id, qmax, hint)?;
                let (lo, hi) = encode_i64(qbase);
                Some(self.reply_to(msg, Opcode::FmapProgramResp, vec![lo, hi])?)
            }
            Opcode::CsrRead => {
                let offset = word(&msg.payload, 0)?;
                let value = ctx_ops.read_csr(offset)?;
                Some(self.reply_to(msg, Opcode::CsrReadResp, vec![value])?)
            }
            Opcode::QCtxWrite => {
                let ctx = decode_queue_context(&msg.payload)?;
                ctx_ops.program_queue_context(ctx.hw_qid, &ctx)?;
                Some(self.reply_to(msg, Opcode::QCtxWriteResp, vec![ctx.hw_qid])?)
            }
            Opcode::QCtxRead => {
                let qid = word(&msg.payload, 0)?;
                let ctx = ctx_ops.read_queue_context(qid)?;
                Some(self.reply_to(msg, Opcode::QCtxReadResp, encode_queue_context(&ctx))?)
            }
            Opcode::QCtxClear => {
                let qid = word(&msg.payload, 0)?;
                ctx_ops.clear_queue_context(qid)?;
                Some(self.reply_to(msg, Opcode::QCtxClearResp, vec![qid])?)
            }
            Opcode::QCtxInvalidate => {
                let qid = word(&msg.payload, 0)?;
                ctx_ops.invalidate_queue_context(qid)?;
                Some(self.reply_to(msg, Opcode::QCtxInvalidateResp, vec![qid])?)
            }
            Opcode::QAddNotify => {
                let func_id = word(&msg.payload, 0)? as u16;
                let kind = decode_kind(word(&msg.payload, 1)?)?;
                rm.increment_active(self.device_index, func_id, kind)?;
                Some(self.reply_to(msg, Opcode::QAddNotifyResp, Vec::new())?)
            }
            Opcode::QDelNotify => {
                let func_id = word(&msg.payload, 0)? as u16;
                let kind = decode_kind(word(&msg.payload, 1)?)?;
                rm.decrement_active(self.device_index, func_id, kind)?;
                Some(self.reply_to(msg, Opcode::QDelNotifyResp, Vec::new())?)
            }
            Opcode::IntrCtxWrite => {
                let vector = word(&msg.payload, 0)?;
                let coalesce_usec = word(&msg.payload, 1)?;
                ctx_ops.program_intr_context(vector, coalesce_usec)?;
                Some(self.reply_to(msg, Opcode::IntrCtxWriteResp, Vec::new())?)
            }
            Opcode::IntrCtxRead => {
                let vector = word(&msg.payload, 0)?;
                let value = ctx_ops.read_intr_context(vector)?;
                Some(self.reply_to(msg, Opcode::IntrCtxReadResp, vec![value])?)
            }
            Opcode::IntrCtxInvalidate => {
                let vector = word(&msg.payload, 0)?;
                ctx_ops.invalidate_intr_context(vector)?;
                Some(self.reply_to(msg, Opcode::IntrCtxInvalidateResp, Vec::new())?)
            }
            Opcode::RegReadList => {
                let values = msg
                    .payload
                    .iter()
                    .map(|&offset| ctx_ops.read_csr(offset))
                    .collect::<QdmaResult<Vec<u32>>>()?;
                Some(self.reply_to(msg, Opcode::RegReadListResp, values)?)
            }
            Opcode::GetActiveQCount => {
                let func_id = word(&msg.payload, 0)? as u16;
                let total = [QueueKind::H2c, QueueKind::C2h, QueueKind::Cmpt]
                    .into_iter()
                    .map(|kind| rm.get_function_active_count(self.device_index, func_id, kind))
                    .sum::<QdmaResult<u32>>()?;
                Some(self.reply_to(msg, Opcode::GetActiveQCountResp, vec![total])?)
            }
            _ => None,
        };
        if let Some(reply) = reply {
            self.mailbox.enqueue_reply(reply);
        }
        Ok(())
    }

    /// FLR coordination, PF to VFs (spec.md §4.6). Broadcasts
    /// `VF_RESET_REQ` to every online VF, waits for `VF_RESET_BYE` within
    /// a per-VF timeout scaled by that VF's active queue count, brings
    /// hardware back up (left to the embedder), then broadcasts
    /// `PF_RESET_DONE` to whichever VFs acked. A VF that doesn't reply in
    /// time is marked offline without further waiting.
    pub fn flr_broadcast(
        &self,
        hw: &dyn MailboxRegisters,
        rm: &ResourceManager,
        ctx_ops: &dyn ContextOps,
    ) -> QdmaResult<()> {
        let online_vfs: Vec<VfEntry> = {
            let vfs = self.vfs.lock().unwrap();
            vfs.iter().filter(|v| v.online).cloned().collect()
        };

        for vf in &online_vfs {
            let req = Message::new(
                Opcode::ResetRequest,
                self.func_id as u8,
                vf.func_id as u8,
                vf.func_id as u8,
                Vec::new(),
            )?;
            self.mailbox.enqueue_reply(req);
        }
        while self.mailbox.pump_tx(hw)? {}

        // Replies don't have to arrive in broadcast order: a `ResetBye`
        // from a VF other than the one we're currently waiting on is
        // stashed here instead of being dropped, and consumed when that
        // VF's own turn comes up.
        let mut acked_byes: HashSet<u8> = HashSet::new();
        for vf in &online_vfs {
            let timeout = FLR_BASE_TIMEOUT + FLR_PER_QUEUE_TIMEOUT * vf.active_qcnt;
            let deadline = Instant::now() + timeout;
            let mut acked = acked_byes.remove(&(vf.func_id as u8));
            while !acked && Instant::now() < deadline {
                match self.mailbox.receive_one(hw)? {
                    ReceiveOutcome::Unsolicited(msg)
                        if msg.opcode == Opcode::ResetBye && msg.src_func_id == vf.func_id as u8 =>
                    {
                        acked = true;
                    }
                    ReceiveOutcome::Unsolicited(msg) if msg.opcode == Opcode::ResetBye => {
                        acked_byes.insert(msg.src_func_id);
                    }
                    ReceiveOutcome::Unsolicited(other) => self.handle_unsolicited(&other, rm, ctx_ops)?,
                    ReceiveOutcome::Empty => std::thread::sleep(Duration::from_millis(1)),
                    _ => {}
                }
            }
            if !acked {
                self.note_vf_offline(vf.func_id);
            }
        }

        let still_online: Vec<u16> = {
            let vfs = self.vfs.lock().unwrap();
            online_vfs
                .iter()
                .filter(|vf| vfs.iter().any(|v| v.func_id == vf.func_id && v.online))
                .map(|vf| vf.func_id)
                .collect()
        };
        for func_id in still_online {
            let done = Message::new(
                Opcode::ResetDone,
                self.func_id as u8,
                func_id as u8,
                func_id as u8,
                Vec::new(),
            )?;
            self.mailbox.enqueue_reply(done);
        }
        while self.mailbox.pump_tx(hw)? {}

        Ok(())
    }
}
