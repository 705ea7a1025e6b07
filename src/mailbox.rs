// SPDX-License-Identifier: MPL-2.0

//! Inter-function mailbox (component C3, spec.md §4.5).
//!
//! A request/response channel over a small, fixed-width hardware register
//! window, wrapped in a send pipeline (`tx_todo`) and a receive/correlation
//! pipeline (`rx_pending`) — the same "list + hardware slot" split an
//! admin queue uses for its own request/response tracking, reused here
//! for a channel that runs between PF and VF instead of between driver
//! and device.
//!
//! This module only frames, sends, and correlates messages; opcode
//! dispatch (what a PF does with a `Q_ADD_NOTIFY`, what a VF does with a
//! `RESET_REQ`) belongs to the device object (C6), which drives
//! [`Mailbox::pump_tx`] / [`Mailbox::receive_one`] and interprets
//! [`ReceiveOutcome::Unsolicited`].

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bit_field::BitField;

use crate::error::{QdmaError, QdmaResult};
use crate::hw::MailboxRegisters;

/// Width of the fixed hardware register window.
pub const MBOX_MSG_REGS: usize = 32;
pub type RawMessage = [u32; MBOX_MSG_REGS];

/// Retry budget for a fire-and-forget send before it is dropped (spec.md
/// §4.5 step 3, (ADDED) "Retry decay for fire-and-forget sends").
const MBOX_MAX_RETRIES: u8 = 5;
/// Cadence at which a busy send's retry counter decays.
const MBOX_RETRY_DECAY_INTERVAL: Duration = Duration::from_secs(1);

/// Mailbox opcodes (spec.md §6), grouped by category. Every request
/// opcode names its response counterpart via [`Opcode::response`]; bare
/// notifications (`Bye`, `ResetBye`) have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Hello,
    Bye,
    FmapProgram,
    FmapProgramResp,
    CsrRead,
    CsrReadResp,
    QCtxWrite,
    QCtxWriteResp,
    QCtxRead,
    QCtxReadResp,
    QCtxClear,
    QCtxClearResp,
    QCtxInvalidate,
    QCtxInvalidateResp,
    QAddNotify,
    QAddNotifyResp,
    QDelNotify,
    QDelNotifyResp,
    IntrCtxWrite,
    IntrCtxWriteResp,
    IntrCtxRead,
    IntrCtxReadResp,
    IntrCtxInvalidate,
    IntrCtxInvalidateResp,
    RegReadList,
    RegReadListResp,
    GetActiveQCount,
    GetActiveQCountResp,
    VfOnline,
    VfOnlineResp,
    VfOffline,
    VfOfflineResp,
    ResetRequest,
    ResetBye,
    ResetDone,
    ResetDoneResp,
    Offline,
    OfflineResp,
}

impl Opcode {
    fn code(self) -> u8 {
        use Opcode::*;
        match self {
            Hello => 0,
            Bye => 1,
            FmapProgram => 2,
            FmapProgramResp => 3,
            CsrRead => 4,
            CsrReadResp => 5,
            QCtxWrite => 6,
            QCtxWriteResp => 7,
            QCtxRead => 8,
            QCtxReadResp => 9,
            QCtxClear => 10,
            QCtxClearResp => 11,
            QCtxInvalidate => 12,
            QCtxInvalidateResp => 13,
            QAddNotify => 14,
            QAddNotifyResp => 15,
            QDelNotify => 16,
            QDelNotifyResp => 17,
            IntrCtxWrite => 18,
            IntrCtxWriteResp => 19,
            IntrCtxRead => 20,
            IntrCtxReadResp => 21,
            IntrCtxInvalidate => 22,
            IntrCtxInvalidateResp => 23,
            RegReadList => 24,
            RegReadListResp => 25,
            GetActiveQCount => 26,
            GetActiveQCountResp => 27,
            VfOnline => 28,
            VfOnlineResp => 29,
            VfOffline => 30,
            VfOfflineResp => 31,
            ResetRequest => 32,
            ResetBye => 33,
            ResetDone => 34,
            ResetDoneResp => 35,
            Offline => 36,
            OfflineResp => 37,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        use Opcode::*;
        Some(match code {
            0 => Hello,
            1 => Bye,
            2 => FmapProgram,
            3 => FmapProgramResp,
            4 => CsrRead,
            5 => CsrReadResp,
            6 => QCtxWrite,
            7 => QCtxWriteResp,
            8 => QCtxRead,
            9 => QCtxReadResp,
            10 => QCtxClear,
            11 => QCtxClearResp,
            12 => QCtxInvalidate,
            13 => QCtxInvalidateResp,
            14 => QAddNotify,
            15 => QAddNotifyResp,
            16 => QDelNotify,
            17 => QDelNotifyResp,
            18 => IntrCtxWrite,
            19 => IntrCtxWriteResp,
            20 => IntrCtxRead,
            21 => IntrCtxReadResp,
            22 => IntrCtxInvalidate,
            23 => IntrCtxInvalidateResp,
            24 => RegReadList,
            25 => RegReadListResp,
            26 => GetActiveQCount,
            27 => GetActiveQCountResp,
            28 => VfOnline,
            29 => VfOnlineResp,
            30 => VfOffline,
            31 => VfOfflineResp,
            32 => ResetRequest,
            33 => ResetBye,
            34 => ResetDone,
            35 => ResetDoneResp,
            36 => Offline,
            37 => OfflineResp,
            _ => return None,
        })
    }

    /// The response opcode used for correlation, if this opcode expects one.
    pub fn response(self) -> Option<Opcode> {
        use Opcode::*;
        Some(match self {
            FmapProgram => FmapProgramResp,
            CsrRead => CsrReadResp,
            QCtxWrite => QCtxWriteResp,
            QCtxRead => QCtxReadResp,
            QCtxClear => QCtxClearResp,
            QCtxInvalidate => QCtxInvalidateResp,
            QAddNotify => QAddNotifyResp,
            QDelNotify => QDelNotifyResp,
            IntrCtxWrite => IntrCtxWriteResp,
            IntrCtxRead => IntrCtxReadResp,
            IntrCtxInvalidate => IntrCtxInvalidateResp,
            RegReadList => RegReadListResp,
            GetActiveQCount => GetActiveQCountResp,
            VfOnline => VfOnlineResp,
            VfOffline => VfOfflineResp,
            ResetDone => ResetDoneResp,
            Offline => OfflineResp,
            _ => return None,
        })
    }
}

/// One mailbox message: the decoded header plus opcode-specific payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub opcode: Opcode,
    pub src_func_id: u8,
    pub dst_func_id: u8,
    pub correlator: u8,
    pub payload: Vec<u32>,
}

impl Message {
    pub fn new(
        opcode: Opcode,
        src_func_id: u8,
        dst_func_id: u8,
        correlator: u8,
        payload: Vec<u32>,
    ) -> QdmaResult<Self> {
        if payload.len() > MBOX_MSG_REGS - 1 {
            return Err(QdmaError::MailboxMessageTooLarge);
        }
        Ok(Self {
            opcode,
            src_func_id,
            dst_func_id,
            correlator,
            payload,
        })
    }

    pub fn to_raw(&self) -> RawMessage {
        let mut raw = [0u32; MBOX_MSG_REGS];
        let mut header = 0u32;
        header.set_bits(0..8, self.opcode.code() as u32);
        header.set_bits(8..16, self.src_func_id as u32);
        header.set_bits(16..24, self.dst_func_id as u32);
        header.set_bits(24..32, self.correlator as u32);
        raw[0] = header;
        for (slot, word) in raw[1..].iter_mut().zip(self.payload.iter()) {
            *slot = *word;
        }
        raw
    }

    /// Decodes a raw message. `Ok(None)` is the all-zero stop condition
    /// (spec.md §4.5 "Stop condition"), not an error.
    pub fn from_raw(raw: &RawMessage) -> QdmaResult<Option<Self>> {
        if raw.iter().all(|w| *w == 0) {
            return Ok(None);
        }
        let header = raw[0];
        let opcode = Opcode::from_code(header.get_bits(0..8) as u8)
            .ok_or(QdmaError::MailboxOpcodeUnsupported)?;
        Ok(Some(Self {
            opcode,
            src_func_id: header.get_bits(8..16) as u8,
            dst_func_id: header.get_bits(16..24) as u8,
            correlator: header.get_bits(24..32) as u8,
            payload: raw[1..].to_vec(),
        }))
    }

    /// A response matches a pending send iff its opcode is the send's
    /// response form and source/destination are swapped (spec.md §4.5
    /// "Correlation").
    fn correlates_with(&self, sent: &Message) -> bool {
        Some(self.opcode) == sent.opcode.response()
            && self.src_func_id == sent.dst_func_id
            && self.dst_func_id == sent.src_func_id
            && self.correlator == sent.correlator
    }
}

struct ReplySlot {
    result: Mutex<Option<QdmaResult<Message>>>,
    cv: Condvar,
}

impl ReplySlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn wait(&self, timeout: Duration) -> Option<QdmaResult<Message>> {
        let guard = self.result.lock().unwrap();
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |r| r.is_none())
            .unwrap();
        guard.take()
    }

    fn signal(&self, result: QdmaResult<Message>) {
        let mut guard = self.result.lock().unwrap();
        *guard = Some(result);
        self.cv.notify_all();
    }
}

struct TxItem {
    msg: Message,
    wait_response: bool,
    retries_left: u8,
    last_decay: Option<Instant>,
    reply_slot: Option<Arc<ReplySlot>>,
}

#[derive(Default)]
struct Lists {
    tx_todo: VecDeque<TxItem>,
    rx_pending: Vec<TxItem>,
}

/// What `receive_one` did with the message it read off hardware.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Nothing was pending in the hardware receive FIFO.
    Empty,
    /// An all-zero message: the peer's mailbox is disabled. The caller
    /// should stop rescheduling the receive loop.
    Stopped,
    /// The message matched a pending send and was delivered to its slot.
    Correlated,
    /// The message did not correlate with anything pending; the device
    /// object (C6) should dispatch it by opcode.
    Unsolicited(Message),
}

/// One end of a PF<->VF mailbox channel (spec.md §4.5).
pub struct Mailbox {
    func_id: u16,
    lists: Mutex<Lists>,
    hw_tx_lock: Mutex<()>,
    hw_rx_lock: Mutex<()>,
}

impl Mailbox {
    pub fn new(func_id: u16) -> Self {
        Self {
            func_id,
            lists: Mutex::new(Lists::default()),
            hw_tx_lock: Mutex::new(()),
            hw_rx_lock: Mutex::new(()),
        }
    }

    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Enqueues `msg` and, if `wait_response` is set, blocks up to
    /// `timeout_ms` for its correlated reply. The caller is responsible
    /// for driving [`Mailbox::pump_tx`] (directly, from a worker, or from
    /// an interrupt bottom half) so the message actually leaves.
    pub fn send(
        &self,
        msg: Message,
        wait_response: bool,
        timeout_ms: u64,
    ) -> QdmaResult<Option<Message>> {
        let slot = wait_response.then(ReplySlot::new);
        let correlator = msg.correlator;
        let opcode = msg.opcode;
        {
            let mut lists = self.lists.lock().unwrap();
            lists.tx_todo.push_back(TxItem {
                msg,
                wait_response,
                retries_left: MBOX_MAX_RETRIES,
                last_decay: None,
                reply_slot: slot.clone(),
            });
        }

        match slot {
            None => Ok(None),
            Some(slot) => match slot.wait(Duration::from_millis(timeout_ms)) {
                Some(result) => result.map(Some),
                None => {
                    let mut lists = self.lists.lock().unwrap();
                    lists
                        .rx_pending
                        .retain(|p| !(p.msg.correlator == correlator && p.msg.opcode == opcode));
                    Err(QdmaError::MailboxTimeout)
                }
            },
        }
    }

    /// Enqueues a reply composed synchronously by a PF-side opcode
    /// handler (spec.md §4.5 "Receive pipeline").
    pub fn enqueue_reply(&self, msg: Message) {
        let mut lists = self.lists.lock().unwrap();
        lists.tx_todo.push_back(TxItem {
            msg,
            wait_response: false,
            retries_left: MBOX_MAX_RETRIES,
            last_decay: None,
            reply_slot: None,
        });
    }

    /// Attempts to send the head of `tx_todo`. Returns `Ok(false)` if the
    /// queue was empty, `Ok(true)` otherwise (whether the attempt
    /// succeeded, was retried, or was dropped).
    pub fn pump_tx(&self, hw: &dyn MailboxRegisters) -> QdmaResult<bool> {
        let item = {
            let mut lists = self.lists.lock().unwrap();
            lists.tx_todo.pop_front()
        };
        let Some(mut item) = item else {
            return Ok(false);
        };

        let sent = {
            let _hw_guard = self.hw_tx_lock.lock().unwrap();
            hw.try_send(&item.msg.to_raw())?
        };
        if sent {
            if item.wait_response {
                let mut lists = self.lists.lock().unwrap();
                lists.rx_pending.push(item);
            }
            return Ok(true);
        }

        let decay_due = item
            .last_decay
            .map(|t| t.elapsed() >= MBOX_RETRY_DECAY_INTERVAL)
            .unwrap_or(true);
        if !item.wait_response && decay_due {
            item.last_decay = Some(Instant::now());
            if item.retries_left == 0 {
                if let Some(slot) = item.reply_slot.take() {
                    slot.signal(Err(QdmaError::MailboxRetriesExhausted));
                }
                return Ok(true);
            }
            item.retries_left -= 1;
        }
        let mut lists = self.lists.lock().unwrap();
        lists.tx_todo.push_back(item);
        Ok(true)
    }

    /// Drains at most one message from the hardware receive FIFO.
    pub fn receive_one(&self, hw: &dyn MailboxRegisters) -> QdmaResult<ReceiveOutcome> {
        let raw = {
            let _g = self.hw_rx_lock.lock().unwrap();
            hw.try_recv()?
        };
        let Some(raw) = raw else {
            return Ok(ReceiveOutcome::Empty);
        };
        let raw: RawMessage = raw
            .try_into()
            .map_err(|_| QdmaError::MailboxMessageTooLarge)?;
        let Some(msg) = Message::from_raw(&raw)? else {
            return Ok(ReceiveOutcome::Stopped);
        };

        let mut lists = self.lists.lock().unwrap();
        if let Some(idx) = lists
            .rx_pending
            .iter()
            .position(|p| msg.correlates_with(&p.msg))
        {
            let item = lists.rx_pending.remove(idx);
            drop(lists);
            if let Some(slot) = item.reply_slot {
                slot.signal(Ok(msg));
            }
            Ok(ReceiveOutcome::Correlated)
        } else {
            Ok(ReceiveOutcome::Unsolicited(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as Deque;
    use std::sync::Mutex as StdMutex;

    struct LoopbackHw {
        inbox: StdMutex<Deque<RawMessage>>,
    }

    impl MailboxRegisters for LoopbackHw {
        fn try_send(&self, msg: &[u32]) -> QdmaResult<bool> {
            let mut raw = [0u32; MBOX_MSG_REGS];
            raw.copy_from_slice(msg);
            self.inbox.lock().unwrap().push_back(raw);
            Ok(true)
        }

        fn try_recv(&self) -> QdmaResult<Option<Vec<u32>>> {
            Ok(self.inbox.lock().unwrap().pop_front().map(|r| r.to_vec()))
        }
    }

    #[test]
    fn message_round_trips_through_raw_encoding() {
        let msg = Message::new(Opcode::QCtxWrite, 0, 3, 42, vec![1, 2, 3]).unwrap();
        let raw = msg.to_raw();
        let back = Message::from_raw(&raw).unwrap().unwrap();
        assert_eq!(back.opcode, Opcode::QCtxWrite);
        assert_eq!(back.src_func_id, 0);
        assert_eq!(back.dst_func_id, 3);
        assert_eq!(back.correlator, 42);
        assert_eq!(&back.payload[..3], &[1, 2, 3]);
    }

    #[test]
    fn all_zero_message_is_the_stop_condition() {
        let raw = [0u32; MBOX_MSG_REGS];
        assert!(Message::from_raw(&raw).unwrap().is_none());
    }

    #[test]
    fn payload_over_the_register_window_is_rejected() {
        let err = Message::new(Opcode::RegReadList, 0, 1, 0, vec![0; MBOX_MSG_REGS]).unwrap_err();
        assert_eq!(err, QdmaError::MailboxMessageTooLarge);
    }

    #[test]
    fn p_m2_a_correlator_is_answered_at_most_once() {
        let hw = LoopbackHw {
            inbox: StdMutex::new(Deque::new()),
        };

        // The VF's send loop: put QCtxWrite on the wire, PF "replies" with
        // exactly one correctly-correlated QCtxWriteResp.
        let vf = Mailbox::new(1);
        let pf = Mailbox::new(0);

        let sent = std::thread::scope(|scope| {
            let handle = scope.spawn(|| vf.send(
                Message::new(Opcode::QCtxWrite, 1, 0, 7, vec![99]).unwrap(),
                true,
                200,
            ));

            // Drive the VF's tx pipeline until the request is on the wire.
            while !vf.pump_tx(&hw).unwrap() {}

            let req = match pf.receive_one(&hw).unwrap() {
                ReceiveOutcome::Unsolicited(m) => m,
                other => panic!("expected an unsolicited request, got {other:?}"),
            };
            assert_eq!(req.correlator, 7);

            let reply = Message::new(Opcode::QCtxWriteResp, 0, 1, 7, vec![1]).unwrap();
            pf.enqueue_reply(reply);
            while !pf.pump_tx(&hw).unwrap() {}

            loop {
                match vf.receive_one(&hw).unwrap() {
                    ReceiveOutcome::Correlated => break,
                    ReceiveOutcome::Empty => std::thread::sleep(Duration::from_millis(1)),
                    other => panic!("unexpected: {other:?}"),
                }
            }

            handle.join().unwrap()
        });

        let reply = sent.unwrap().unwrap();
        assert_eq!(reply.opcode, Opcode::QCtxWriteResp);
        assert_eq!(reply.payload[0], 1);

        // A second, spurious reply with the same correlator must not
        // resurrect anything: rx_pending no longer holds the request.
        let spurious = Message::new(Opcode::QCtxWriteResp, 0, 1, 7, vec![2]).unwrap();
        pf.enqueue_reply(spurious);
        while !pf.pump_tx(&hw).unwrap() {}
        match vf.receive_one(&hw).unwrap() {
            ReceiveOutcome::Unsolicited(m) => assert_eq!(m.payload[0], 2),
            other => panic!("expected the second reply to be unsolicited, got {other:?}"),
        }
    }

    #[test]
    fn timed_out_send_is_unlinked_from_rx_pending() {
        let hw = LoopbackHw {
            inbox: StdMutex::new(Deque::new()),
        };
        let vf = Mailbox::new(1);

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let req = Message::new(Opcode::CsrRead, 1, 0, 3, Vec::new()).unwrap();
                vf.send(req, true, 150)
            });
            // Move the request onto rx_pending (no one ever answers it), then
            // let the send's own wait time out.
            while !vf.pump_tx(&hw).unwrap() {}
            let err = handle.join().unwrap().unwrap_err();
            assert_eq!(err, QdmaError::MailboxTimeout);
        });

        assert!(vf.lists.lock().unwrap().rx_pending.is_empty());
    }
}
