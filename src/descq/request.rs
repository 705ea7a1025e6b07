// SPDX-License-Identifier: MPL-2.0

//! Request control block (spec.md §3 "Request control block").
//!
//! Mirrors the original's embedded `{list_node, wait_slot, desc_nr, offset,
//! left, sg_offset, sg_cursor, status, done_flag}` struct, but the
//! completion side is an owned [`Completion`] instead of a raw wait-queue
//! pointer — a caller gets either a callback invoked from the completion
//! path, or a [`WaitSlot`] it blocks on with a timeout, matching the
//! "bounded futures or explicit completion ports" redesign (spec.md §9).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::QdmaResult;

/// One scatter-gather entry: a host-side address and its length.
#[derive(Debug, Clone, Copy)]
pub struct ScatterEntry {
    pub addr: u64,
    pub len: u32,
}

/// A slot a caller can block on for a request's result, with a timeout.
pub struct WaitSlot {
    result: Mutex<Option<QdmaResult<u32>>>,
    cv: Condvar,
}

impl WaitSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Blocks until the request completes or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<QdmaResult<u32>> {
        let guard = self.result.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |r| r.is_none())
            .unwrap();
        *guard
    }

    fn signal(&self, result: QdmaResult<u32>) {
        let mut guard = self.result.lock().unwrap();
        *guard = Some(result);
        self.cv.notify_all();
    }
}

pub(crate) enum Completion {
    Callback(Box<dyn FnOnce(QdmaResult<u32>) + Send>),
    Wait(Arc<WaitSlot>),
    None,
}

impl Completion {
    fn fire(self, result: QdmaResult<u32>) {
        match self {
            Completion::Callback(f) => f(result),
            Completion::Wait(slot) => slot.signal(result),
            Completion::None => {}
        }
    }
}

/// One in-flight request, living on a descq's work-list or pend-list.
pub struct Cb {
    pub sg: Vec<ScatterEntry>,
    /// MM mode: device-side endpoint address. Streaming H2C mode: when
    /// nonzero, an optional per-packet-size override no larger than
    /// [`crate::descq::streaming::PAGE_SIZE`] (spec.md §4.3.4).
    pub ep_addr: u64,
    pub total_len: u32,
    /// Bytes already turned into descriptors (MM/H2C emission cursor).
    pub(crate) offset: u32,
    pub(crate) sg_cursor: usize,
    pub(crate) sg_offset: u32,
    /// Descriptors produced but not yet reconciled against completions
    /// (MM/H2C path); summed across pend-list this is invariant I-Q2.
    pub(crate) desc_nr: u32,
    /// Bytes reconciled against completions (streaming C2H path, where a
    /// Cb represents a posted read rather than a descriptor producer).
    pub(crate) completed: u32,
    pub(crate) emission_done: bool,
    pub(crate) sop_emitted: bool,
    /// Set when the ping-pong latency probe stamped this request's first
    /// descriptor; the streaming C2H side reads it back.
    pub(crate) timestamp: Option<u32>,
    completion: Completion,
}

impl Cb {
    pub fn new(sg: Vec<ScatterEntry>, ep_addr: u64) -> Self {
        let total_len = sg.iter().map(|s| s.len).sum();
        Self {
            sg,
            ep_addr,
            total_len,
            offset: 0,
            sg_cursor: 0,
            sg_offset: 0,
            desc_nr: 0,
            completed: 0,
            emission_done: false,
            sop_emitted: false,
            timestamp: None,
            completion: Completion::None,
        }
    }

    /// A pre-posted streaming C2H read request of `len` bytes, with no
    /// scatter-gather list of its own — buffers are supplied by the
    /// free-list as packets arrive.
    pub fn posted_read(len: u32) -> Self {
        Self {
            total_len: len,
            ..Self::new(Vec::new(), 0)
        }
    }

    pub fn with_callback(mut self, cb: impl FnOnce(QdmaResult<u32>) + Send + 'static) -> Self {
        self.completion = Completion::Callback(Box::new(cb));
        self
    }

    pub fn with_wait_slot(mut self) -> (Self, Arc<WaitSlot>) {
        let slot = WaitSlot::new();
        self.completion = Completion::Wait(slot.clone());
        (self, slot)
    }

    pub fn left(&self) -> u32 {
        self.total_len - self.offset
    }

    pub(crate) fn complete(self, result: QdmaResult<u32>) {
        self.completion.fire(result);
    }
}
