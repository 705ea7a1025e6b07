// SPDX-License-Identifier: MPL-2.0

//! Core of a queued DMA (QDMA) engine driver for a PCIe-attached DMA
//! controller: descriptor-queue lifecycle, memory-mapped and streaming
//! transfer submission/completion, the completion-ring free-list pool,
//! the PF/VF mailbox protocol, device/FLR coordination, and the worker
//! thread pool that services completions outside of interrupt context.
//!
//! Register layout, BAR mapping, interrupt wiring and DMA memory
//! allocation are left to the embedder via the traits in [`hw`]; this
//! crate owns the queue/mailbox/device state machines and the
//! accounting around them.

pub mod bufpool;
pub mod config;
pub mod descq;
pub mod device;
pub mod error;
pub mod hw;
pub mod list;
pub mod mailbox;
pub mod resource;
pub mod worker;

pub use config::{Direction, QueueConfig, QueueMode};
pub use descq::DescQ;
pub use device::{Capabilities, Device};
pub use error::{QdmaError, QdmaResult};
pub use mailbox::Mailbox;
pub use resource::ResourceManager;
pub use worker::WorkerPool;
