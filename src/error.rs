// SPDX-License-Identifier: MPL-2.0

//! Stable error codes shared by every subsystem (spec.md §6, §7).

use core::fmt;

/// A crate-wide error, tagged with the stable numeric code from the
/// external interface table. Every core operation returns one of these
/// instead of panicking or asserting on caller-reachable conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdmaError {
    /// Caller passed a parameter outside its valid domain.
    InvalidParameter,
    /// Host or DMA-coherent memory allocation failed.
    OutOfMemory,
    /// The hardware did not respond within its allotted window.
    HardwareBusy,
    /// The function's config BAR could not be mapped or is malformed.
    InvalidConfigBar,
    /// Legacy interrupt line had nothing pending.
    NoPendingLegacyInterrupt,
    /// A requested BAR is not present on this function.
    BarNotFound,
    /// The requested combination of capabilities is not supported.
    FeatureNotSupported,

    // Resource-manager errors (8..13).
    /// `create_master` called with a `(bus_start, bus_end)` pair already owned
    /// by another master. Carries the existing `device_index`.
    ResourceExists(u32),
    /// No master resource matches the given `device_index`.
    NoDevice,
    /// No function entry matches the given `func_id`.
    NoFunction,
    /// `func_id` already has a function entry on this master.
    FunctionExists,
    /// The free list has no range large enough to satisfy the request.
    NoQueuesLeft,
    /// `update_function` rejected because an active counter is non-zero.
    QmaxConfRejected,

    // Mailbox errors (14..25).
    /// The message's round-trip timed out waiting for a response.
    MailboxTimeout,
    /// The send pipeline is disabled or the peer announced shutdown.
    MailboxStopped,
    /// A response arrived whose correlator matched nothing pending.
    MailboxUnsolicited,
    /// The message exceeds the fixed register-window width.
    MailboxMessageTooLarge,
    /// The opcode is not one this function is permitted to send or handle.
    MailboxOpcodeUnsupported,
    /// Retry budget for a fire-and-forget send was exhausted.
    MailboxRetriesExhausted,

    /// A descriptor-queue or CMPT protocol violation latched `descq.err`.
    HardwareProtocolError,
    /// The operation was cancelled (queue stop drain, FLR, shutdown).
    Cancelled,
}

impl QdmaError {
    /// The stable numeric code from spec.md §6's error table.
    pub fn code(self) -> u8 {
        use QdmaError::*;
        match self {
            InvalidParameter => 1,
            OutOfMemory => 2,
            HardwareBusy => 3,
            InvalidConfigBar => 4,
            NoPendingLegacyInterrupt => 5,
            BarNotFound => 6,
            FeatureNotSupported => 7,
            ResourceExists(_) => 8,
            NoDevice => 9,
            NoFunction => 10,
            FunctionExists => 11,
            NoQueuesLeft => 12,
            QmaxConfRejected => 13,
            MailboxTimeout => 14,
            MailboxStopped => 15,
            MailboxUnsolicited => 16,
            MailboxMessageTooLarge => 17,
            MailboxOpcodeUnsupported => 18,
            MailboxRetriesExhausted => 19,
            HardwareProtocolError => 24,
            Cancelled => 25,
        }
    }

    /// Best-effort mapping to a host-OS style errno. The crate makes no
    /// promise of ABI compatibility with any particular OS (spec.md §1
    /// Non-goals); this exists only so embedders have something sane to
    /// surface through their own ioctl/syscall shim.
    pub fn to_errno(self) -> i32 {
        use QdmaError::*;
        match self {
            InvalidParameter => libc_einval(),
            OutOfMemory => libc_enomem(),
            HardwareBusy => libc_ebusy(),
            InvalidConfigBar | BarNotFound => libc_enxio(),
            NoPendingLegacyInterrupt => libc_eagain(),
            FeatureNotSupported | MailboxOpcodeUnsupported => libc_enotsup(),
            ResourceExists(_) | FunctionExists => libc_eexist(),
            NoDevice | NoFunction => libc_enodev(),
            NoQueuesLeft => libc_enospc(),
            QmaxConfRejected => libc_ebusy(),
            MailboxTimeout | MailboxRetriesExhausted => libc_etimedout(),
            MailboxStopped | MailboxUnsolicited => libc_epipe(),
            MailboxMessageTooLarge => libc_emsgsize(),
            HardwareProtocolError => libc_eio(),
            Cancelled => libc_ecanceled(),
        }
    }
}

impl fmt::Display for QdmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdmaError::ResourceExists(idx) => {
                write!(f, "resource already exists (device_index={idx})")
            }
            other => write!(f, "{other:?}"),
        }
    }
}

impl std::error::Error for QdmaError {}

pub type QdmaResult<T> = Result<T, QdmaError>;

// Small, dependency-free errno constants (values match Linux's <errno.h>;
// this crate never calls into libc, it only borrows the numbers).
fn libc_einval() -> i32 {
    22
}
fn libc_enomem() -> i32 {
    12
}
fn libc_ebusy() -> i32 {
    16
}
fn libc_enxio() -> i32 {
    6
}
fn libc_eagain() -> i32 {
    11
}
fn libc_enotsup() -> i32 {
    95
}
fn libc_eexist() -> i32 {
    17
}
fn libc_enodev() -> i32 {
    19
}
fn libc_enospc() -> i32 {
    28
}
fn libc_etimedout() -> i32 {
    110
}
fn libc_epipe() -> i32 {
    32
}
fn libc_emsgsize() -> i32 {
    90
}
fn libc_eio() -> i32 {
    5
}
fn libc_ecanceled() -> i32 {
    125
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_external_interface_table() {
        assert_eq!(QdmaError::InvalidParameter.code(), 1);
        assert_eq!(QdmaError::BarNotFound.code(), 6);
        assert_eq!(QdmaError::ResourceExists(3).code(), 8);
        assert_eq!(QdmaError::QmaxConfRejected.code(), 13);
        assert_eq!(QdmaError::MailboxTimeout.code(), 14);
    }

    #[test]
    fn display_surfaces_the_device_index() {
        let msg = format!("{}", QdmaError::ResourceExists(7));
        assert!(msg.contains('7'));
    }
}
