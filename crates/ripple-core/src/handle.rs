//! Handle kinds and lifecycle flag bits.
//!
//! Every handle the runtime hands out carries a kind tag and a packed
//! flag word. The flags encode the lifecycle state machine:
//!
//! ```text
//!   init ──▶ active (bound/listening/connected/reading/...)
//!        ──▶ CLOSING ──(pending requests drain)──▶ CLOSED
//! ```
//!
//! CLOSING and CLOSED are one-way; once CLOSING is set no new operations
//! are accepted and CLOSED is set exactly once, by the endgame.

/// Discriminates handle types.
///
/// `File` and `Tty` only appear from descriptor probing; they have no
/// handle objects.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Unknown = 0,
    Tcp,
    NamedPipe,
    Timer,
    Async,
    Process,
    FsEvent,
    Prepare,
    Check,
    Idle,
    File,
    Tty,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Unknown => "unknown",
            HandleKind::Tcp => "tcp",
            HandleKind::NamedPipe => "pipe",
            HandleKind::Timer => "timer",
            HandleKind::Async => "async",
            HandleKind::Process => "process",
            HandleKind::FsEvent => "fs-event",
            HandleKind::Prepare => "prepare",
            HandleKind::Check => "check",
            HandleKind::Idle => "idle",
            HandleKind::File => "file",
            HandleKind::Tty => "tty",
        }
    }
}

impl From<u8> for HandleKind {
    fn from(v: u8) -> Self {
        match v {
            1 => HandleKind::Tcp,
            2 => HandleKind::NamedPipe,
            3 => HandleKind::Timer,
            4 => HandleKind::Async,
            5 => HandleKind::Process,
            6 => HandleKind::FsEvent,
            7 => HandleKind::Prepare,
            8 => HandleKind::Check,
            9 => HandleKind::Idle,
            10 => HandleKind::File,
            11 => HandleKind::Tty,
            _ => HandleKind::Unknown,
        }
    }
}

/// Packed lifecycle flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleFlags(u32);

impl HandleFlags {
    pub const BOUND: u32 = 1 << 0;
    pub const LISTENING: u32 = 1 << 1;
    pub const CONNECTED: u32 = 1 << 2;
    pub const READABLE: u32 = 1 << 3;
    pub const WRITABLE: u32 = 1 << 4;
    pub const READING: u32 = 1 << 5;
    pub const READ_PENDING: u32 = 1 << 6;
    pub const SHUTTING: u32 = 1 << 7;
    pub const SHUT: u32 = 1 << 8;
    pub const EOF: u32 = 1 << 9;
    pub const CLOSING: u32 = 1 << 10;
    pub const CLOSED: u32 = 1 << 11;
    pub const IPC: u32 = 1 << 12;
    /// Descriptor was adopted from outside (stdio bridging); the handle
    /// did not create it.
    pub const ADOPTED: u32 = 1 << 13;

    pub fn new() -> Self {
        HandleFlags(0)
    }

    #[inline]
    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    #[inline]
    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    #[inline]
    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True once close has been requested (CLOSING or CLOSED).
    #[inline]
    pub fn is_closing(&self) -> bool {
        self.0 & (Self::CLOSING | Self::CLOSED) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for v in 0u8..=12 {
            let k = HandleKind::from(v);
            if v <= 11 {
                assert_eq!(k as u8, v);
            } else {
                assert_eq!(k, HandleKind::Unknown);
            }
        }
    }

    #[test]
    fn test_flag_ops() {
        let mut f = HandleFlags::new();
        assert!(!f.is_closing());
        f.set(HandleFlags::READING | HandleFlags::CONNECTED);
        assert!(f.has(HandleFlags::READING));
        f.clear(HandleFlags::READING);
        assert!(!f.has(HandleFlags::READING));
        assert!(f.has(HandleFlags::CONNECTED));
        f.set(HandleFlags::CLOSING);
        assert!(f.is_closing());
    }
}
