//! Kernel error types
//!
//! One error enum spans the kernel; subsystems with richer failure
//! vocabularies (filesystem, network, scheduler) get their own sub-enums.
//! The syscall boundary is the universal recovery point: every
//! `KernelError` maps onto a negative POSIX errno via [`KernelError::errno`]
//! and nothing else crosses into user mode.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory,
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },
    /// A user pointer failed validation (wraps or crosses the kernel half)
    BadUserPointer {
        addr: usize,
        len: usize,
    },

    /// Process-related errors
    TaskNotFound {
        id: usize,
    },
    NoChildren,
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Scheduler-related errors
    SchedError(SchedError),

    /// Filesystem / journal errors
    FsError(FsError),

    /// Network stack errors
    NetError(NetError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    OperationNotSupported {
        operation: &'static str,
    },
    /// Operation would block
    WouldBlock,
    /// Blocking operation interrupted by a signal
    Interrupted,
    /// Unknown syscall number
    UnknownSyscall {
        nr: usize,
    },
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Task table has no free slots
    TableFull,
    /// Operation targets a slot in the wrong state
    BadSlotState,
    /// Kernel stack allocation failed
    StackAllocFailed,
}

/// Filesystem / block layer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Block number outside the device
    BlockOutOfRange { block: u64 },
    /// Device I/O failure
    IoError,
    /// Journal superblock magic mismatch
    BadJournalMagic,
    /// A transaction is already open
    TransactionActive,
    /// No transaction is open
    NoTransaction,
    /// Transaction descriptor is full
    TransactionFull,
    /// Invalid file descriptor
    BadFileDescriptor,
    /// File descriptor table is full
    TooManyOpenFiles,
}

/// Network stack errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Socket table exhausted
    NoFreeSockets,
    /// Operation on a socket in the wrong TCP state
    NotConnected,
    /// Address resolution failed (no ARP reply)
    HostUnreachable,
    /// Port already bound
    AddressInUse,
    /// Socket is not bound
    NotBound,
    /// Listener's accept queue is empty and the socket is closing
    ConnectionReset,
    /// Frame or header failed to parse
    Malformed { what: &'static str },
    /// No transmit device registered
    NoDevice,
    /// Connection refused (RST in SynSent)
    ConnectionRefused,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

// POSIX errno values used at the syscall boundary.
pub mod errno {
    pub const EPERM: i64 = 1;
    pub const ESRCH: i64 = 3;
    pub const EINTR: i64 = 4;
    pub const EIO: i64 = 5;
    pub const EBADF: i64 = 9;
    pub const ECHILD: i64 = 10;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EFAULT: i64 = 14;
    pub const EINVAL: i64 = 22;
    pub const ENFILE: i64 = 23;
    pub const EMFILE: i64 = 24;
    pub const ENOSYS: i64 = 38;
    pub const ENOTCONN: i64 = 107;
    pub const EADDRINUSE: i64 = 98;
    pub const ECONNRESET: i64 = 104;
    pub const ECONNREFUSED: i64 = 111;
    pub const EHOSTUNREACH: i64 = 113;
}

impl KernelError {
    /// Map this error onto a positive POSIX errno value.
    ///
    /// Syscall handlers return `-err.errno()` in the result register.
    pub fn errno(&self) -> i64 {
        use errno::*;
        match self {
            Self::OutOfMemory => ENOMEM,
            Self::InvalidAddress { .. } | Self::UnmappedMemory { .. } => EFAULT,
            Self::BadUserPointer { .. } => EFAULT,
            Self::TaskNotFound { .. } => ESRCH,
            Self::NoChildren => ECHILD,
            Self::InvalidState { .. } => EINVAL,
            Self::SchedError(SchedError::TableFull) => EAGAIN,
            Self::SchedError(SchedError::StackAllocFailed) => ENOMEM,
            Self::SchedError(_) => EINVAL,
            Self::FsError(FsError::BadFileDescriptor) => EBADF,
            Self::FsError(FsError::TooManyOpenFiles) => EMFILE,
            Self::FsError(_) => EIO,
            Self::NetError(NetError::NoFreeSockets) => ENFILE,
            Self::NetError(NetError::NotConnected) => ENOTCONN,
            Self::NetError(NetError::HostUnreachable) => EHOSTUNREACH,
            Self::NetError(NetError::AddressInUse) => EADDRINUSE,
            Self::NetError(NetError::ConnectionReset) => ECONNRESET,
            Self::NetError(NetError::ConnectionRefused) => ECONNREFUSED,
            Self::NetError(_) => EINVAL,
            Self::InvalidArgument { .. } => EINVAL,
            Self::ResourceExhausted { .. } => EAGAIN,
            Self::PermissionDenied { .. } => EPERM,
            Self::NotFound { .. } => ESRCH,
            Self::OperationNotSupported { .. } => ENOSYS,
            Self::WouldBlock => EAGAIN,
            Self::Interrupted => EINTR,
            Self::UnknownSyscall { .. } => ENOSYS,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidAddress { addr } => write!(f, "invalid address 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at 0x{:x}", addr),
            Self::BadUserPointer { addr, len } => {
                write!(f, "bad user pointer 0x{:x} (len {})", addr, len)
            }
            Self::TaskNotFound { id } => write!(f, "task {} not found", id),
            Self::NoChildren => write!(f, "no waitable children"),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::SchedError(e) => write!(f, "scheduler error: {:?}", e),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
            Self::NetError(e) => write!(f, "network error: {:?}", e),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Interrupted => write!(f, "interrupted by signal"),
            Self::UnknownSyscall { nr } => write!(f, "unknown syscall {}", nr),
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedError(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

impl From<NetError> for KernelError {
    fn from(err: NetError) -> Self {
        Self::NetError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_failure_classes() {
        assert_eq!(KernelError::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(
            KernelError::BadUserPointer { addr: 0, len: 8 }.errno(),
            errno::EFAULT
        );
        assert_eq!(
            KernelError::NetError(NetError::HostUnreachable).errno(),
            errno::EHOSTUNREACH
        );
        assert_eq!(KernelError::UnknownSyscall { nr: 999 }.errno(), errno::ENOSYS);
        assert_eq!(
            KernelError::PermissionDenied { operation: "kill" }.errno(),
            errno::EPERM
        );
    }
}
