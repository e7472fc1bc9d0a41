//! File descriptor tables
//!
//! Small fixed tables shared per thread group. With the VFS out of tree,
//! descriptors name either the console or a socket handle; the table
//! itself is what fork clones and threads share.

use crate::error::{FsError, KernelResult};

/// Descriptors per table.
pub const MAX_FDS: usize = 32;

/// What a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileObject {
    /// Serial console (stdin/stdout/stderr).
    Console,
    /// A socket slot handle.
    Socket(usize),
}

#[derive(Debug, Clone)]
pub struct FdTable {
    slots: [Option<FileObject>; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_FDS],
        }
    }

    /// Standard layout: fds 0-2 wired to the console.
    pub fn with_console() -> Self {
        let mut table = Self::new();
        table.slots[0] = Some(FileObject::Console);
        table.slots[1] = Some(FileObject::Console);
        table.slots[2] = Some(FileObject::Console);
        table
    }

    /// Install `obj` in the lowest free slot.
    pub fn allocate(&mut self, obj: FileObject) -> KernelResult<usize> {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(obj);
                return Ok(fd);
            }
        }
        Err(FsError::TooManyOpenFiles.into())
    }

    pub fn get(&self, fd: usize) -> KernelResult<FileObject> {
        self.slots
            .get(fd)
            .copied()
            .flatten()
            .ok_or(FsError::BadFileDescriptor.into())
    }

    /// Release a descriptor, returning what it named.
    pub fn close(&mut self, fd: usize) -> KernelResult<FileObject> {
        let slot = self
            .slots
            .get_mut(fd)
            .ok_or(crate::error::KernelError::from(FsError::BadFileDescriptor))?;
        slot.take().ok_or(FsError::BadFileDescriptor.into())
    }

    /// All live socket handles (used at process teardown).
    pub fn sockets(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Some(FileObject::Socket(handle)) => Some(*handle),
            _ => None,
        })
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_occupies_standard_fds() {
        let table = FdTable::with_console();
        assert_eq!(table.get(0).unwrap(), FileObject::Console);
        assert_eq!(table.get(2).unwrap(), FileObject::Console);
        assert!(table.get(3).is_err());
    }

    #[test]
    fn allocate_reuses_lowest_closed_slot() {
        let mut table = FdTable::with_console();
        let fd = table.allocate(FileObject::Socket(7)).unwrap();
        assert_eq!(fd, 3);
        table.close(1).unwrap();
        assert_eq!(table.allocate(FileObject::Socket(9)).unwrap(), 1);
    }

    #[test]
    fn close_is_single_shot() {
        let mut table = FdTable::with_console();
        table.close(0).unwrap();
        assert!(table.close(0).is_err());
    }

    #[test]
    fn clone_shares_nothing() {
        let mut table = FdTable::with_console();
        let snapshot = table.clone();
        table.close(0).unwrap();
        assert!(snapshot.get(0).is_ok(), "clone is an independent copy");
    }
}
