//! ELF64 image loading
//!
//! Parses static ELF64 executables into their loadable segments. Program
//! images come from an embedded registry populated at boot; the VFS that
//! would normally supply them is outside this kernel's scope.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    mm::vas::VmaFlags,
    sync::SpinLock,
};

/// ELF magic number
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// ELF file header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    magic: [u8; 4],
    class: u8,
    data: u8,
    version: u8,
    os_abi: u8,
    abi_version: u8,
    padding: [u8; 7],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// Program header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// One PT_LOAD segment, ready to be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub file_size: u64,
    pub file_offset: u64,
    pub flags: VmaFlags,
}

/// Parsed executable.
#[derive(Debug, Clone)]
pub struct ElfImage {
    pub entry: u64,
    pub segments: Vec<LoadSegment>,
}

impl ElfImage {
    /// Highest address any segment reaches; the initial program break.
    pub fn image_end(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.vaddr + s.mem_size)
            .max()
            .unwrap_or(0)
    }
}

fn read_struct<T: Copy>(data: &[u8], offset: usize) -> KernelResult<T> {
    let size = core::mem::size_of::<T>();
    let end = offset.checked_add(size).ok_or(KernelError::InvalidArgument {
        name: "elf",
        value: "offset overflow",
    })?;
    if end > data.len() {
        return Err(KernelError::InvalidArgument {
            name: "elf",
            value: "truncated",
        });
    }
    // SAFETY: bounds were checked; T is a plain repr(C) struct read from
    // an unaligned byte buffer.
    Ok(unsafe { core::ptr::read_unaligned(data[offset..].as_ptr() as *const T) })
}

/// Parse and validate a static ELF64 executable.
pub fn parse(data: &[u8]) -> KernelResult<ElfImage> {
    let header: Elf64Header = read_struct(data, 0)?;

    if header.magic != ELF_MAGIC {
        return Err(KernelError::InvalidArgument {
            name: "elf",
            value: "bad magic",
        });
    }
    if header.class != ELFCLASS64 || header.data != ELFDATA2LSB {
        return Err(KernelError::InvalidArgument {
            name: "elf",
            value: "not little-endian ELF64",
        });
    }
    if header.e_type != ET_EXEC || header.e_machine != EM_X86_64 {
        return Err(KernelError::InvalidArgument {
            name: "elf",
            value: "not an x86_64 executable",
        });
    }
    if header.e_phentsize as usize != core::mem::size_of::<Elf64ProgramHeader>() {
        return Err(KernelError::InvalidArgument {
            name: "elf",
            value: "bad phentsize",
        });
    }

    let mut segments = Vec::new();
    for i in 0..header.e_phnum as usize {
        let offset = header.e_phoff as usize + i * header.e_phentsize as usize;
        let ph: Elf64ProgramHeader = read_struct(data, offset)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(KernelError::InvalidArgument {
                name: "elf",
                value: "filesz exceeds memsz",
            });
        }
        if (ph.p_offset + ph.p_filesz) as usize > data.len() {
            return Err(KernelError::InvalidArgument {
                name: "elf",
                value: "segment outside file",
            });
        }

        let mut flags = VmaFlags::empty();
        if ph.p_flags & PF_R != 0 {
            flags |= VmaFlags::READ;
        }
        if ph.p_flags & PF_W != 0 {
            flags |= VmaFlags::WRITE;
        }
        if ph.p_flags & PF_X != 0 {
            flags |= VmaFlags::EXEC;
        }

        segments.push(LoadSegment {
            vaddr: ph.p_vaddr,
            mem_size: ph.p_memsz,
            file_size: ph.p_filesz,
            file_offset: ph.p_offset,
            flags,
        });
    }

    if segments.is_empty() {
        return Err(KernelError::InvalidArgument {
            name: "elf",
            value: "no loadable segments",
        });
    }

    Ok(ElfImage {
        entry: header.e_entry,
        segments,
    })
}

// ---------------------------------------------------------------------------
// Embedded image registry
// ---------------------------------------------------------------------------

static IMAGES: SpinLock<Vec<(String, &'static [u8])>> = SpinLock::new(Vec::new());

/// Register an embedded program image under `path`.
pub fn register_image(path: &str, image: &'static [u8]) {
    let mut images = IMAGES.lock();
    images.retain(|(name, _)| name != path);
    images.push((String::from(path), image));
}

/// Look up an embedded program image.
pub fn find_image(path: &str) -> Option<&'static [u8]> {
    IMAGES
        .lock()
        .iter()
        .find(|(name, _)| name == path)
        .map(|(_, image)| *image)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ELF64 executable with one PT_LOAD segment.
    fn minimal_elf(entry: u64, vaddr: u64, payload: &[u8]) -> Vec<u8> {
        let mut file = alloc::vec![0u8; 0x78 + 0x38];
        file[0..4].copy_from_slice(&ELF_MAGIC);
        file[4] = ELFCLASS64;
        file[5] = ELFDATA2LSB;
        file[6] = 1; // version
        file[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        file[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        file[24..32].copy_from_slice(&entry.to_le_bytes());
        file[32..40].copy_from_slice(&0x40u64.to_le_bytes()); // phoff
        file[54..56].copy_from_slice(&0x38u16.to_le_bytes()); // phentsize
        file[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let data_offset = file.len() as u64;
        // Program header at 0x40
        file[0x40..0x44].copy_from_slice(&PT_LOAD.to_le_bytes());
        file[0x44..0x48].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        file[0x48..0x50].copy_from_slice(&data_offset.to_le_bytes());
        file[0x50..0x58].copy_from_slice(&vaddr.to_le_bytes());
        file[0x60..0x68].copy_from_slice(&(payload.len() as u64).to_le_bytes()); // filesz
        file[0x68..0x70].copy_from_slice(&(payload.len() as u64 + 0x100).to_le_bytes()); // memsz

        file.extend_from_slice(payload);
        file
    }

    #[test]
    fn parses_minimal_executable() {
        let elf = minimal_elf(0x40_1000, 0x40_0000, b"\x90\x90\xC3");
        let image = parse(&elf).unwrap();
        assert_eq!(image.entry, 0x40_1000);
        assert_eq!(image.segments.len(), 1);

        let seg = &image.segments[0];
        assert_eq!(seg.vaddr, 0x40_0000);
        assert_eq!(seg.file_size, 3);
        assert_eq!(seg.mem_size, 3 + 0x100);
        assert!(seg.flags.contains(VmaFlags::EXEC));
        assert!(!seg.flags.contains(VmaFlags::WRITE));
        assert_eq!(image.image_end(), 0x40_0000 + 3 + 0x100);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut elf = minimal_elf(0, 0, b"");
        elf[0] = 0x00;
        assert!(parse(&elf).is_err());
    }

    #[test]
    fn rejects_filesz_beyond_memsz() {
        let mut elf = minimal_elf(0x1000, 0x1000, b"abcd");
        // memsz below filesz
        elf[0x68..0x70].copy_from_slice(&1u64.to_le_bytes());
        assert!(parse(&elf).is_err());
    }

    #[test]
    fn image_registry_lookup() {
        static PAYLOAD: [u8; 4] = [1, 2, 3, 4];
        register_image("/bin/init", &PAYLOAD);
        assert_eq!(find_image("/bin/init"), Some(&PAYLOAD[..]));
        assert_eq!(find_image("/bin/other"), None);
    }
}
