use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use object::LittleEndian;

/// Our starting address in memory when linking non-relocatable executables.
/// The same as what ld picks. A distinctive non-zero value also makes it more
/// obvious what's happening if we mix up file and memory offsets.
pub(crate) const NON_PIE_START_MEM_ADDRESS: u64 = 0x400_000;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

pub(crate) type File<'data> = object::read::elf::ElfFile64<'data, LittleEndian, &'data [u8]>;
pub(crate) type Section<'data, 'file> =
    object::read::elf::ElfSection64<'data, 'file, LittleEndian, &'data [u8]>;
pub(crate) type Symbol<'data, 'file> =
    object::read::elf::ElfSymbol64<'data, 'file, LittleEndian, &'data [u8]>;

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct FileHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) class: u8,
    pub(crate) data: u8,
    pub(crate) ei_version: u8,
    pub(crate) os_abi: u8,
    pub(crate) abi_version: u8,
    pub(crate) padding: [u8; 7],
    pub(crate) ty: u16,
    pub(crate) machine: u16,
    pub(crate) e_version: u32,
    pub(crate) entry_point: u64,
    pub(crate) program_header_offset: u64,
    pub(crate) section_header_offset: u64,
    pub(crate) flags: u32,
    pub(crate) ehsize: u16,
    pub(crate) program_header_entry_size: u16,
    pub(crate) program_header_num: u16,
    pub(crate) section_header_entry_size: u16,
    pub(crate) section_header_num: u16,
    pub(crate) section_names_index: u16,
}

#[derive(Zeroable, Pod, Clone, Copy, Default, Debug)]
#[repr(C)]
pub(crate) struct SectionHeader {
    pub(crate) name: u32,
    pub(crate) ty: u32,
    pub(crate) flags: u64,
    pub(crate) address: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) link: u32,
    pub(crate) info: u32,
    pub(crate) alignment: u64,
    pub(crate) entsize: u64,
}

#[derive(Zeroable, Pod, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct ProgramHeader {
    pub(crate) segment_type: u32,
    pub(crate) flags: u32,
    pub(crate) offset: u64,
    pub(crate) virtual_addr: u64,
    pub(crate) physical_addr: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) alignment: u64,
}

#[derive(Zeroable, Pod, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct SymtabEntry {
    pub(crate) name: u32,
    pub(crate) info: u8,
    pub(crate) other: u8,
    pub(crate) shndx: u16,
    pub(crate) value: u64,
    pub(crate) size: u64,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct DynamicEntry {
    pub(crate) tag: u64,
    pub(crate) value: u64,
}

#[derive(Zeroable, Pod, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct Rela {
    pub(crate) address: u64,
    pub(crate) info: u64,
    pub(crate) addend: i64,
}

impl Rela {
    pub(crate) fn new(address: u64, r_type: u32, dynsym_idx: u32, addend: i64) -> Rela {
        Rela {
            address,
            info: (u64::from(dynsym_idx) << 32) | u64::from(r_type),
            addend,
        }
    }
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct Verneed {
    pub(crate) vn_version: u16,
    pub(crate) vn_cnt: u16,
    pub(crate) vn_file: u32,
    pub(crate) vn_aux: u32,
    pub(crate) vn_next: u32,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct Vernaux {
    pub(crate) vna_hash: u32,
    pub(crate) vna_flags: u16,
    pub(crate) vna_other: u16,
    pub(crate) vna_name: u32,
    pub(crate) vna_next: u32,
}

/// Version definition records as found in a DSO's .gnu.version_d.
#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct Verdef {
    pub(crate) vd_version: u16,
    pub(crate) vd_flags: u16,
    pub(crate) vd_ndx: u16,
    pub(crate) vd_cnt: u16,
    pub(crate) vd_hash: u32,
    pub(crate) vd_aux: u32,
    pub(crate) vd_next: u32,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct Verdaux {
    pub(crate) vda_name: u32,
    pub(crate) vda_next: u32,
}

pub(crate) const VER_NDX_LOCAL: u16 = 0;
pub(crate) const VER_NDX_GLOBAL: u16 = 1;
pub(crate) const VERSYM_HIDDEN: u16 = 0x8000;

/// Section flag bit values.
#[allow(unused)]
pub(crate) mod shf {
    pub(crate) const WRITE: u64 = 0x1;
    pub(crate) const ALLOC: u64 = 0x2;
    pub(crate) const EXECINSTR: u64 = 0x4;
    pub(crate) const MERGE: u64 = 0x10;
    pub(crate) const STRINGS: u64 = 0x20;
    pub(crate) const INFO_LINK: u64 = 0x40;
    pub(crate) const GROUP: u64 = 0x200;
    pub(crate) const TLS: u64 = 0x400;
    pub(crate) const EXCLUDE: u64 = 0x8000_0000;
}

/// Section types.
#[allow(unused)]
pub(crate) mod sht {
    pub(crate) const NULL: u32 = 0x0;
    pub(crate) const PROGBITS: u32 = 0x1;
    pub(crate) const SYMTAB: u32 = 0x2;
    pub(crate) const STRTAB: u32 = 0x3;
    pub(crate) const RELA: u32 = 0x4;
    pub(crate) const HASH: u32 = 0x5;
    pub(crate) const DYNAMIC: u32 = 0x6;
    pub(crate) const NOTE: u32 = 0x7;
    pub(crate) const NOBITS: u32 = 0x8;
    pub(crate) const REL: u32 = 0x9;
    pub(crate) const DYNSYM: u32 = 0xb;
    pub(crate) const INIT_ARRAY: u32 = 0xe;
    pub(crate) const FINI_ARRAY: u32 = 0xf;
    pub(crate) const PREINIT_ARRAY: u32 = 0x10;
    pub(crate) const GROUP: u32 = 0x11;
    pub(crate) const GNU_HASH: u32 = 0x6fff_fff6;
    pub(crate) const GNU_VERDEF: u32 = 0x6fff_fffd;
    pub(crate) const GNU_VERNEED: u32 = 0x6fff_fffe;
    pub(crate) const GNU_VERSYM: u32 = 0x6fff_ffff;
}

/// Segment types.
#[allow(unused)]
pub(crate) mod pt {
    pub(crate) const NULL: u32 = 0;
    pub(crate) const LOAD: u32 = 1;
    pub(crate) const DYNAMIC: u32 = 2;
    pub(crate) const INTERP: u32 = 3;
    pub(crate) const NOTE: u32 = 4;
    pub(crate) const PHDR: u32 = 6;
    pub(crate) const TLS: u32 = 7;
    pub(crate) const GNU_STACK: u32 = 0x6474_e551;
}

pub(crate) mod pf {
    pub(crate) const X: u32 = 1;
    pub(crate) const W: u32 = 2;
    pub(crate) const R: u32 = 4;
}

/// Symbol bindings and types, as packed into st_info.
#[allow(unused)]
pub(crate) mod st {
    pub(crate) const BIND_LOCAL: u8 = 0;
    pub(crate) const BIND_GLOBAL: u8 = 1;
    pub(crate) const BIND_WEAK: u8 = 2;

    pub(crate) const TYPE_NOTYPE: u8 = 0;
    pub(crate) const TYPE_OBJECT: u8 = 1;
    pub(crate) const TYPE_FUNC: u8 = 2;
    pub(crate) const TYPE_SECTION: u8 = 3;
    pub(crate) const TYPE_FILE: u8 = 4;
    pub(crate) const TYPE_COMMON: u8 = 5;
    pub(crate) const TYPE_TLS: u8 = 6;
    pub(crate) const TYPE_GNU_IFUNC: u8 = 10;

    pub(crate) const fn info(bind: u8, ty: u8) -> u8 {
        (bind << 4) | ty
    }
}

#[allow(unused)]
pub(crate) mod shn {
    pub(crate) const UNDEF: u16 = 0;
    pub(crate) const ABS: u16 = 0xfff1;
    pub(crate) const COMMON: u16 = 0xfff2;
}

#[allow(unused)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum DynamicTag {
    Null = 0,
    Needed = 1,
    PltRelSize = 2,
    PltGot = 3,
    Hash = 4,
    StrTab = 5,
    SymTab = 6,
    Rela = 7,
    RelaSize = 8,
    RelaEnt = 9,
    StrSize = 10,
    SymEnt = 11,
    SoName = 14,
    Rpath = 15,
    PltRel = 20,
    Debug = 21,
    JmpRel = 23,
    BindNow = 24,
    InitArray = 25,
    FiniArray = 26,
    InitArraySize = 27,
    FiniArraySize = 28,
    RunPath = 29,
    Flags = 30,
    VerNeed = 0x6fff_fffe,
    VerNeedNum = 0x6fff_ffff,
    VerSym = 0x6fff_fff0,
    Flags1 = 0x6fff_fffb,
}

pub(crate) mod flags {
    pub(crate) const BIND_NOW: u64 = 0x8;
}

pub(crate) mod flags_1 {
    pub(crate) const NOW: u64 = 0x1;
    pub(crate) const PIE: u64 = 0x0800_0000;
}

/// Offset in the file where we store the program headers. We always store
/// these straight after the file header.
pub(crate) const PHEADER_OFFSET: u64 = FILE_HEADER_SIZE as u64;

/// These sizes are from the spec (for 64 bit ELF).
pub(crate) const FILE_HEADER_SIZE: u16 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u16 = 0x40;

pub(crate) const GOT_ENTRY_SIZE: u64 = 0x8;
pub(crate) const PLT_ENTRY_SIZE: u64 = PLT_ENTRY_TEMPLATE.len() as u64;
pub(crate) const RELA_ENTRY_SIZE: u64 = 0x18;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = core::mem::size_of::<SymtabEntry>() as u64;

pub(crate) const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xf2, 0xff, 0x25, 0x0, 0x0, 0x0, 0x0, // bnd jmp *{relative GOT address}(%rip)
    0x0f, 0x1f, 0x44, 0x0, 0x0, // nopl   0x0(%rax,%rax,1)
];

const _ASSERTS: () = {
    assert!(FILE_HEADER_SIZE as usize == std::mem::size_of::<FileHeader>());
    assert!(PROGRAM_HEADER_SIZE as usize == std::mem::size_of::<ProgramHeader>());
    assert!(SECTION_HEADER_SIZE as usize == std::mem::size_of::<SectionHeader>());
    assert!(RELA_ENTRY_SIZE as usize == std::mem::size_of::<Rela>());
    assert!(std::mem::size_of::<Verneed>() == 16);
    assert!(std::mem::size_of::<Vernaux>() == 16);
};

/// The hash function used by the .hash section and by .gnu.version_r
/// vna_hash fields.
pub(crate) fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in name {
        h = h.wrapping_mul(16).wrapping_add(u32::from(byte));
        h ^= (h >> 24) & 0xf0;
    }
    h & 0x0fff_ffff
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocationKind {
    Absolute,
    Relative,
    Got,
    PltRelative,
    GotRelative,
    TlsGd,
    TlsLd,
    DtpOff,
    GotTpOff,
    TpOff,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RelocationKindInfo {
    pub(crate) kind: RelocationKind,
    pub(crate) byte_size: usize,
}

impl RelocationKindInfo {
    pub(crate) fn from_raw(r_type: u32) -> Result<Self> {
        let (kind, size) = match r_type {
            rel::R_X86_64_64 => (RelocationKind::Absolute, 8),
            rel::R_X86_64_PC32 => (RelocationKind::Relative, 4),
            rel::R_X86_64_GOT32 => (RelocationKind::Got, 4),
            rel::R_X86_64_PLT32 => (RelocationKind::PltRelative, 4),
            rel::R_X86_64_GOTPCREL => (RelocationKind::GotRelative, 4),
            rel::R_X86_64_32 | rel::R_X86_64_32S => (RelocationKind::Absolute, 4),
            rel::R_X86_64_16 => (RelocationKind::Absolute, 2),
            rel::R_X86_64_PC16 => (RelocationKind::Relative, 2),
            rel::R_X86_64_8 => (RelocationKind::Absolute, 1),
            rel::R_X86_64_PC8 => (RelocationKind::Relative, 1),
            rel::R_X86_64_PC64 => (RelocationKind::Relative, 8),
            rel::R_X86_64_TLSGD => (RelocationKind::TlsGd, 4),
            rel::R_X86_64_TLSLD => (RelocationKind::TlsLd, 4),
            rel::R_X86_64_DTPOFF32 => (RelocationKind::DtpOff, 4),
            rel::R_X86_64_GOTTPOFF => (RelocationKind::GotTpOff, 4),
            rel::R_X86_64_GOTPCRELX | rel::R_X86_64_REX_GOTPCRELX => {
                (RelocationKind::GotRelative, 4)
            }
            rel::R_X86_64_TPOFF32 => (RelocationKind::TpOff, 4),
            _ => bail!("Unsupported relocation type {r_type}"),
        };
        Ok(Self {
            kind,
            byte_size: size,
        })
    }
}

#[allow(dead_code)]
pub(crate) mod rel {
    pub(crate) const R_X86_64_64: u32 = 1;
    pub(crate) const R_X86_64_PC32: u32 = 2;
    pub(crate) const R_X86_64_GOT32: u32 = 3;
    pub(crate) const R_X86_64_PLT32: u32 = 4;
    pub(crate) const R_X86_64_COPY: u32 = 5;
    pub(crate) const R_X86_64_GLOB_DAT: u32 = 6;
    pub(crate) const R_X86_64_JUMP_SLOT: u32 = 7;
    pub(crate) const R_X86_64_RELATIVE: u32 = 8;
    pub(crate) const R_X86_64_GOTPCREL: u32 = 9;
    pub(crate) const R_X86_64_32: u32 = 10;
    pub(crate) const R_X86_64_32S: u32 = 11;
    pub(crate) const R_X86_64_16: u32 = 12;
    pub(crate) const R_X86_64_PC16: u32 = 13;
    pub(crate) const R_X86_64_8: u32 = 14;
    pub(crate) const R_X86_64_PC8: u32 = 15;
    pub(crate) const R_X86_64_DTPMOD64: u32 = 16;
    pub(crate) const R_X86_64_DTPOFF64: u32 = 17;
    pub(crate) const R_X86_64_TPOFF64: u32 = 18;
    pub(crate) const R_X86_64_TLSGD: u32 = 19;
    pub(crate) const R_X86_64_TLSLD: u32 = 20;
    pub(crate) const R_X86_64_DTPOFF32: u32 = 21;
    pub(crate) const R_X86_64_GOTTPOFF: u32 = 22;
    pub(crate) const R_X86_64_TPOFF32: u32 = 23;
    pub(crate) const R_X86_64_PC64: u32 = 24;
    pub(crate) const R_X86_64_IRELATIVE: u32 = 37;
    pub(crate) const R_X86_64_GOTPCRELX: u32 = 41;
    pub(crate) const R_X86_64_REX_GOTPCRELX: u32 = 42;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_hash() {
        // Reference values from the System V ABI.
        assert_eq!(sysv_hash(b""), 0);
        assert_eq!(sysv_hash(b"printf"), 0x077905a6);
        assert_eq!(sysv_hash(b"exit"), 0x0006cf04);
    }

    #[test]
    fn test_rela_info_packing() {
        let r = Rela::new(0x1000, rel::R_X86_64_JUMP_SLOT, 3, -4);
        assert_eq!(r.info >> 32, 3);
        assert_eq!(r.info & 0xffff_ffff, u64::from(rel::R_X86_64_JUMP_SLOT));
        assert_eq!(r.addend, -4);
    }
}
