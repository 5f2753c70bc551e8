use crate::context::FileId;
use std::fmt::Display;
use std::hash::Hasher;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// Requirement bits set during the relocation scan. Each bit requests an
/// entry in one of the synthetic output sections.
pub(crate) mod flags {
    pub(crate) const NEEDS_GOT: u8 = 1 << 0;
    pub(crate) const NEEDS_PLT: u8 = 1 << 1;
    pub(crate) const NEEDS_GOTTPOFF: u8 = 1 << 2;
    pub(crate) const NEEDS_TLSGD: u8 = 1 << 3;
    pub(crate) const NEEDS_TLSLD: u8 = 1 << 4;
    pub(crate) const NEEDS_COPYREL: u8 = 1 << 5;
    pub(crate) const NEEDS_DYNSYM: u8 = 1 << 6;
}

/// Identifies the definition of an interned symbol: the file that currently
/// defines it and the symbol's index within that file's symbol table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Owner {
    pub(crate) file: FileId,
    pub(crate) sym_index: u32,
}

const NO_OWNER: u64 = u64::MAX;

/// A symbol interned by name. One instance exists per distinct global symbol
/// name for the whole link.
///
/// `owner` and `flags` are written from parallel phases (resolution and the
/// relocation scan); everything else is only written from single-threaded
/// passes or by the file that owns the symbol.
pub(crate) struct Symbol {
    owner: AtomicU64,
    pub(crate) flags: AtomicU8,
    pub(crate) ver_idx: AtomicU16,

    /// For synthetic symbols this is the output address once layout has run.
    /// For copy-relocated symbols it's first the offset within .bss, then the
    /// final address.
    pub(crate) value: u64,

    /// Output section index, for symbols whose address isn't derived from an
    /// input section.
    pub(crate) shndx: u32,

    pub(crate) got_idx: i32,
    pub(crate) plt_idx: i32,
    pub(crate) gottpoff_idx: i32,
    pub(crate) tlsgd_idx: i32,
    pub(crate) dynsym_idx: i32,

    pub(crate) is_imported: bool,
    pub(crate) has_copyrel: bool,
    pub(crate) traced: bool,
}

impl Symbol {
    pub(crate) fn new() -> Symbol {
        Symbol {
            owner: AtomicU64::new(NO_OWNER),
            flags: AtomicU8::new(0),
            ver_idx: AtomicU16::new(crate::elf::VER_NDX_LOCAL),
            value: 0,
            shndx: 0,
            got_idx: -1,
            plt_idx: -1,
            gottpoff_idx: -1,
            tlsgd_idx: -1,
            dynsym_idx: -1,
            is_imported: false,
            has_copyrel: false,
            traced: false,
        }
    }

    pub(crate) fn owner(&self) -> Option<Owner> {
        unpack_owner(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn load_owner_packed(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn compare_exchange_owner(&self, current: u64, new: Owner) -> Result<(), u64> {
        self.owner
            .compare_exchange_weak(current, pack_owner(new), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    pub(crate) fn set_owner(&self, new: Owner) {
        self.owner.store(pack_owner(new), Ordering::Release);
    }

    pub(crate) fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub(crate) fn flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    pub(crate) fn ver_idx(&self) -> u16 {
        self.ver_idx.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ver_idx(&self, v: u16) {
        self.ver_idx.store(v, Ordering::Relaxed);
    }
}

fn pack_owner(owner: Owner) -> u64 {
    (u64::from(owner.file.as_u32()) << 32) | u64::from(owner.sym_index)
}

pub(crate) fn unpack_owner(packed: u64) -> Option<Owner> {
    if packed == NO_OWNER {
        return None;
    }
    Some(Owner {
        file: FileId::new((packed >> 32) as u32),
        sym_index: packed as u32,
    })
}

/// A symbol name with a precomputed hash. We can hash names while running in
/// multiple threads, saving the time needed to hash them when building the
/// symbol table, which is single threaded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    hash: u64,
    bytes: &'data [u8],
}

impl<'data> std::hash::Hash for SymbolName<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // We don't hash bytes because hash is already a hash of the bytes.
        self.hash.hash(state);
    }
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self {
            bytes,
            hash: crate::hash::hash_bytes(bytes),
        }
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl<'data> Display for SymbolName<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        String::from_utf8_lossy(self.bytes).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_packing() {
        let owner = Owner {
            file: FileId::new(7),
            sym_index: 42,
        };
        assert_eq!(unpack_owner(pack_owner(owner)), Some(owner));
        assert_eq!(unpack_owner(NO_OWNER), None);
    }

    #[test]
    fn test_owner_cas() {
        let sym = Symbol::new();
        assert!(sym.owner().is_none());
        let owner = Owner {
            file: FileId::new(3),
            sym_index: 1,
        };
        assert!(sym.compare_exchange_owner(NO_OWNER, owner).is_ok());
        assert_eq!(sym.owner(), Some(owner));
    }
}
