//! Parses shared objects. We only need the dynamic symbol table, the soname,
//! the version definitions and an alias map, so we read the relevant tables
//! directly rather than going through a generic reader.

use crate::context::FileId;
use crate::context::INTERNAL_FILE_ID;
use crate::elf;
use crate::elf::sht;
use crate::error::Result;
use crate::object_file::InputName;
use crate::symbol::SymbolName;
use crate::symbol_db::SymbolId;
use anyhow::bail;
use anyhow::Context;
use bytemuck::Pod;
use std::sync::atomic::AtomicBool;

pub(crate) struct SharedFile<'data> {
    pub(crate) input: InputName,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,

    pub(crate) soname: String,
    pub(crate) dynsyms: Vec<elf::SymtabEntry>,
    dynstr: &'data [u8],
    versyms: Vec<u16>,

    /// Version strings by version index; index 0 and 1 are unused.
    pub(crate) version_strings: Vec<&'data [u8]>,

    /// The dynsym index backing each entry of `global_ids`.
    pub(crate) global_map: Vec<u32>,
    pub(crate) pending: Vec<SymbolName<'data>>,
    pub(crate) global_ids: Vec<SymbolId>,
}

impl<'data> SharedFile<'data> {
    pub(crate) fn parse(
        data: &'data [u8],
        name: String,
        as_needed: bool,
    ) -> Result<SharedFile<'data>> {
        let input = InputName { name };
        parse_impl(data, &input)
            .with_context(|| format!("Failed to parse shared object `{input}`"))
            .map(|mut file| {
                file.is_alive = AtomicBool::new(!as_needed);
                file
            })
    }

    pub(crate) fn dynsym(&self, index: u32) -> &elf::SymtabEntry {
        &self.dynsyms[index as usize]
    }

    pub(crate) fn symbol_name_bytes(&self, index: u32) -> &'data [u8] {
        cstr(self.dynstr, self.dynsym(index).name as usize)
    }

    /// The version index requested when importing dynsym `index`, with the
    /// hidden bit stripped.
    pub(crate) fn version_index(&self, index: u32) -> u16 {
        self.versyms
            .get(index as usize)
            .map(|v| v & !elf::VERSYM_HIDDEN)
            .unwrap_or(elf::VER_NDX_GLOBAL)
    }

    pub(crate) fn version_string(&self, ver_idx: u16) -> &'data [u8] {
        self.version_strings
            .get(usize::from(ver_idx))
            .copied()
            .unwrap_or_default()
    }

    /// Other defined dynamic symbols located at the same address as
    /// `sym_index`. Used to clone aliases when a copy relocation is created.
    pub(crate) fn find_aliases(&self, sym_index: u32) -> Vec<u32> {
        let value = self.dynsym(sym_index).value;
        self.global_map
            .iter()
            .copied()
            .filter(|&i| i != sym_index && self.dynsym(i).value == value)
            .collect()
    }
}

impl<'data> std::fmt::Display for SharedFile<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.input.fmt(f)
    }
}

fn parse_impl<'data>(data: &'data [u8], input: &InputName) -> Result<SharedFile<'data>> {
    let ehdr: elf::FileHeader = read_pod(data, 0)?;
    let shoff = ehdr.section_header_offset as usize;
    let shnum = ehdr.section_header_num as usize;
    let shdrs: Vec<elf::SectionHeader> = read_pods(data, shoff, shnum)?;

    let mut dynsym_shdr = None;
    let mut dynamic_shdr = None;
    let mut versym_shdr = None;
    let mut verdef_shdr = None;
    for shdr in &shdrs {
        match shdr.ty {
            sht::DYNSYM => dynsym_shdr = Some(shdr),
            sht::DYNAMIC => dynamic_shdr = Some(shdr),
            sht::GNU_VERSYM => versym_shdr = Some(shdr),
            sht::GNU_VERDEF => verdef_shdr = Some(shdr),
            _ => {}
        }
    }
    let Some(dynsym_shdr) = dynsym_shdr else {
        bail!("Shared object has no .dynsym");
    };

    let num_syms = (dynsym_shdr.size / elf::SYMTAB_ENTRY_SIZE) as usize;
    let dynsyms: Vec<elf::SymtabEntry> = read_pods(data, dynsym_shdr.offset as usize, num_syms)?;
    let dynstr = section_data(data, &shdrs, dynsym_shdr.link as usize)?;

    let versyms = match versym_shdr {
        Some(shdr) => read_pods::<u16>(data, shdr.offset as usize, num_syms)?,
        None => Vec::new(),
    };

    let soname = match dynamic_shdr {
        Some(shdr) => {
            let strtab = section_data(data, &shdrs, shdr.link as usize)?;
            let entries: Vec<elf::DynamicEntry> =
                read_pods(data, shdr.offset as usize, (shdr.size / 16) as usize)?;
            entries
                .iter()
                .find(|e| e.tag == elf::DynamicTag::SoName as u64)
                .map(|e| String::from_utf8_lossy(cstr(strtab, e.value as usize)).into_owned())
        }
        None => None,
    };
    let soname = soname.unwrap_or_else(|| {
        std::path::Path::new(&input.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.name.clone())
    });

    let version_strings = match verdef_shdr {
        Some(shdr) => {
            let strtab = section_data(data, &shdrs, shdr.link as usize)?;
            read_version_definitions(data, shdr, strtab)?
        }
        None => Vec::new(),
    };

    // Defined, non-local dynamic symbols are what this file can contribute to
    // resolution.
    let mut pending = Vec::new();
    let mut global_map = Vec::new();
    for (i, sym) in dynsyms.iter().enumerate().skip(1) {
        let bind = sym.info >> 4;
        if bind == elf::st::BIND_LOCAL || sym.shndx == elf::shn::UNDEF {
            continue;
        }
        pending.push(SymbolName::new(cstr(dynstr, sym.name as usize)));
        global_map.push(i as u32);
    }

    Ok(SharedFile {
        input: InputName {
            name: input.name.clone(),
        },
        file_id: INTERNAL_FILE_ID,
        priority: 0,
        is_alive: AtomicBool::new(true),
        soname,
        dynsyms,
        dynstr,
        versyms,
        version_strings,
        global_map,
        pending,
        global_ids: Vec::new(),
    })
}

/// Walks the Verdef chain, recording each version's name by index.
fn read_version_definitions<'data>(
    data: &'data [u8],
    shdr: &elf::SectionHeader,
    strtab: &'data [u8],
) -> Result<Vec<&'data [u8]>> {
    let mut strings = Vec::new();
    let mut offset = shdr.offset as usize;
    let count = shdr.info;
    for _ in 0..count {
        let verdef: elf::Verdef = read_pod(data, offset)?;
        let aux: elf::Verdaux = read_pod(data, offset + verdef.vd_aux as usize)?;
        let ndx = usize::from(verdef.vd_ndx);
        if strings.len() <= ndx {
            strings.resize(ndx + 1, &[] as &[u8]);
        }
        strings[ndx] = cstr(strtab, aux.vda_name as usize);
        if verdef.vd_next == 0 {
            break;
        }
        offset += verdef.vd_next as usize;
    }
    Ok(strings)
}

fn section_data<'data>(
    data: &'data [u8],
    shdrs: &[elf::SectionHeader],
    index: usize,
) -> Result<&'data [u8]> {
    let Some(shdr) = shdrs.get(index) else {
        bail!("Section link {index} out of range");
    };
    let start = shdr.offset as usize;
    let end = start + shdr.size as usize;
    data.get(start..end)
        .with_context(|| format!("Section {index} extends past end of file"))
}

fn read_pod<T: Pod>(data: &[u8], offset: usize) -> Result<T> {
    let size = core::mem::size_of::<T>();
    let bytes = data
        .get(offset..offset + size)
        .with_context(|| format!("Read of {size} bytes at {offset} is out of bounds"))?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

fn read_pods<T: Pod>(data: &[u8], offset: usize, count: usize) -> Result<Vec<T>> {
    let size = core::mem::size_of::<T>();
    (0..count)
        .map(|i| read_pod(data, offset + i * size))
        .collect()
}

fn cstr(data: &[u8], offset: usize) -> &[u8] {
    let Some(rest) = data.get(offset..) else {
        return &[];
    };
    let end = memchr::memchr(0, rest).unwrap_or(rest.len());
    &rest[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstr() {
        assert_eq!(cstr(b"abc\0def\0", 0), b"abc");
        assert_eq!(cstr(b"abc\0def\0", 4), b"def");
        assert_eq!(cstr(b"abc", 10), b"");
    }

    #[test]
    fn test_read_pod_bounds() {
        assert!(read_pod::<elf::SymtabEntry>(&[0u8; 8], 0).is_err());
        assert!(read_pod::<u16>(&[1u8, 0], 0).is_ok());
    }
}
