//! The output image: one `Chunk` per thing that occupies space in the output
//! file. Chunks are either headers (ELF/program/section header tables),
//! regular output sections aggregating input sections, merged string
//! sections, or synthetic sections the linker fabricates (GOT, PLT, dynamic
//! tables and friends). Every chunk owns a section header; `copy_buf` writes
//! the chunk's bytes into its own slice of the output buffer and nothing
//! else.

use crate::context::Context;
use crate::context::InputFile;
use crate::elf;
use crate::elf::shf;
use crate::elf::sht;
use crate::elf::DynamicTag;
use crate::error::Result;
use crate::layout::section_rank;
use crate::layout::OutputSec;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::resolution::owned_symbol_address;
use crate::symbol_db::SymbolId;
use ahash::AHashMap;
use anyhow::Context as _;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use object::RelocationTarget;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkKind {
    Ehdr,
    Phdr,
    Shdr,
    Interp,
    Regular(u32),
    Merged(u32),
    Got,
    GotPlt,
    Plt,
    RelPlt,
    RelDyn,
    Dynamic,
    Dynsym,
    Dynstr,
    Symtab,
    Strtab,
    Shstrtab,
    Hash,
    Versym,
    Verneed,
    Copyrel,
}

impl ChunkKind {
    pub(crate) fn is_header(self) -> bool {
        matches!(self, ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr)
    }
}

pub(crate) struct Chunk<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) kind: ChunkKind,
    pub(crate) shdr: elf::SectionHeader,
    pub(crate) shndx: u32,
    pub(crate) starts_new_ptload: bool,
}

impl<'data> Chunk<'data> {
    fn new(name: &'data [u8], kind: ChunkKind, ty: u32, flags: u64, alignment: u64) -> Chunk<'data> {
        Chunk {
            name,
            kind,
            shdr: elf::SectionHeader {
                ty,
                flags,
                alignment,
                ..Default::default()
            },
            shndx: 0,
            starts_new_ptload: false,
        }
    }
}

/// A string table under construction (.dynstr, .shstrtab).
pub(crate) struct StringTable {
    bytes: Vec<u8>,
    offsets: AHashMap<Vec<u8>, u32>,
}

impl StringTable {
    fn new() -> StringTable {
        StringTable {
            bytes: vec![0],
            offsets: AHashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, s: &[u8]) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s);
        self.bytes.push(0);
        self.offsets.insert(s.to_vec(), offset);
        offset
    }

    pub(crate) fn get(&self, s: &[u8]) -> u32 {
        if s.is_empty() {
            return 0;
        }
        self.offsets.get(s).copied().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum GotEntryKind {
    /// One slot holding the symbol's address (or a GLOB_DAT fixup).
    Regular,
    /// One slot holding the symbol's TP-relative offset.
    TpOff,
    /// A module-id/offset pair for general-dynamic TLS.
    TlsGd,
    /// The shared module-id pair for local-dynamic TLS.
    TlsLd,
}

pub(crate) struct GotEntry {
    /// None only for the shared TLSLD module-id pair.
    pub(crate) sym: Option<SymbolId>,
    pub(crate) kind: GotEntryKind,
    pub(crate) slot: u32,
}

#[derive(Default)]
pub(crate) struct GotSection {
    pub(crate) entries: Vec<GotEntry>,
    pub(crate) num_slots: u32,
    pub(crate) tlsld_slot: i32,
}

impl GotSection {
    pub(crate) fn add(&mut self, sym: Option<SymbolId>, kind: GotEntryKind) -> u32 {
        let slot = self.num_slots;
        self.num_slots += match kind {
            GotEntryKind::Regular | GotEntryKind::TpOff => 1,
            GotEntryKind::TlsGd | GotEntryKind::TlsLd => 2,
        };
        self.entries.push(GotEntry { sym, kind, slot });
        slot
    }
}

#[derive(Default)]
pub(crate) struct PltSection {
    pub(crate) syms: Vec<SymbolId>,
}

#[derive(Default)]
pub(crate) struct DynsymSection {
    /// Exported and imported symbols, excluding the leading null entry.
    /// `Symbol::dynsym_idx` is the 1-based index into the emitted table.
    pub(crate) syms: Vec<SymbolId>,
}

#[derive(Default)]
pub(crate) struct CopyrelSection {
    pub(crate) syms: Vec<(SymbolId, u64)>,

    /// Symbols at the same address as a copy-relocated symbol. They get the
    /// same final address but no COPY relocation of their own.
    pub(crate) aliases: Vec<(SymbolId, u64)>,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
}

impl CopyrelSection {
    pub(crate) fn add(&mut self, sym: SymbolId, size: u64) -> u64 {
        let alignment = size.next_power_of_two().clamp(8, 64);
        self.size = crate::alignment::align_to(self.size, alignment);
        let offset = self.size;
        self.size += size;
        self.alignment = self.alignment.max(alignment);
        self.syms.push((sym, offset));
        offset
    }
}

pub(crate) struct OutputImage<'data> {
    pub(crate) chunks: Vec<Chunk<'data>>,
    pub(crate) osecs: Vec<OutputSec<'data>>,

    pub(crate) got: GotSection,
    pub(crate) plt: PltSection,
    pub(crate) dynsym: DynsymSection,
    pub(crate) copyrel: CopyrelSection,
    pub(crate) dynstr: StringTable,
    pub(crate) shstrtab: StringTable,
    pub(crate) versym: Vec<u16>,
    pub(crate) verneed: Vec<u8>,
    pub(crate) verneed_count: u32,
    interp: Option<Vec<u8>>,

    /// Totals for .symtab/.strtab; per-file start indices live in each file.
    pub(crate) num_locals: u32,
    pub(crate) num_globals: u32,
    pub(crate) strtab_size: u32,

    osec_chunk: Vec<u32>,
    merged_chunk: Vec<u32>,
    num_merged: usize,

    pub(crate) tls_begin: u64,
    pub(crate) tls_end: u64,
}

impl<'data> OutputImage<'data> {
    #[tracing::instrument(skip_all, name = "Create output chunks")]
    pub(crate) fn new(ctx: &Context<'data>, osecs: Vec<OutputSec<'data>>) -> OutputImage<'data> {
        let is_dynamic = !ctx.args.is_static;
        let mut chunks = Vec::new();

        chunks.push(Chunk::new(b".got", ChunkKind::Got, sht::PROGBITS, shf::ALLOC | shf::WRITE, 8));
        chunks.push(Chunk::new(
            b".plt",
            ChunkKind::Plt,
            sht::PROGBITS,
            shf::ALLOC | shf::EXECINSTR,
            16,
        ));
        chunks.push(Chunk::new(
            b".got.plt",
            ChunkKind::GotPlt,
            sht::PROGBITS,
            shf::ALLOC | shf::WRITE,
            8,
        ));
        chunks.push(Chunk::new(b".rela.plt", ChunkKind::RelPlt, sht::RELA, shf::ALLOC, 8));
        if is_dynamic {
            chunks.push(Chunk::new(b".rela.dyn", ChunkKind::RelDyn, sht::RELA, shf::ALLOC, 8));
            chunks.push(Chunk::new(
                b".dynamic",
                ChunkKind::Dynamic,
                sht::DYNAMIC,
                shf::ALLOC | shf::WRITE,
                8,
            ));
        }
        chunks.push(Chunk::new(b".dynsym", ChunkKind::Dynsym, sht::DYNSYM, shf::ALLOC, 8));
        chunks.push(Chunk::new(b".dynstr", ChunkKind::Dynstr, sht::STRTAB, shf::ALLOC, 1));
        chunks.push(Chunk::new(b".shstrtab", ChunkKind::Shstrtab, sht::STRTAB, 0, 1));
        chunks.push(Chunk::new(b".symtab", ChunkKind::Symtab, sht::SYMTAB, 0, 8));
        chunks.push(Chunk::new(b".strtab", ChunkKind::Strtab, sht::STRTAB, 0, 1));
        if is_dynamic {
            chunks.push(Chunk::new(b".hash", ChunkKind::Hash, sht::HASH, shf::ALLOC, 4));
            chunks.push(Chunk::new(
                b".copyrel",
                ChunkKind::Copyrel,
                sht::NOBITS,
                shf::ALLOC | shf::WRITE,
                8,
            ));
            chunks.push(Chunk::new(
                b".gnu.version",
                ChunkKind::Versym,
                sht::GNU_VERSYM,
                shf::ALLOC,
                2,
            ));
            chunks.push(Chunk::new(
                b".gnu.version_r",
                ChunkKind::Verneed,
                sht::GNU_VERNEED,
                shf::ALLOC,
                8,
            ));
        }

        for (i, osec) in osecs.iter().enumerate() {
            let mut chunk = Chunk::new(
                osec.name,
                ChunkKind::Regular(i as u32),
                osec.sh_type,
                osec.sh_flags,
                osec.addralign,
            );
            chunk.shdr.size = osec.size;
            chunks.push(chunk);
        }

        // Merged sections were registered in priority order; sort them like
        // the regular registry so chunk order doesn't depend on input order.
        let mut merged_order: Vec<usize> = (0..ctx.merged.sections.len()).collect();
        merged_order.sort_by_key(|&i| {
            let m = &ctx.merged.sections[i];
            (m.name, m.sh_type, m.sh_flags)
        });
        for i in merged_order {
            let m = &ctx.merged.sections[i];
            let mut chunk = Chunk::new(
                m.name,
                ChunkKind::Merged(i as u32),
                m.sh_type,
                m.sh_flags,
                m.addralign,
            );
            chunk.shdr.size = m.size;
            chunks.push(chunk);
        }

        // Sort the sections by section rank so that we'll have to create as
        // few segments as possible. The sort is stable, so ties keep the
        // creation order above.
        chunks.sort_by_key(|c| section_rank(&c.shdr));

        let interp = match (&ctx.args.dynamic_linker, is_dynamic) {
            (Some(path), true) => {
                use std::os::unix::ffi::OsStrExt;
                let mut bytes = path.as_os_str().as_bytes().to_vec();
                bytes.push(0);
                Some(bytes)
            }
            _ => None,
        };

        chunks.insert(0, Chunk::new(b"", ChunkKind::Ehdr, sht::NULL, shf::ALLOC, 8));
        chunks.insert(1, Chunk::new(b"", ChunkKind::Phdr, sht::NULL, shf::ALLOC, 8));
        if let Some(contents) = &interp {
            let mut chunk =
                Chunk::new(b".interp", ChunkKind::Interp, sht::PROGBITS, shf::ALLOC, 1);
            chunk.shdr.size = contents.len() as u64;
            chunks.insert(2, chunk);
        }
        chunks.push(Chunk::new(b"", ChunkKind::Shdr, sht::NULL, 0, 8));

        let mut dynstr = StringTable::new();
        for &dso in &ctx.live_dsos {
            dynstr.add(ctx.shared(dso).soname.as_bytes());
        }
        if !ctx.args.rpaths.is_empty() {
            dynstr.add(ctx.args.rpaths.as_bytes());
        }

        let mut image = OutputImage {
            chunks,
            osecs,
            got: GotSection::default(),
            plt: PltSection::default(),
            dynsym: DynsymSection::default(),
            copyrel: CopyrelSection::default(),
            dynstr,
            shstrtab: StringTable::new(),
            versym: Vec::new(),
            verneed: Vec::new(),
            verneed_count: 0,
            interp,
            num_locals: 0,
            num_globals: 0,
            strtab_size: 0,
            osec_chunk: Vec::new(),
            merged_chunk: Vec::new(),
            num_merged: ctx.merged.sections.len(),
            tls_begin: 0,
            tls_end: 0,
        };
        image.reindex();
        image
    }

    pub(crate) fn reindex(&mut self) {
        self.osec_chunk = vec![u32::MAX; self.osecs.len()];
        self.merged_chunk = vec![u32::MAX; self.num_merged];
        for (i, chunk) in self.chunks.iter().enumerate() {
            match chunk.kind {
                ChunkKind::Regular(id) => self.osec_chunk[id as usize] = i as u32,
                ChunkKind::Merged(id) => self.merged_chunk[id as usize] = i as u32,
                _ => {}
            }
        }
    }

    pub(crate) fn chunk(&self, kind: ChunkKind) -> Option<&Chunk<'data>> {
        self.chunks.iter().find(|c| c.kind == kind)
    }

    pub(crate) fn chunk_by_type(&self, sh_type: u32) -> Option<&Chunk<'data>> {
        self.chunks.iter().find(|c| c.shdr.ty == sh_type)
    }

    pub(crate) fn osec_address(&self, osec: u32) -> u64 {
        match self.osec_chunk.get(osec as usize) {
            Some(&i) if i != u32::MAX => self.chunks[i as usize].shdr.address,
            _ => 0,
        }
    }

    pub(crate) fn merged_address(&self, merged: u32) -> u64 {
        match self.merged_chunk.get(merged as usize) {
            Some(&i) if i != u32::MAX => self.chunks[i as usize].shdr.address,
            _ => 0,
        }
    }

    fn got_address(&self) -> u64 {
        self.chunk(ChunkKind::Got).map(|c| c.shdr.address).unwrap_or(0)
    }

    fn plt_address(&self) -> u64 {
        self.chunk(ChunkKind::Plt).map(|c| c.shdr.address).unwrap_or(0)
    }

    fn gotplt_address(&self) -> u64 {
        self.chunk(ChunkKind::GotPlt).map(|c| c.shdr.address).unwrap_or(0)
    }

    pub(crate) fn got_slot_address(&self, slot: i32) -> u64 {
        self.got_address() + slot.max(0) as u64 * elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn plt_entry_address(&self, index: i32) -> u64 {
        self.plt_address() + index.max(0) as u64 * elf::PLT_ENTRY_SIZE
    }

    fn gotplt_slot_address(&self, plt_index: i32) -> u64 {
        self.gotplt_address() + (3 + plt_index.max(0) as u64) * elf::GOT_ENTRY_SIZE
    }

    fn num_sections(&self) -> u64 {
        1 + self.chunks.iter().filter(|c| !c.kind.is_header()).count() as u64
    }

    /// Computes each chunk's final size. Called once before empty chunks are
    /// dropped and again afterwards so header-table sizes settle.
    pub(crate) fn update_shdrs(&mut self, ctx: &Context) {
        for i in 0..self.chunks.len() {
            if let Some(size) = self.chunk_size(ctx, i) {
                self.chunks[i].shdr.size = size;
            }
            let entsize = match self.chunks[i].kind {
                ChunkKind::RelPlt | ChunkKind::RelDyn => elf::RELA_ENTRY_SIZE,
                ChunkKind::Dynsym | ChunkKind::Symtab => elf::SYMTAB_ENTRY_SIZE,
                ChunkKind::Dynamic => 16,
                ChunkKind::Hash => 4,
                ChunkKind::Versym => 2,
                _ => 0,
            };
            self.chunks[i].shdr.entsize = entsize;
        }
    }

    /// Returns None for chunks whose size is managed elsewhere.
    fn chunk_size(&self, ctx: &Context, index: usize) -> Option<u64> {
        let n_dynsym = self.dynsym.syms.len() as u64;
        Some(match self.chunks[index].kind {
            ChunkKind::Ehdr => elf::FILE_HEADER_SIZE as u64,
            ChunkKind::Phdr => self.segments().len() as u64 * elf::PROGRAM_HEADER_SIZE as u64,
            ChunkKind::Shdr => self.num_sections() * elf::SECTION_HEADER_SIZE as u64,
            ChunkKind::Interp => self.interp.as_ref().map(|i| i.len() as u64).unwrap_or(0),
            ChunkKind::Regular(_) | ChunkKind::Merged(_) => return None,
            ChunkKind::Got => u64::from(self.got.num_slots) * elf::GOT_ENTRY_SIZE,
            ChunkKind::GotPlt if self.plt.syms.is_empty() => 0,
            ChunkKind::GotPlt => (3 + self.plt.syms.len() as u64) * elf::GOT_ENTRY_SIZE,
            ChunkKind::Plt => self.plt.syms.len() as u64 * elf::PLT_ENTRY_SIZE,
            ChunkKind::RelPlt => self.plt.syms.len() as u64 * elf::RELA_ENTRY_SIZE,
            ChunkKind::RelDyn => self.count_dynamic_relocations(ctx) * elf::RELA_ENTRY_SIZE,
            ChunkKind::Dynamic => self.dynamic_entries(ctx, false).len() as u64 * 16,
            ChunkKind::Dynsym if self.dynsym.syms.is_empty() => 0,
            ChunkKind::Dynsym => (1 + n_dynsym) * elf::SYMTAB_ENTRY_SIZE,
            ChunkKind::Dynstr if self.dynsym.syms.is_empty() && ctx.live_dsos.is_empty() => 0,
            ChunkKind::Dynstr => self.dynstr.len() as u64,
            ChunkKind::Symtab => {
                (1 + u64::from(self.num_locals) + u64::from(self.num_globals))
                    * elf::SYMTAB_ENTRY_SIZE
            }
            ChunkKind::Strtab => u64::from(self.strtab_size),
            ChunkKind::Shstrtab => self.shstrtab.len() as u64,
            ChunkKind::Hash if self.dynsym.syms.is_empty() => 0,
            ChunkKind::Hash => (2 + (n_dynsym + 1) + (n_dynsym + 1)) * 4,
            ChunkKind::Versym if self.verneed_count == 0 => 0,
            ChunkKind::Versym => self.versym.len() as u64 * 2,
            ChunkKind::Verneed => self.verneed.len() as u64,
            ChunkKind::Copyrel => self.copyrel.size,
        })
    }

    pub(crate) fn drop_empty_chunks(&mut self) {
        self.chunks
            .retain(|c| c.kind.is_header() || c.shdr.size != 0);
        self.reindex();
    }

    /// Assigns section indices, names and link/info fields, and marks the
    /// chunks that start a new PT_LOAD.
    pub(crate) fn finalize_order(&mut self, num_locals: u32) {
        let mut shndx = 1;
        for chunk in &mut self.chunks {
            if chunk.kind.is_header() {
                continue;
            }
            chunk.shndx = shndx;
            shndx += 1;
        }

        let Self {
            chunks, shstrtab, ..
        } = self;
        for chunk in chunks.iter_mut() {
            if !chunk.kind.is_header() {
                chunk.shdr.name = shstrtab.add(chunk.name);
            }
        }

        let mut prev_flags = None;
        for chunk in self.chunks.iter_mut() {
            if chunk.shdr.flags & shf::ALLOC == 0 {
                continue;
            }
            let flags = phdr_flags(&chunk.shdr);
            chunk.starts_new_ptload = prev_flags != Some(flags);
            prev_flags = Some(flags);
        }

        let dynsym_shndx = self.chunk(ChunkKind::Dynsym).map(|c| c.shndx).unwrap_or(0);
        let dynstr_shndx = self.chunk(ChunkKind::Dynstr).map(|c| c.shndx).unwrap_or(0);
        let strtab_shndx = self.chunk(ChunkKind::Strtab).map(|c| c.shndx).unwrap_or(0);
        let gotplt_shndx = self.chunk(ChunkKind::GotPlt).map(|c| c.shndx).unwrap_or(0);
        let verneed_count = self.verneed_count;
        for chunk in self.chunks.iter_mut() {
            match chunk.kind {
                ChunkKind::Symtab => {
                    chunk.shdr.link = strtab_shndx;
                    chunk.shdr.info = 1 + num_locals;
                }
                ChunkKind::Dynsym => {
                    chunk.shdr.link = dynstr_shndx;
                    chunk.shdr.info = 1;
                }
                ChunkKind::RelPlt => {
                    chunk.shdr.link = dynsym_shndx;
                    chunk.shdr.info = gotplt_shndx;
                }
                ChunkKind::RelDyn | ChunkKind::Hash | ChunkKind::Versym => {
                    chunk.shdr.link = dynsym_shndx;
                }
                ChunkKind::Dynamic => chunk.shdr.link = dynstr_shndx,
                ChunkKind::Verneed => {
                    chunk.shdr.link = dynstr_shndx;
                    chunk.shdr.info = verneed_count;
                }
                _ => {}
            }
        }
    }

    pub(crate) fn compute_tls_range(&mut self) {
        let mut begin = 0;
        let mut end = 0;
        let mut align = 1;
        for chunk in &self.chunks {
            if chunk.shdr.flags & shf::TLS == 0 {
                continue;
            }
            if begin == 0 {
                begin = chunk.shdr.address;
            }
            end = chunk.shdr.address + chunk.shdr.size;
            align = align.max(chunk.shdr.alignment);
        }
        self.tls_begin = begin;
        self.tls_end = crate::alignment::align_to(end, align);
    }

    fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        segments.push(Segment {
            p_type: elf::pt::PHDR,
            flags: elf::pf::R,
            chunks: self
                .chunks
                .iter()
                .position(|c| c.kind == ChunkKind::Phdr)
                .map(|i| i..i + 1)
                .unwrap_or(0..0),
        });
        if let Some(i) = self.chunks.iter().position(|c| c.kind == ChunkKind::Interp) {
            segments.push(Segment {
                p_type: elf::pt::INTERP,
                flags: elf::pf::R,
                chunks: i..i + 1,
            });
        }
        let mut load_start = None;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.shdr.flags & shf::ALLOC == 0 {
                continue;
            }
            if chunk.starts_new_ptload {
                if let Some(start) = load_start.take() {
                    segments.push(load_segment(&self.chunks, start, i));
                }
                load_start = Some(i);
            }
        }
        if let Some(start) = load_start {
            let end = self
                .chunks
                .iter()
                .rposition(|c| c.shdr.flags & shf::ALLOC != 0)
                .map(|i| i + 1)
                .unwrap_or(start);
            segments.push(load_segment(&self.chunks, start, end));
        }
        let tls_chunks: Vec<usize> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.shdr.flags & shf::TLS != 0)
            .map(|(i, _)| i)
            .collect();
        if let (Some(&first), Some(&last)) = (tls_chunks.first(), tls_chunks.last()) {
            segments.push(Segment {
                p_type: elf::pt::TLS,
                flags: elf::pf::R,
                chunks: first..last + 1,
            });
        }
        if let Some(i) = self.chunks.iter().position(|c| c.kind == ChunkKind::Dynamic) {
            segments.push(Segment {
                p_type: elf::pt::DYNAMIC,
                flags: elf::pf::R | elf::pf::W,
                chunks: i..i + 1,
            });
        }
        segments.push(Segment {
            p_type: elf::pt::GNU_STACK,
            flags: elf::pf::R | elf::pf::W,
            chunks: 0..0,
        });
        segments
    }

    fn count_dynamic_relocations(&self, ctx: &Context) -> u64 {
        let mut count = 0u64;
        for entry in &self.got.entries {
            let imported = entry
                .sym
                .is_some_and(|s| ctx.symbol_db.symbol(s).is_imported);
            count += match entry.kind {
                GotEntryKind::Regular | GotEntryKind::TpOff if imported => 1,
                GotEntryKind::TlsGd if imported => 2,
                _ => 0,
            };
        }
        count + self.copyrel.syms.len() as u64
    }

    fn dynamic_entries(&self, ctx: &Context, with_addresses: bool) -> Vec<elf::DynamicEntry> {
        let mut entries = Vec::new();
        let mut push = |tag: DynamicTag, value: u64| {
            entries.push(elf::DynamicEntry {
                tag: tag as u64,
                value,
            });
        };
        let addr = |kind: ChunkKind| {
            if with_addresses {
                self.chunk(kind).map(|c| c.shdr.address).unwrap_or(0)
            } else {
                0
            }
        };
        let size_of = |kind: ChunkKind| self.chunk(kind).map(|c| c.shdr.size).unwrap_or(0);

        for &dso in &ctx.live_dsos {
            push(
                DynamicTag::Needed,
                u64::from(self.dynstr.get(ctx.shared(dso).soname.as_bytes())),
            );
        }
        if !ctx.args.rpaths.is_empty() {
            push(
                DynamicTag::RunPath,
                u64::from(self.dynstr.get(ctx.args.rpaths.as_bytes())),
            );
        }
        if size_of(ChunkKind::Hash) != 0 {
            push(DynamicTag::Hash, addr(ChunkKind::Hash));
        }
        push(DynamicTag::StrTab, addr(ChunkKind::Dynstr));
        push(DynamicTag::StrSize, size_of(ChunkKind::Dynstr));
        push(DynamicTag::SymTab, addr(ChunkKind::Dynsym));
        push(DynamicTag::SymEnt, elf::SYMTAB_ENTRY_SIZE);
        push(DynamicTag::Debug, 0);
        if !self.plt.syms.is_empty() {
            push(DynamicTag::PltGot, addr(ChunkKind::GotPlt));
            push(DynamicTag::PltRelSize, size_of(ChunkKind::RelPlt));
            push(DynamicTag::PltRel, 7); // DT_RELA
            push(DynamicTag::JmpRel, addr(ChunkKind::RelPlt));
        }
        if size_of(ChunkKind::RelDyn) != 0 {
            push(DynamicTag::Rela, addr(ChunkKind::RelDyn));
            push(DynamicTag::RelaSize, size_of(ChunkKind::RelDyn));
            push(DynamicTag::RelaEnt, elf::RELA_ENTRY_SIZE);
        }
        if let Some(c) = self.chunk_by_type(sht::INIT_ARRAY) {
            push(
                DynamicTag::InitArray,
                if with_addresses { c.shdr.address } else { 0 },
            );
            push(DynamicTag::InitArraySize, c.shdr.size);
        }
        if let Some(c) = self.chunk_by_type(sht::FINI_ARRAY) {
            push(
                DynamicTag::FiniArray,
                if with_addresses { c.shdr.address } else { 0 },
            );
            push(DynamicTag::FiniArraySize, c.shdr.size);
        }
        if self.verneed_count != 0 {
            push(DynamicTag::VerSym, addr(ChunkKind::Versym));
            push(DynamicTag::VerNeed, addr(ChunkKind::Verneed));
            push(DynamicTag::VerNeedNum, u64::from(self.verneed_count));
        }
        push(DynamicTag::Flags, elf::flags::BIND_NOW);
        let mut flags1 = elf::flags_1::NOW;
        if ctx.args.pie {
            flags1 |= elf::flags_1::PIE;
        }
        push(DynamicTag::Flags1, flags1);
        push(DynamicTag::Null, 0);
        entries
    }

    /// Writes chunk `index` into `out`, which is the chunk's own slice of the
    /// output file.
    pub(crate) fn copy_buf(&self, ctx: &Context, index: usize, out: &mut [u8]) -> Result {
        let chunk = &self.chunks[index];
        match chunk.kind {
            ChunkKind::Ehdr => self.write_ehdr(ctx, out),
            ChunkKind::Phdr => self.write_phdrs(out),
            ChunkKind::Shdr => self.write_shdrs(out),
            ChunkKind::Interp => {
                if let Some(contents) = &self.interp {
                    out[..contents.len()].copy_from_slice(contents);
                }
                Ok(())
            }
            ChunkKind::Regular(id) => self.write_regular(ctx, id, chunk, out),
            ChunkKind::Merged(id) => self.write_merged(ctx, id, out),
            ChunkKind::Got => self.write_got(ctx, out),
            ChunkKind::GotPlt => self.write_gotplt(out),
            ChunkKind::Plt => self.write_plt(out),
            ChunkKind::RelPlt => self.write_relplt(ctx, out),
            ChunkKind::RelDyn => self.write_reldyn(ctx, out),
            ChunkKind::Dynamic => {
                write_pods(out, &self.dynamic_entries(ctx, true));
                Ok(())
            }
            ChunkKind::Dynsym => self.write_dynsym(ctx, out),
            ChunkKind::Dynstr => {
                out[..self.dynstr.bytes.len()].copy_from_slice(&self.dynstr.bytes);
                Ok(())
            }
            ChunkKind::Symtab => self.write_symtab(ctx, out),
            ChunkKind::Strtab => self.write_strtab(ctx, out),
            ChunkKind::Shstrtab => {
                out[..self.shstrtab.bytes.len()].copy_from_slice(&self.shstrtab.bytes);
                Ok(())
            }
            ChunkKind::Hash => self.write_hash(ctx, out),
            ChunkKind::Versym => {
                for (i, v) in self.versym.iter().enumerate() {
                    out[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
                }
                Ok(())
            }
            ChunkKind::Verneed => {
                out[..self.verneed.len()].copy_from_slice(&self.verneed);
                Ok(())
            }
            ChunkKind::Copyrel => Ok(()),
        }
    }

    fn write_ehdr(&self, ctx: &Context, out: &mut [u8]) -> Result {
        let entry_point = match ctx
            .symbol_db
            .get(&crate::symbol::SymbolName::new(ctx.args.entry.as_bytes()))
        {
            Some(gid) => symbol_address(ctx, self, gid)?,
            None => 0,
        };
        let shdr_chunk = self.chunk(ChunkKind::Shdr).context("Missing shdr chunk")?;
        let header = elf::FileHeader {
            magic: [0x7f, b'E', b'L', b'F'],
            class: 2, // 64 bit
            data: 1,  // Little endian
            ei_version: 1,
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
            ty: 2,         // Executable
            machine: 0x3e, // x86-64
            e_version: 1,
            entry_point,
            program_header_offset: elf::PHEADER_OFFSET,
            section_header_offset: shdr_chunk.shdr.offset,
            flags: 0,
            ehsize: elf::FILE_HEADER_SIZE,
            program_header_entry_size: elf::PROGRAM_HEADER_SIZE,
            program_header_num: self.segments().len() as u16,
            section_header_entry_size: elf::SECTION_HEADER_SIZE,
            section_header_num: self.num_sections() as u16,
            section_names_index: self
                .chunk(ChunkKind::Shstrtab)
                .map(|c| c.shndx as u16)
                .unwrap_or(0),
        };
        write_pods(out, &[header]);
        Ok(())
    }

    fn write_phdrs(&self, out: &mut [u8]) -> Result {
        let mut headers = Vec::new();
        for segment in self.segments() {
            let range = segment.chunks.clone();
            let covered = &self.chunks[range];
            let (offset, vaddr) = covered
                .first()
                .map(|c| (c.shdr.offset, c.shdr.address))
                .unwrap_or((0, 0));
            let mut file_end = offset;
            let mut mem_end = vaddr;
            for c in covered {
                if c.shdr.ty != sht::NOBITS {
                    file_end = file_end.max(c.shdr.offset + c.shdr.size);
                }
                if c.shdr.flags & shf::ALLOC != 0 {
                    mem_end = mem_end.max(c.shdr.address + c.shdr.size);
                }
            }
            let alignment = match segment.p_type {
                elf::pt::LOAD => elf::PAGE_SIZE,
                elf::pt::TLS => covered.iter().map(|c| c.shdr.alignment).max().unwrap_or(1),
                elf::pt::GNU_STACK => 0x10,
                _ => covered.iter().map(|c| c.shdr.alignment).max().unwrap_or(1),
            };
            headers.push(elf::ProgramHeader {
                segment_type: segment.p_type,
                flags: segment.flags,
                offset,
                virtual_addr: vaddr,
                physical_addr: vaddr,
                file_size: file_end.saturating_sub(offset),
                mem_size: mem_end.saturating_sub(vaddr),
                alignment,
            });
        }
        write_pods(out, &headers);
        Ok(())
    }

    fn write_shdrs(&self, out: &mut [u8]) -> Result {
        let mut headers = vec![elf::SectionHeader::default()];
        for chunk in &self.chunks {
            if chunk.kind.is_header() {
                continue;
            }
            headers.push(chunk.shdr);
        }
        write_pods(out, &headers);
        Ok(())
    }

    fn write_regular(&self, ctx: &Context, id: u32, chunk: &Chunk, out: &mut [u8]) -> Result {
        let osec = &self.osecs[id as usize];
        for member in &osec.members {
            let obj = ctx.obj(member.file);
            let Some(sec) = obj.section(member.slot) else {
                continue;
            };
            if sec.is_nobits {
                continue;
            }
            let section = obj
                .object
                .section_by_index(object::SectionIndex(member.slot as usize))?;
            let data = section.data()?;
            let offset = sec.offset() as usize;
            out[offset..offset + data.len()].copy_from_slice(data);
            self.apply_relocations(ctx, obj, &section, chunk, sec, out)?;
        }
        Ok(())
    }

    fn apply_relocations(
        &self,
        ctx: &Context,
        obj: &ObjectFile,
        section: &elf::Section,
        chunk: &Chunk,
        sec: &crate::object_file::InputSection,
        out: &mut [u8],
    ) -> Result {
        use crate::elf::RelocationKind as K;

        for (r_offset, rel) in section.relocations() {
            let RelocationTarget::Symbol(sym_index) = rel.target() else {
                continue;
            };
            let object::RelocationFlags::Elf { r_type } = rel.flags() else {
                continue;
            };
            let info = match elf::RelocationKindInfo::from_raw(r_type) {
                Ok(info) => info,
                Err(e) => {
                    ctx.diags.error(format!("{obj}: {e}"));
                    continue;
                }
            };
            let mut addend = rel.addend();
            let place = chunk.shdr.address + sec.offset() + r_offset;

            let gid = obj.global_id(sym_index.0);
            let target = match gid {
                Some(gid) => {
                    let sym = ctx.symbol_db.symbol(gid);
                    if info.kind == K::PltRelative && sym.plt_idx >= 0 {
                        self.plt_entry_address(sym.plt_idx)
                    } else {
                        symbol_address(ctx, self, gid)?
                    }
                }
                None => {
                    // Local symbol; a section symbol pointing into a merged
                    // section consumes the addend to select the piece.
                    let esym = obj.elf_symbol(sym_index.0)?;
                    if let (Some(section_index), object::SymbolKind::Section) =
                        (esym.section_index(), esym.kind())
                    {
                        if let Some(SectionSlot::Merge(m)) = obj.sections.get(section_index.0) {
                            let msec = &obj.mergeable[*m as usize];
                            let (piece, delta) =
                                msec.piece_at((esym.address() as i64 + addend) as u64)?;
                            addend = 0;
                            ctx.merged
                                .piece_address(ctx, self, msec.merged_id, piece)
                                + delta
                        } else {
                            owned_symbol_address(ctx, self, obj, sym_index.0)?
                        }
                    } else {
                        owned_symbol_address(ctx, self, obj, sym_index.0)?
                    }
                }
            };

            let sym_for_slots = gid.map(|g| ctx.symbol_db.symbol(g));
            let value: i64 = match info.kind {
                K::Absolute => target as i64 + addend,
                K::Relative => target as i64 + addend - place as i64,
                K::PltRelative => target as i64 + addend - place as i64,
                K::GotRelative => {
                    let slot = sym_for_slots.map(|s| s.got_idx).unwrap_or(-1);
                    self.got_slot_address(slot) as i64 + addend - place as i64
                }
                K::Got => {
                    let slot = sym_for_slots.map(|s| s.got_idx).unwrap_or(-1);
                    (self.got_slot_address(slot) - self.got_address()) as i64 + addend
                }
                K::TlsGd => {
                    let slot = sym_for_slots.map(|s| s.tlsgd_idx).unwrap_or(-1);
                    self.got_slot_address(slot) as i64 + addend - place as i64
                }
                K::TlsLd => {
                    self.got_slot_address(self.got.tlsld_slot) as i64 + addend - place as i64
                }
                K::GotTpOff => {
                    let slot = sym_for_slots.map(|s| s.gottpoff_idx).unwrap_or(-1);
                    self.got_slot_address(slot) as i64 + addend - place as i64
                }
                K::TpOff => target as i64 + addend - self.tls_end as i64,
                K::DtpOff => target as i64 + addend - self.tls_begin as i64,
            };

            let at = (sec.offset() + r_offset) as usize;
            write_value(&mut out[at..at + info.byte_size], value);
        }
        Ok(())
    }

    fn write_merged(&self, ctx: &Context, id: u32, out: &mut [u8]) -> Result {
        let section = &ctx.merged.sections[id as usize];
        for piece in &section.pieces {
            let ordinal = piece.owner.load(std::sync::atomic::Ordering::Relaxed);
            let (file_id, msec_index) = section.owners[ordinal as usize];
            let msec = &ctx.obj(file_id).mergeable[msec_index as usize];
            let offset = piece.output_offset.load(std::sync::atomic::Ordering::Relaxed);
            if offset < 0 {
                continue;
            }
            let at = (msec.offset + offset as u64) as usize;
            out[at..at + piece.data.len()].copy_from_slice(piece.data);
        }
        Ok(())
    }

    fn write_got(&self, ctx: &Context, out: &mut [u8]) -> Result {
        for entry in &self.got.entries {
            let at = entry.slot as usize * 8;
            if entry.kind == GotEntryKind::TlsLd {
                out[at..at + 8].copy_from_slice(&1u64.to_le_bytes());
                out[at + 8..at + 16].copy_from_slice(&0u64.to_le_bytes());
                continue;
            }
            let gid = entry.sym.context("GOT entry without a symbol")?;
            let sym = ctx.symbol_db.symbol(gid);
            match entry.kind {
                GotEntryKind::Regular => {
                    let value = if sym.is_imported && !sym.has_copyrel {
                        0 // Filled by a GLOB_DAT relocation at load time.
                    } else {
                        symbol_address(ctx, self, gid)?
                    };
                    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
                }
                GotEntryKind::TpOff => {
                    let value = if sym.is_imported {
                        0
                    } else {
                        symbol_address(ctx, self, gid)?.wrapping_sub(self.tls_end)
                    };
                    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
                }
                GotEntryKind::TlsGd => {
                    let (modid, offset) = if sym.is_imported {
                        (0u64, 0u64)
                    } else {
                        (1, symbol_address(ctx, self, gid)?.wrapping_sub(self.tls_begin))
                    };
                    out[at..at + 8].copy_from_slice(&modid.to_le_bytes());
                    out[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
                }
                GotEntryKind::TlsLd => unreachable!(),
            }
        }
        Ok(())
    }

    fn write_gotplt(&self, out: &mut [u8]) -> Result {
        let dynamic = self
            .chunk(ChunkKind::Dynamic)
            .map(|c| c.shdr.address)
            .unwrap_or(0);
        out[..8].copy_from_slice(&dynamic.to_le_bytes());
        // Slots beyond the three reserved ones are filled by JUMP_SLOT
        // relocations at load time.
        Ok(())
    }

    fn write_plt(&self, out: &mut [u8]) -> Result {
        for (i, _) in self.plt.syms.iter().enumerate() {
            let at = i * elf::PLT_ENTRY_SIZE as usize;
            out[at..at + elf::PLT_ENTRY_SIZE as usize].copy_from_slice(elf::PLT_ENTRY_TEMPLATE);
            let entry_addr = self.plt_entry_address(i as i32);
            let slot_addr = self.gotplt_slot_address(i as i32);
            // The jump is rip-relative from the end of the 11-byte
            // instruction.
            let rel = slot_addr as i64 - (entry_addr as i64 + 11);
            out[at + 7..at + 11].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Ok(())
    }

    fn write_relplt(&self, ctx: &Context, out: &mut [u8]) -> Result {
        let mut relas = Vec::with_capacity(self.plt.syms.len());
        for (i, &gid) in self.plt.syms.iter().enumerate() {
            let sym = ctx.symbol_db.symbol(gid);
            relas.push(elf::Rela::new(
                self.gotplt_slot_address(i as i32),
                elf::rel::R_X86_64_JUMP_SLOT,
                sym.dynsym_idx.max(0) as u32,
                0,
            ));
        }
        write_pods(out, &relas);
        Ok(())
    }

    fn write_reldyn(&self, ctx: &Context, out: &mut [u8]) -> Result {
        let mut relas = Vec::new();
        for entry in &self.got.entries {
            let Some(gid) = entry.sym else {
                continue;
            };
            let sym = ctx.symbol_db.symbol(gid);
            if !sym.is_imported {
                continue;
            }
            let dynsym_idx = sym.dynsym_idx.max(0) as u32;
            let slot_addr = self.got_slot_address(entry.slot as i32);
            match entry.kind {
                GotEntryKind::Regular if !sym.has_copyrel => {
                    relas.push(elf::Rela::new(
                        slot_addr,
                        elf::rel::R_X86_64_GLOB_DAT,
                        dynsym_idx,
                        0,
                    ));
                }
                GotEntryKind::TpOff => {
                    relas.push(elf::Rela::new(
                        slot_addr,
                        elf::rel::R_X86_64_TPOFF64,
                        dynsym_idx,
                        0,
                    ));
                }
                GotEntryKind::TlsGd => {
                    relas.push(elf::Rela::new(
                        slot_addr,
                        elf::rel::R_X86_64_DTPMOD64,
                        dynsym_idx,
                        0,
                    ));
                    relas.push(elf::Rela::new(
                        slot_addr + 8,
                        elf::rel::R_X86_64_DTPOFF64,
                        dynsym_idx,
                        0,
                    ));
                }
                _ => {}
            }
        }
        for &(gid, _) in &self.copyrel.syms {
            let sym = ctx.symbol_db.symbol(gid);
            relas.push(elf::Rela::new(
                sym.value,
                elf::rel::R_X86_64_COPY,
                sym.dynsym_idx.max(0) as u32,
                0,
            ));
        }
        write_pods(out, &relas);
        Ok(())
    }

    fn write_dynsym(&self, ctx: &Context, out: &mut [u8]) -> Result {
        let mut entries = vec![elf::SymtabEntry::default()];
        for &gid in &self.dynsym.syms {
            let sym = ctx.symbol_db.symbol(gid);
            let name = ctx.symbol_db.name(gid);
            let name_offset = self.dynstr.get(name.bytes());
            let entry = match sym.owner() {
                Some(owner) => match &ctx.files[owner.file.as_usize()] {
                    InputFile::Shared(s) => {
                        let dsym = s.dynsym(owner.sym_index);
                        if sym.has_copyrel {
                            elf::SymtabEntry {
                                name: name_offset,
                                info: dsym.info,
                                other: 0,
                                shndx: sym.shndx as u16,
                                value: sym.value,
                                size: dsym.size,
                            }
                        } else {
                            elf::SymtabEntry {
                                name: name_offset,
                                info: dsym.info,
                                other: 0,
                                shndx: elf::shn::UNDEF,
                                value: 0,
                                size: 0,
                            }
                        }
                    }
                    InputFile::Object(o) => {
                        let esym = o.elf_symbol(owner.sym_index as usize)?;
                        let (st_bind, st_type) = match esym.flags() {
                            object::SymbolFlags::Elf { st_info, .. } => {
                                (st_info >> 4, st_info & 0xf)
                            }
                            _ => (elf::st::BIND_GLOBAL, elf::st::TYPE_NOTYPE),
                        };
                        elf::SymtabEntry {
                            name: name_offset,
                            info: elf::st::info(st_bind, st_type),
                            other: 0,
                            shndx: self.output_shndx(o, owner.sym_index as usize)?,
                            value: owned_symbol_address(ctx, self, o, owner.sym_index as usize)?,
                            size: esym.size(),
                        }
                    }
                    InputFile::Internal(_) => elf::SymtabEntry {
                        name: name_offset,
                        info: elf::st::info(elf::st::BIND_GLOBAL, elf::st::TYPE_NOTYPE),
                        other: 0,
                        shndx: sym.shndx as u16,
                        value: sym.value,
                        size: 0,
                    },
                },
                None => elf::SymtabEntry {
                    name: name_offset,
                    ..Default::default()
                },
            };
            entries.push(entry);
        }
        write_pods(out, &entries);
        Ok(())
    }

    pub(crate) fn output_shndx(&self, obj: &ObjectFile, sym_index: usize) -> Result<u16> {
        let esym = obj.elf_symbol(sym_index)?;
        if esym.is_common() {
            if let Some(&slot) = obj.common_slots.get(&(sym_index as u32)) {
                if let Some(sec) = obj.section(slot) {
                    if let Some(&chunk) = self.osec_chunk.get(sec.osec as usize) {
                        if chunk != u32::MAX {
                            return Ok(self.chunks[chunk as usize].shndx as u16);
                        }
                    }
                }
            }
            return Ok(elf::shn::UNDEF);
        }
        let Some(section_index) = esym.section_index() else {
            return Ok(if esym.is_undefined() {
                elf::shn::UNDEF
            } else {
                elf::shn::ABS
            });
        };
        match obj.sections.get(section_index.0) {
            Some(SectionSlot::Regular(sec)) => {
                match self.osec_chunk.get(sec.osec as usize) {
                    Some(&chunk) if chunk != u32::MAX => {
                        Ok(self.chunks[chunk as usize].shndx as u16)
                    }
                    _ => Ok(elf::shn::UNDEF),
                }
            }
            Some(SectionSlot::Merge(m)) => {
                let merged_id = obj.mergeable[*m as usize].merged_id;
                match self.merged_chunk.get(merged_id as usize) {
                    Some(&chunk) if chunk != u32::MAX => {
                        Ok(self.chunks[chunk as usize].shndx as u16)
                    }
                    _ => Ok(elf::shn::UNDEF),
                }
            }
            _ => Ok(elf::shn::UNDEF),
        }
    }

    fn write_symtab(&self, ctx: &Context, out: &mut [u8]) -> Result {
        // The null entry.
        out[..elf::SYMTAB_ENTRY_SIZE as usize].fill(0);
        for &file_id in ctx.live_objects.iter() {
            let obj = ctx.obj(file_id);
            self.write_file_symbols(ctx, obj, out)?;
        }
        self.write_internal_symbols(ctx, out)?;
        Ok(())
    }

    fn write_file_symbols(&self, ctx: &Context, obj: &ObjectFile, out: &mut [u8]) -> Result {
        let mut local_at = obj.symtab.local_start as usize;
        let mut global_at = obj.symtab.global_start as usize;
        let mut name_at = obj.symtab.strtab_start;
        let mut write = |index: usize, entry: elf::SymtabEntry| {
            let at = index * elf::SYMTAB_ENTRY_SIZE as usize;
            out[at..at + elf::SYMTAB_ENTRY_SIZE as usize]
                .copy_from_slice(bytemuck::bytes_of(&entry));
        };
        for sym_index in 1..obj.object.symbols().count() + 1 {
            let Ok(esym) = obj.elf_symbol(sym_index) else {
                continue;
            };
            let is_local = esym.is_local();
            if !symtab_includes(ctx, obj, &esym, is_local, sym_index) {
                continue;
            }
            let name = esym.name_bytes()?;
            let entry = elf::SymtabEntry {
                name: name_at,
                info: match esym.flags() {
                    object::SymbolFlags::Elf { st_info, .. } => st_info,
                    _ => 0,
                },
                other: 0,
                shndx: self.output_shndx(obj, sym_index)?,
                value: owned_symbol_address(ctx, self, obj, sym_index)?,
                size: esym.size(),
            };
            name_at += name.len() as u32 + 1;
            if is_local {
                write(local_at, entry);
                local_at += 1;
            } else {
                write(global_at, entry);
                global_at += 1;
            }
        }
        Ok(())
    }

    fn write_internal_symbols(&self, ctx: &Context, out: &mut [u8]) -> Result {
        let internal = ctx.internal();
        let mut at = internal.symtab.global_start as usize;
        let mut name_at = internal.symtab.strtab_start;
        for &gid in &internal.defined {
            let sym = ctx.symbol_db.symbol(gid);
            let entry = elf::SymtabEntry {
                name: name_at,
                info: elf::st::info(elf::st::BIND_GLOBAL, elf::st::TYPE_NOTYPE),
                other: 0,
                shndx: sym.shndx as u16,
                value: sym.value,
                size: 0,
            };
            name_at += ctx.symbol_db.name(gid).bytes().len() as u32 + 1;
            let offset = at * elf::SYMTAB_ENTRY_SIZE as usize;
            out[offset..offset + elf::SYMTAB_ENTRY_SIZE as usize]
                .copy_from_slice(bytemuck::bytes_of(&entry));
            at += 1;
        }
        Ok(())
    }

    fn write_strtab(&self, ctx: &Context, out: &mut [u8]) -> Result {
        out[0] = 0;
        for &file_id in ctx.live_objects.iter() {
            let obj = ctx.obj(file_id);
            let mut name_at = obj.symtab.strtab_start as usize;
            for sym_index in 1..obj.object.symbols().count() + 1 {
                let Ok(esym) = obj.elf_symbol(sym_index) else {
                    continue;
                };
                if !symtab_includes(ctx, obj, &esym, esym.is_local(), sym_index) {
                    continue;
                }
                let name = esym.name_bytes()?;
                out[name_at..name_at + name.len()].copy_from_slice(name);
                out[name_at + name.len()] = 0;
                name_at += name.len() + 1;
            }
        }
        let internal = ctx.internal();
        let mut name_at = internal.symtab.strtab_start as usize;
        for &gid in &internal.defined {
            let name = ctx.symbol_db.name(gid);
            let bytes = name.bytes();
            out[name_at..name_at + bytes.len()].copy_from_slice(bytes);
            out[name_at + bytes.len()] = 0;
            name_at += bytes.len() + 1;
        }
        Ok(())
    }

    fn write_hash(&self, ctx: &Context, out: &mut [u8]) -> Result {
        let n = self.dynsym.syms.len() as u32 + 1;
        let nbucket = n;
        let mut buckets = vec![0u32; nbucket as usize];
        let mut chains = vec![0u32; n as usize];
        for &gid in &self.dynsym.syms {
            let sym = ctx.symbol_db.symbol(gid);
            let idx = sym.dynsym_idx.max(0) as u32;
            let hash = elf::sysv_hash(ctx.symbol_db.name(gid).bytes()) % nbucket;
            chains[idx as usize] = buckets[hash as usize];
            buckets[hash as usize] = idx;
        }
        let mut words = Vec::with_capacity(2 + buckets.len() + chains.len());
        words.push(nbucket);
        words.push(n);
        words.extend_from_slice(&buckets);
        words.extend_from_slice(&chains);
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        Ok(())
    }
}

struct Segment {
    p_type: u32,
    flags: u32,
    chunks: std::ops::Range<usize>,
}

fn load_segment(chunks: &[Chunk], start: usize, end: usize) -> Segment {
    Segment {
        p_type: elf::pt::LOAD,
        flags: phdr_flags(&chunks[start].shdr),
        chunks: start..end,
    }
}

fn phdr_flags(shdr: &elf::SectionHeader) -> u32 {
    let mut flags = elf::pf::R;
    if shdr.flags & shf::WRITE != 0 {
        flags |= elf::pf::W;
    }
    if shdr.flags & shf::EXECINSTR != 0 {
        flags |= elf::pf::X;
    }
    flags
}

/// Which symbols from an object's symbol table are emitted into .symtab.
pub(crate) fn symtab_includes(
    ctx: &Context,
    obj: &ObjectFile,
    esym: &elf::Symbol,
    is_local: bool,
    sym_index: usize,
) -> bool {
    if ctx.args.strip_all {
        return false;
    }
    if esym.is_undefined() {
        return false;
    }
    let name = esym.name_bytes().unwrap_or_default();
    if is_local {
        if ctx.args.discard_all {
            return false;
        }
        if name.is_empty() {
            return false;
        }
        if matches!(
            esym.kind(),
            object::SymbolKind::Section | object::SymbolKind::File
        ) {
            return false;
        }
        if ctx.args.discard_locals && name.starts_with(b".L") {
            return false;
        }
    } else {
        // Globals are emitted by their winning definition only.
        let me = crate::symbol::Owner {
            file: obj.file_id,
            sym_index: sym_index as u32,
        };
        let Some(gid) = obj.global_id(sym_index) else {
            return false;
        };
        if ctx.symbol_db.symbol(gid).owner() != Some(me) {
            return false;
        }
    }
    if !obj.is_symbol_section_live(esym) {
        return false;
    }
    true
}

/// Computes the final address of a global symbol. Unresolved weak references
/// get zero; imports get their copy-relocated address or zero.
pub(crate) fn symbol_address(ctx: &Context, image: &OutputImage, gid: SymbolId) -> Result<u64> {
    let sym = ctx.symbol_db.symbol(gid);
    let Some(owner) = sym.owner() else {
        return Ok(0);
    };
    match &ctx.files[owner.file.as_usize()] {
        InputFile::Internal(_) => Ok(sym.value),
        InputFile::Object(o) => owned_symbol_address(ctx, image, o, owner.sym_index as usize),
        InputFile::Shared(_) => {
            if sym.has_copyrel {
                Ok(sym.value)
            } else if sym.plt_idx >= 0 {
                Ok(image.plt_entry_address(sym.plt_idx))
            } else {
                Ok(0)
            }
        }
    }
}

fn write_pods<T: bytemuck::Pod>(out: &mut [u8], values: &[T]) {
    let bytes: &[u8] = bytemuck::cast_slice(values);
    out[..bytes.len()].copy_from_slice(bytes);
}

fn write_value(out: &mut [u8], value: i64) {
    let bytes = value.to_le_bytes();
    let n = out.len();
    out.copy_from_slice(&bytes[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_table() {
        let mut t = StringTable::new();
        assert_eq!(t.add(b"foo"), 1);
        assert_eq!(t.add(b"bar"), 5);
        assert_eq!(t.add(b"foo"), 1);
        assert_eq!(t.get(b"bar"), 5);
        assert_eq!(t.get(b""), 0);
        assert_eq!(t.bytes, b"\0foo\0bar\0");
    }

    #[test]
    fn test_got_slot_accounting() {
        let mut got = GotSection::default();
        let mut db = crate::symbol_db::SymbolDb::new();
        let s1 = db.intern(crate::symbol::SymbolName::new(b"a")).unwrap();
        let s2 = db.intern(crate::symbol::SymbolName::new(b"b")).unwrap();
        assert_eq!(got.add(Some(s1), GotEntryKind::Regular), 0);
        assert_eq!(got.add(Some(s2), GotEntryKind::TlsGd), 1);
        assert_eq!(got.add(None, GotEntryKind::TlsLd), 3);
        assert_eq!(got.add(Some(s1), GotEntryKind::TpOff), 5);
        assert_eq!(got.num_slots, 6);
    }

    #[test]
    fn test_copyrel_alignment() {
        let mut db = crate::symbol_db::SymbolDb::new();
        let s = db.intern(crate::symbol::SymbolName::new(b"v")).unwrap();
        let mut copyrel = CopyrelSection::default();
        assert_eq!(copyrel.add(s, 4), 0);
        assert_eq!(copyrel.add(s, 32), 32);
        assert_eq!(copyrel.size, 64);
        assert_eq!(copyrel.alignment, 32);
    }

    #[test]
    fn test_write_value_truncates() {
        let mut buf = [0u8; 4];
        write_value(&mut buf, -4);
        assert_eq!(buf, (-4i32).to_le_bytes());
    }
}
