//! Section layout: groups input sections into output sections, assigns
//! intra-section offsets with a two-pass parallel prefix, orders chunks for
//! segment packing, assigns file offsets and virtual addresses, and binds the
//! linker-synthesized symbols once addresses are final.

use crate::alignment::align_to;
use crate::context::Context;
use crate::context::FileId;
use crate::context::INTERNAL_FILE_ID;
use crate::elf;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::object_file::SectionSlot;
use crate::output_chunks::Chunk;
use crate::output_chunks::ChunkKind;
use crate::output_chunks::OutputImage;
use crate::symbol::Owner;
use crate::symbol::SymbolName;
use object::Object;
use object::ObjectSymbol;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

/// An output section aggregating input sections from many files.
pub(crate) struct OutputSec<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) members: Vec<SectionRef>,
    pub(crate) size: u64,
    pub(crate) addralign: u64,
}

#[derive(Clone, Copy)]
pub(crate) struct SectionRef {
    pub(crate) file: FileId,
    pub(crate) slot: u32,
}

/// Builds the output-section registry from the live input sections and
/// records each input section's assignment. The registry is ordered by
/// `(name, type, flags)` so downstream phases are deterministic.
#[tracing::instrument(skip_all, name = "Assign output sections")]
pub(crate) fn assign_output_sections<'data>(ctx: &mut Context<'data>) -> Vec<OutputSec<'data>> {
    let mut keys: BTreeSet<(&[u8], u32, u64)> = BTreeSet::new();
    for &file_id in &ctx.live_objects {
        for slot in &ctx.obj(file_id).sections {
            if let SectionSlot::Regular(sec) = slot {
                keys.insert((sec.out_name, sec.sh_type, sec.sh_flags));
            }
        }
    }
    let ids: BTreeMap<(&[u8], u32, u64), u32> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| (*k, i as u32))
        .collect();

    ctx.files.par_iter_mut().for_each(|file| {
        let Some(obj) = file.as_object_mut() else {
            return;
        };
        if !obj.is_alive.load(Ordering::Acquire) {
            return;
        }
        for slot in &mut obj.sections {
            if let SectionSlot::Regular(sec) = slot {
                sec.osec = ids[&(sec.out_name, sec.sh_type, sec.sh_flags)];
            }
        }
    });

    keys.into_iter()
        .map(|(name, sh_type, sh_flags)| OutputSec {
            name,
            sh_type,
            sh_flags,
            members: Vec::new(),
            size: 0,
            addralign: 1,
        })
        .collect()
}

/// So far each input section knows its output section, but there's no
/// reverse edge. An output section may contain millions of input sections,
/// so the member lists are built from per-slice vectors in parallel and
/// concatenated in slice order, which is file-priority order.
#[tracing::instrument(skip_all, name = "Bin sections")]
pub(crate) fn bin_sections(ctx: &Context, osecs: &mut [OutputSec]) {
    if ctx.live_objects.is_empty() {
        return;
    }
    let unit = ctx.live_objects.len().div_ceil(128);
    let slices: Vec<&[FileId]> = ctx.live_objects.chunks(unit).collect();
    let num_osec = osecs.len();

    let groups: Vec<Vec<Vec<SectionRef>>> = slices
        .par_iter()
        .map(|slice| {
            let mut group = vec![Vec::new(); num_osec];
            for &file_id in *slice {
                let obj = ctx.obj(file_id);
                for (slot_index, slot) in obj.sections.iter().enumerate() {
                    if let SectionSlot::Regular(sec) = slot {
                        group[sec.osec as usize].push(SectionRef {
                            file: file_id,
                            slot: slot_index as u32,
                        });
                    }
                }
            }
            group
        })
        .collect();

    let mut sizes = vec![0usize; num_osec];
    for group in &groups {
        for (i, members) in group.iter().enumerate() {
            sizes[i] += members.len();
        }
    }

    osecs.par_iter_mut().enumerate().for_each(|(i, osec)| {
        osec.members.reserve(sizes[i]);
        for group in &groups {
            osec.members.extend_from_slice(&group[i]);
        }
    });
}

/// Assigns offsets within each output section to its input sections using a
/// two-pass parallel prefix over slices of 10,000 members, which avoids
/// serialising across millions of sections while staying deterministic.
#[tracing::instrument(skip_all, name = "Set input section offsets")]
pub(crate) fn set_isec_offsets(ctx: &Context, osecs: &mut [OutputSec]) {
    osecs.par_iter_mut().for_each(|osec| {
        if osec.members.is_empty() {
            return;
        }
        let slices: Vec<&[SectionRef]> = osec.members.chunks(10_000).collect();

        let local: Vec<(u64, u64)> = slices
            .par_iter()
            .map(|slice| {
                let mut off = 0u64;
                let mut align = 1u64;
                for member in *slice {
                    let sec = ctx.obj(member.file).section(member.slot).unwrap();
                    off = align_to(off, sec.addralign);
                    sec.offset.store(off, Ordering::Relaxed);
                    off += sec.size;
                    align = align.max(sec.addralign);
                }
                (off, align)
            })
            .collect();

        let align = local.iter().map(|(_, a)| *a).max().unwrap_or(1);
        let mut starts = vec![0u64; slices.len()];
        for i in 1..slices.len() {
            starts[i] = align_to(starts[i - 1] + local[i - 1].0, align);
        }

        slices
            .par_iter()
            .enumerate()
            .skip(1)
            .for_each(|(i, slice)| {
                for member in *slice {
                    let sec = ctx.obj(member.file).section(member.slot).unwrap();
                    sec.offset.fetch_add(starts[i], Ordering::Relaxed);
                }
            });

        osec.size = starts[slices.len() - 1] + local[slices.len() - 1].0;
        osec.addralign = align;
    });
}

/// The 6-bit key that orders chunks for segment packing:
/// alloc-ro-data, alloc-ro-code, tdata, tbss, data, bss, then non-alloc.
pub(crate) fn section_rank(shdr: &elf::SectionHeader) -> u32 {
    let alloc = shdr.flags & shf::ALLOC != 0;
    let writable = shdr.flags & shf::WRITE != 0;
    let exec = shdr.flags & shf::EXECINSTR != 0;
    let tls = shdr.flags & shf::TLS != 0;
    let nobits = shdr.ty == sht::NOBITS;
    ((!alloc as u32) << 5)
        | ((writable as u32) << 4)
        | ((exec as u32) << 3)
        | ((!tls as u32) << 2)
        | nobits as u32
}

/// Walks chunks in their final order assigning file offsets and (for
/// allocatable chunks) virtual addresses, keeping `vaddr` and `fileoff`
/// congruent modulo the page size. Returns the output file size.
#[tracing::instrument(skip_all, name = "Set output section offsets")]
pub(crate) fn set_osec_offsets(ctx: &Context, image: &mut OutputImage) -> u64 {
    const PAGE_SIZE: u64 = elf::PAGE_SIZE;
    let mut fileoff = 0u64;
    let mut vaddr = ctx.args.image_base();

    for chunk in &mut image.chunks {
        if chunk.starts_new_ptload {
            vaddr = align_to(vaddr, PAGE_SIZE);
        }

        if vaddr % PAGE_SIZE > fileoff % PAGE_SIZE {
            fileoff += vaddr % PAGE_SIZE - fileoff % PAGE_SIZE;
        } else if vaddr % PAGE_SIZE < fileoff % PAGE_SIZE {
            fileoff = align_to(fileoff, PAGE_SIZE) + vaddr % PAGE_SIZE;
        }

        fileoff = align_to(fileoff, chunk.shdr.alignment.max(1));
        vaddr = align_to(vaddr, chunk.shdr.alignment.max(1));

        chunk.shdr.offset = fileoff;
        if chunk.shdr.flags & shf::ALLOC != 0 {
            chunk.shdr.address = vaddr;
        }

        let is_bss = chunk.shdr.ty == sht::NOBITS;
        if !is_bss {
            fileoff += chunk.shdr.size;
        }

        let is_tbss = is_bss && chunk.shdr.flags & shf::TLS != 0;
        if !is_tbss {
            vaddr += chunk.shdr.size;
        }
    }

    image.compute_tls_range();
    fileoff
}

/// Linker-synthesized symbol definitions owned by the internal file. The
/// value of each is fixed only once layout has run.
#[derive(Clone, Debug)]
pub(crate) enum SyntheticDef {
    BssStart,
    EhdrStart,
    RelaIpltStart,
    RelaIpltEnd,
    InitArrayStart,
    InitArrayEnd,
    FiniArrayStart,
    FiniArrayEnd,
    End,
    Etext,
    Edata,
    Dynamic,
    GlobalOffsetTable,
    SectionStart(Vec<u8>),
    SectionStop(Vec<u8>),
}

/// Registers the internal file's symbols: the fixed set plus
/// `__start_<name>`/`__stop_<name>` for every chunk whose name is a valid C
/// identifier. Names defined by input files are left alone.
#[tracing::instrument(skip_all, name = "Create synthetic symbols")]
pub(crate) fn setup_internal_symbols(ctx: &mut Context, image: &OutputImage) -> Result {
    let mut defs: Vec<(SymbolName<'static>, SyntheticDef)> = vec![
        (SymbolName::new(b"__bss_start"), SyntheticDef::BssStart),
        (SymbolName::new(b"__ehdr_start"), SyntheticDef::EhdrStart),
        (SymbolName::new(b"__rela_iplt_start"), SyntheticDef::RelaIpltStart),
        (SymbolName::new(b"__rela_iplt_end"), SyntheticDef::RelaIpltEnd),
        (SymbolName::new(b"__init_array_start"), SyntheticDef::InitArrayStart),
        (SymbolName::new(b"__init_array_end"), SyntheticDef::InitArrayEnd),
        (SymbolName::new(b"__fini_array_start"), SyntheticDef::FiniArrayStart),
        (SymbolName::new(b"__fini_array_end"), SyntheticDef::FiniArrayEnd),
        (SymbolName::new(b"_end"), SyntheticDef::End),
        (SymbolName::new(b"end"), SyntheticDef::End),
        (SymbolName::new(b"_etext"), SyntheticDef::Etext),
        (SymbolName::new(b"etext"), SyntheticDef::Etext),
        (SymbolName::new(b"_edata"), SyntheticDef::Edata),
        (SymbolName::new(b"edata"), SyntheticDef::Edata),
        (SymbolName::new(b"_DYNAMIC"), SyntheticDef::Dynamic),
        (
            SymbolName::new(b"_GLOBAL_OFFSET_TABLE_"),
            SyntheticDef::GlobalOffsetTable,
        ),
    ];

    for chunk in &image.chunks {
        if chunk.kind.is_header() || !is_c_identifier(chunk.name) {
            continue;
        }
        for (prefix, def) in [
            (&b"__start_"[..], SyntheticDef::SectionStart(chunk.name.to_vec())),
            (&b"__stop_"[..], SyntheticDef::SectionStop(chunk.name.to_vec())),
        ] {
            let mut name = Vec::with_capacity(prefix.len() + chunk.name.len());
            name.extend_from_slice(prefix);
            name.extend_from_slice(chunk.name);
            // These names are constructed at link time, so give them a
            // static lifetime the way an intern arena would.
            let leaked: &'static [u8] = Box::leak(name.into_boxed_slice());
            defs.push((SymbolName::new(leaked), def));
        }
    }

    for (name, def) in defs {
        let gid = ctx.symbol_db.intern(name)?;
        let sym = ctx.symbol_db.symbol(gid);
        if sym.owner().is_some() {
            continue;
        }
        let internal = ctx.internal_mut();
        let sym_index = internal.definitions.len() as u32;
        internal.definitions.push(def);
        internal.defined.push(gid);
        ctx.symbol_db.symbol(gid).set_owner(Owner {
            file: INTERNAL_FILE_ID,
            sym_index,
        });
    }
    Ok(())
}

/// Binds the internal file's symbols against the laid-out chunks.
#[tracing::instrument(skip_all, name = "Fix synthetic symbols")]
pub(crate) fn fix_synthetic_symbols(ctx: &mut Context, image: &OutputImage) {
    let defined = ctx.internal().defined.clone();
    let definitions = ctx.internal().definitions.clone();
    for (gid, def) in defined.iter().zip(definitions.iter()) {
        let target = match def {
            SyntheticDef::BssStart => image
                .chunks
                .iter()
                .find(|c| matches!(c.kind, ChunkKind::Regular(_)) && c.name == b".bss")
                .map(|c| (c.shdr.address, c.shndx)),
            SyntheticDef::EhdrStart => image
                .chunk(ChunkKind::Ehdr)
                .map(|c| (c.shdr.address, 1)),
            SyntheticDef::RelaIpltStart => Some(
                image
                    .chunk(ChunkKind::RelPlt)
                    .map(|c| (c.shdr.address, c.shndx))
                    .unwrap_or((0, 0)),
            ),
            SyntheticDef::RelaIpltEnd => Some(
                image
                    .chunk(ChunkKind::RelPlt)
                    .map(|c| (c.shdr.address + c.shdr.size, c.shndx))
                    .unwrap_or((0, 0)),
            ),
            SyntheticDef::InitArrayStart => image
                .chunk_by_type(sht::INIT_ARRAY)
                .map(|c| (c.shdr.address, c.shndx)),
            SyntheticDef::InitArrayEnd => image
                .chunk_by_type(sht::INIT_ARRAY)
                .map(|c| (c.shdr.address + c.shdr.size, c.shndx)),
            SyntheticDef::FiniArrayStart => image
                .chunk_by_type(sht::FINI_ARRAY)
                .map(|c| (c.shdr.address, c.shndx)),
            SyntheticDef::FiniArrayEnd => image
                .chunk_by_type(sht::FINI_ARRAY)
                .map(|c| (c.shdr.address + c.shdr.size, c.shndx)),
            SyntheticDef::End => last_chunk_end(image, |c| c.shdr.flags & shf::ALLOC != 0),
            SyntheticDef::Etext => {
                last_chunk_end(image, |c| c.shdr.flags & shf::EXECINSTR != 0)
            }
            SyntheticDef::Edata => last_chunk_end(image, |c| {
                c.shdr.flags & shf::ALLOC != 0 && c.shdr.ty != sht::NOBITS
            }),
            SyntheticDef::Dynamic => image
                .chunk(ChunkKind::Dynamic)
                .map(|c| (c.shdr.address, c.shndx)),
            SyntheticDef::GlobalOffsetTable => image
                .chunk(ChunkKind::GotPlt)
                .map(|c| (c.shdr.address, c.shndx)),
            SyntheticDef::SectionStart(name) => image
                .chunks
                .iter()
                .find(|c| c.name == &name[..])
                .map(|c| (c.shdr.address, c.shndx)),
            SyntheticDef::SectionStop(name) => image
                .chunks
                .iter()
                .find(|c| c.name == &name[..])
                .map(|c| (c.shdr.address + c.shdr.size, c.shndx)),
        };
        let (value, shndx) = target.unwrap_or((0, 0));
        let sym = ctx.symbol_db.symbol_mut(*gid);
        sym.value = value;
        sym.shndx = shndx;
    }

    // Copy-relocated symbols (and their aliases) now get their final
    // addresses within .bss.
    if let Some(copyrel) = image.chunk(ChunkKind::Copyrel) {
        let base = copyrel.shdr.address;
        let shndx = copyrel.shndx;
        let all: Vec<_> = image
            .copyrel
            .syms
            .iter()
            .chain(&image.copyrel.aliases)
            .copied()
            .collect();
        for (gid, offset) in all {
            let sym = ctx.symbol_db.symbol_mut(gid);
            sym.value = base + offset;
            sym.shndx = shndx;
        }
    }
}

fn last_chunk_end(image: &OutputImage, pred: impl Fn(&Chunk) -> bool) -> Option<(u64, u32)> {
    image
        .chunks
        .iter()
        .filter(|c| !c.kind.is_header() && pred(c))
        .last()
        .map(|c| (c.shdr.address + c.shdr.size, c.shndx))
}

/// Counts the .symtab/.strtab contribution of every live file in parallel,
/// then assigns start indices serially: the null entry, then every file's
/// locals, then every file's globals, with the internal file's synthetic
/// symbols last.
#[tracing::instrument(skip_all, name = "Compute symbol table sizes")]
pub(crate) fn compute_symtab(ctx: &mut Context, image: &mut OutputImage) -> Result {
    use crate::object_file::SymtabSizes;
    use crate::output_chunks::symtab_includes;

    let counts: Vec<(u32, u32, u32)> = ctx
        .live_objects
        .par_iter()
        .map(|&file_id| {
            let obj = ctx.obj(file_id);
            let mut num_locals = 0u32;
            let mut num_globals = 0u32;
            let mut strtab = 0u32;
            let count = obj.object.symbols().count();
            for sym_index in 1..count + 1 {
                let Ok(esym) = obj.elf_symbol(sym_index) else {
                    continue;
                };
                let is_local = esym.is_local();
                if !symtab_includes(ctx, obj, &esym, is_local, sym_index) {
                    continue;
                }
                strtab += esym.name_bytes().map(|n| n.len()).unwrap_or(0) as u32 + 1;
                if is_local {
                    num_locals += 1;
                } else {
                    num_globals += 1;
                }
            }
            (num_locals, num_globals, strtab)
        })
        .collect();

    let internal_globals = ctx.internal().defined.len() as u32;
    let internal_strtab: u32 = ctx
        .internal()
        .defined
        .iter()
        .map(|&gid| ctx.symbol_db.name(gid).bytes().len() as u32 + 1)
        .sum();
    let total_locals: u32 = counts.iter().map(|c| c.0).sum();
    let total_globals: u32 = counts.iter().map(|c| c.1).sum();

    let mut local_at = 1u32;
    let mut global_at = 1 + total_locals;
    let mut str_at = 1u32;
    let Context {
        files,
        live_objects,
        ..
    } = ctx;
    for (i, &file_id) in live_objects.iter().enumerate() {
        let (num_locals, num_globals, strtab_size) = counts[i];
        let obj = files[file_id.as_usize()]
            .as_object_mut()
            .expect("live object");
        obj.symtab = SymtabSizes {
            num_locals,
            num_globals,
            strtab_size,
            local_start: local_at,
            global_start: global_at,
            strtab_start: str_at,
        };
        local_at += num_locals;
        global_at += num_globals;
        str_at += strtab_size;
    }
    let internal = ctx.internal_mut();
    internal.symtab = SymtabSizes {
        num_locals: 0,
        num_globals: internal_globals,
        strtab_size: internal_strtab,
        local_start: local_at,
        global_start: global_at,
        strtab_start: str_at,
    };

    image.num_locals = total_locals;
    image.num_globals = total_globals + internal_globals;
    image.strtab_size = str_at + internal_strtab;

    let input_sections = ctx
        .live_objects
        .iter()
        .map(|&id| ctx.obj(id).sections.len())
        .sum();
    let undefined = ctx
        .symbol_db
        .ids()
        .filter(|&id| ctx.symbol_db.symbol(id).owner().is_none())
        .count();
    ctx.stats.defined_syms = (total_locals + total_globals + internal_globals) as usize;
    ctx.stats.input_sections = input_sections;
    ctx.stats.undefined_syms = undefined;
    Ok(())
}

pub(crate) fn is_c_identifier(name: &[u8]) -> bool {
    if name.is_empty() {
        return false;
    }
    if name[0].is_ascii_digit() {
        return false;
    }
    name.iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Prints the memory map when -print-map is given.
pub(crate) fn print_map(image: &OutputImage) {
    println!("{:<20} {:>16} {:>16} {:>10}", "section", "address", "offset", "size");
    for chunk in &image.chunks {
        let name = if chunk.kind.is_header() {
            match chunk.kind {
                ChunkKind::Ehdr => "<ehdr>",
                ChunkKind::Phdr => "<phdr>",
                _ => "<shdr>",
            }
            .as_bytes()
        } else {
            chunk.name
        };
        println!(
            "{:<20} {:>16x} {:>16x} {:>10x}",
            String::from_utf8_lossy(name),
            chunk.shdr.address,
            chunk.shdr.offset,
            chunk.shdr.size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shdr(ty: u32, flags: u64) -> elf::SectionHeader {
        elf::SectionHeader {
            ty,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn test_section_rank_ordering() {
        let rodata = section_rank(&shdr(sht::PROGBITS, shf::ALLOC));
        let text = section_rank(&shdr(sht::PROGBITS, shf::ALLOC | shf::EXECINSTR));
        let tdata = section_rank(&shdr(sht::PROGBITS, shf::ALLOC | shf::WRITE | shf::TLS));
        let tbss = section_rank(&shdr(sht::NOBITS, shf::ALLOC | shf::WRITE | shf::TLS));
        let data = section_rank(&shdr(sht::PROGBITS, shf::ALLOC | shf::WRITE));
        let bss = section_rank(&shdr(sht::NOBITS, shf::ALLOC | shf::WRITE));
        let symtab = section_rank(&shdr(sht::SYMTAB, 0));
        let order = [rodata, text, tdata, tbss, data, bss, symtab];
        let mut sorted = order;
        sorted.sort();
        assert_eq!(order, sorted, "expected rank order {order:?}");
    }

    #[test]
    fn test_is_c_identifier() {
        assert!(is_c_identifier(b"my_section"));
        assert!(is_c_identifier(b"data1"));
        assert!(!is_c_identifier(b".text"));
        assert!(!is_c_identifier(b"1data"));
        assert!(!is_c_identifier(b""));
    }
}
