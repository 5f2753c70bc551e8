//! Scans relocations of every live input section, setting requirement bits
//! on the referenced symbols, and then populates the synthetic sections from
//! those bits in a deterministic order. The sizes of the GOT, PLT, copy-rel
//! region and dynamic symbol table all fall out of this phase.

use crate::context::Context;
use crate::context::FileId;
use crate::elf;
use crate::elf::RelocationKind;
use crate::error::Result;
use crate::object_file::SectionSlot;
use crate::output_chunks::GotEntryKind;
use crate::output_chunks::OutputImage;
use crate::symbol::flags;
use crate::symbol_db::SymbolId;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use object::RelocationTarget;
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations(ctx: &mut Context, image: &mut OutputImage) -> Result {
    let needs_tlsld = AtomicBool::new(false);
    scan(ctx, &needs_tlsld);
    // Exit if there was a relocation that refers to an undefined symbol.
    ctx.diags.checkpoint()?;
    aggregate(ctx, image, needs_tlsld.into_inner())
}

fn scan(ctx: &Context, needs_tlsld: &AtomicBool) {
    ctx.live_objects.par_iter().for_each(|&file_id| {
        let obj = ctx.obj(file_id);
        for (slot_index, slot) in obj.sections.iter().enumerate() {
            if !matches!(slot, SectionSlot::Regular(_)) {
                continue;
            }
            let Ok(section) = obj
                .object
                .section_by_index(object::SectionIndex(slot_index))
            else {
                continue;
            };
            for (_, rel) in section.relocations() {
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
                if info.kind == RelocationKind::TlsLd {
                    needs_tlsld.store(true, Ordering::Relaxed);
                }
                match obj.global_id(sym_index.0) {
                    Some(gid) => scan_global(ctx, obj, gid, sym_index.0, info.kind),
                    None => scan_local(ctx, obj, sym_index.0, info.kind),
                }
            }
        }
    });
}

fn scan_global(
    ctx: &Context,
    obj: &crate::object_file::ObjectFile,
    gid: SymbolId,
    sym_index: usize,
    kind: RelocationKind,
) {
    let sym = ctx.symbol_db.symbol(gid);
    let owner = sym.owner();
    if owner.is_none() {
        let weak = obj
            .elf_symbol(sym_index)
            .map(|s| s.is_weak())
            .unwrap_or(false);
        if !weak {
            ctx.diags.error(format!(
                "undefined symbol: {obj}: {}",
                ctx.symbol_db.name(gid)
            ));
        }
        return;
    }
    let imported = sym.is_imported;
    match kind {
        RelocationKind::PltRelative => {
            if imported {
                sym.set_flag(flags::NEEDS_PLT | flags::NEEDS_DYNSYM);
            }
        }
        RelocationKind::Got | RelocationKind::GotRelative => {
            sym.set_flag(flags::NEEDS_GOT);
            if imported {
                sym.set_flag(flags::NEEDS_DYNSYM);
            }
        }
        RelocationKind::GotTpOff => {
            sym.set_flag(flags::NEEDS_GOTTPOFF);
            if imported {
                sym.set_flag(flags::NEEDS_DYNSYM);
            }
        }
        RelocationKind::TlsGd => {
            sym.set_flag(flags::NEEDS_TLSGD);
            if imported {
                sym.set_flag(flags::NEEDS_DYNSYM);
            }
        }
        RelocationKind::TlsLd => {
            sym.set_flag(flags::NEEDS_TLSLD);
        }
        RelocationKind::Absolute | RelocationKind::Relative => {
            if imported {
                if imported_is_function(ctx, gid) {
                    // Direct references to an imported function use a
                    // canonical PLT entry as the function's address.
                    sym.set_flag(flags::NEEDS_PLT | flags::NEEDS_DYNSYM);
                } else {
                    sym.set_flag(flags::NEEDS_COPYREL | flags::NEEDS_DYNSYM);
                }
            }
        }
        RelocationKind::TpOff | RelocationKind::DtpOff => {}
    }
}

fn scan_local(
    ctx: &Context,
    obj: &crate::object_file::ObjectFile,
    sym_index: usize,
    kind: RelocationKind,
) {
    // Local symbols can't require dynamic tables; a GOT entry for a local is
    // only needed for position-independent code, which we don't generate.
    match kind {
        RelocationKind::Got | RelocationKind::GotRelative | RelocationKind::TlsGd => {
            let name = obj
                .elf_symbol(sym_index)
                .ok()
                .and_then(|s| s.name_bytes().ok().map(|b| String::from_utf8_lossy(b).into_owned()))
                .unwrap_or_default();
            ctx.diags.error(format!(
                "{obj}: unsupported GOT relocation against local symbol `{name}`"
            ));
        }
        _ => {}
    }
}

fn imported_is_function(ctx: &Context, gid: SymbolId) -> bool {
    let Some(owner) = ctx.symbol_db.symbol(gid).owner() else {
        return false;
    };
    let Some(shared) = ctx.files[owner.file.as_usize()].as_shared() else {
        return false;
    };
    let st_type = shared.dynsym(owner.sym_index).info & 0xf;
    st_type == elf::st::TYPE_FUNC || st_type == elf::st::TYPE_GNU_IFUNC
}

/// Flattens the flagged symbols of every live file in priority order and
/// feeds them to the synthetic sections. This runs single threaded so that
/// every assigned index is deterministic.
fn aggregate(ctx: &mut Context, image: &mut OutputImage, needs_tlsld: bool) -> Result {
    let order: Vec<FileId> = ctx
        .live_objects
        .iter()
        .chain(&ctx.live_dsos)
        .copied()
        .collect();
    let per_file: Vec<Vec<SymbolId>> = order
        .par_iter()
        .map(|&file_id| {
            let file = ctx.file(file_id);
            let global_ids = match file {
                crate::context::InputFile::Object(o) => &o.global_ids,
                crate::context::InputFile::Shared(s) => &s.global_ids,
                crate::context::InputFile::Internal(_) => return Vec::new(),
            };
            global_ids
                .iter()
                .copied()
                .filter(|&gid| {
                    let sym = ctx.symbol_db.symbol(gid);
                    sym.flags() != 0 && sym.owner().map(|o| o.file) == Some(file_id)
                })
                .collect()
        })
        .collect();

    let mut seen = vec![false; ctx.symbol_db.num_symbols()];
    for gid in per_file.into_iter().flatten() {
        if std::mem::replace(&mut seen[gid.as_usize()], true) {
            continue;
        }
        let sym_flags = ctx.symbol_db.symbol(gid).flags();

        if ctx.symbol_db.symbol(gid).is_imported || sym_flags & flags::NEEDS_DYNSYM != 0 {
            add_dynsym(ctx, image, gid);
        }
        if sym_flags & flags::NEEDS_GOT != 0 {
            let slot = image.got.add(Some(gid), GotEntryKind::Regular);
            ctx.symbol_db.symbol_mut(gid).got_idx = slot as i32;
        }
        if sym_flags & flags::NEEDS_PLT != 0 {
            add_dynsym(ctx, image, gid);
            let index = image.plt.syms.len() as i32;
            image.plt.syms.push(gid);
            ctx.symbol_db.symbol_mut(gid).plt_idx = index;
        }
        if sym_flags & flags::NEEDS_GOTTPOFF != 0 {
            let slot = image.got.add(Some(gid), GotEntryKind::TpOff);
            ctx.symbol_db.symbol_mut(gid).gottpoff_idx = slot as i32;
        }
        if sym_flags & flags::NEEDS_TLSGD != 0 {
            let slot = image.got.add(Some(gid), GotEntryKind::TlsGd);
            ctx.symbol_db.symbol_mut(gid).tlsgd_idx = slot as i32;
        }
        if sym_flags & flags::NEEDS_COPYREL != 0 {
            add_copy_relocation(ctx, image, gid)?;
        }
    }

    if needs_tlsld {
        image.got.tlsld_slot = image.got.add(None, GotEntryKind::TlsLd) as i32;
    }
    Ok(())
}

fn add_dynsym(ctx: &mut Context, image: &mut OutputImage, gid: SymbolId) {
    if ctx.symbol_db.symbol(gid).dynsym_idx != -1 {
        return;
    }
    image.dynsym.syms.push(gid);
    let idx = image.dynsym.syms.len() as i32;
    ctx.symbol_db.symbol_mut(gid).dynsym_idx = idx;
    let name = ctx.symbol_db.name(gid);
    image.dynstr.add(name.bytes());
}

/// Reserves .bss storage for a symbol imported by a direct data reference and
/// clones every alias the defining shared object has at the same address into
/// the dynamic symbol table.
fn add_copy_relocation(ctx: &mut Context, image: &mut OutputImage, gid: SymbolId) -> Result {
    let Some(owner) = ctx.symbol_db.symbol(gid).owner() else {
        return Ok(());
    };
    let (size, aliases) = {
        let shared = ctx.shared(owner.file);
        let size = shared.dynsym(owner.sym_index).size.max(1);
        let aliases: Vec<(u32, SymbolId)> = shared
            .find_aliases(owner.sym_index)
            .into_iter()
            .filter_map(|dynsym_index| {
                shared
                    .global_map
                    .iter()
                    .position(|&i| i == dynsym_index)
                    .map(|pos| (dynsym_index, shared.global_ids[pos]))
            })
            .collect();
        (size, aliases)
    };

    let offset = image.copyrel.add(gid, size);
    {
        let sym = ctx.symbol_db.symbol_mut(gid);
        sym.has_copyrel = true;
        sym.value = offset;
    }
    add_dynsym(ctx, image, gid);

    for (_, alias_gid) in aliases {
        if alias_gid == gid {
            continue;
        }
        image.copyrel.aliases.push((alias_gid, offset));
        let alias = ctx.symbol_db.symbol_mut(alias_gid);
        alias.has_copyrel = true;
        alias.value = offset;
        add_dynsym(ctx, image, alias_gid);
    }
    Ok(())
}
