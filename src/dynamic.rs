//! Dynamic symbol export and symbol versioning: populates .dynsym beyond
//! what the relocation scan required, fixes the dynamic symbol order, and
//! fills .gnu.version / .gnu.version_r.

use crate::context::Context;
use crate::context::InputFile;
use crate::elf;
use crate::error::Result;
use crate::output_chunks::OutputImage;
use crate::symbol::Owner;
use crate::symbol::SymbolName;
use crate::symbol_db::SymbolId;
use object::ObjectSymbol;
use rayon::prelude::*;

/// With -export-dynamic, every globally-defined symbol in every live object
/// is exported; names listed in version scripts are always exported.
#[tracing::instrument(skip_all, name = "Export dynamic symbols")]
pub(crate) fn export_dynamic(ctx: &mut Context, image: &mut OutputImage) -> Result {
    if ctx.args.export_dynamic {
        ctx.live_objects.par_iter().for_each(|&file_id| {
            let obj = ctx.obj(file_id);
            for (i, &gid) in obj.global_ids.iter().enumerate() {
                let sym_index = (obj.first_global + i) as u32;
                let sym = ctx.symbol_db.symbol(gid);
                if sym.owner()
                    == Some(Owner {
                        file: file_id,
                        sym_index,
                    })
                {
                    sym.set_ver_idx(elf::VER_NDX_GLOBAL);
                }
            }
        });
    }

    for name in ctx.args.globals.clone() {
        let gid = ctx.symbol_db.intern(SymbolName::new(Box::leak(
            name.into_bytes().into_boxed_slice(),
        )))?;
        ctx.symbol_db.symbol(gid).set_ver_idx(elf::VER_NDX_GLOBAL);
    }

    // Append exported symbols to .dynsym in priority order.
    for &file_id in &ctx.live_objects.clone() {
        let obj = ctx.obj(file_id);
        let candidates: Vec<(SymbolId, u32)> = obj
            .global_ids
            .iter()
            .enumerate()
            .map(|(i, &gid)| (gid, (obj.first_global + i) as u32))
            .collect();
        for (gid, sym_index) in candidates {
            let sym = ctx.symbol_db.symbol(gid);
            if sym.ver_idx() == elf::VER_NDX_LOCAL || sym.dynsym_idx != -1 {
                continue;
            }
            if sym.owner()
                != Some(Owner {
                    file: file_id,
                    sym_index,
                })
            {
                continue;
            }
            let obj = ctx.obj(file_id);
            let Ok(esym) = obj.elf_symbol(sym_index as usize) else {
                continue;
            };
            if esym.is_undefined() || !obj.is_symbol_section_live(&esym) {
                continue;
            }
            image.dynsym.syms.push(gid);
            ctx.symbol_db.symbol_mut(gid).dynsym_idx = image.dynsym.syms.len() as i32;
            let name = ctx.symbol_db.name(gid);
            image.dynstr.add(name.bytes());
        }
    }
    Ok(())
}

/// Re-orders .dynsym by name so the output is independent of scan order, and
/// reassigns the indices that relocation entries will reference.
#[tracing::instrument(skip_all, name = "Sort dynamic symbols")]
pub(crate) fn finalize_dynsym(ctx: &mut Context, image: &mut OutputImage) {
    image
        .dynsym
        .syms
        .sort_by_key(|&gid| ctx.symbol_db.name(gid).bytes());
    for (i, &gid) in image.dynsym.syms.iter().enumerate() {
        ctx.symbol_db.symbol_mut(gid).dynsym_idx = i as i32 + 1;
    }
}

/// Fills .gnu.version and .gnu.version_r: one Verneed record per shared
/// object we import versioned symbols from, one Vernaux per distinct version
/// within it, chained with vn_next/vna_next. Each dynamic symbol's versym
/// entry is the running Vernaux counter, which starts at 2.
#[tracing::instrument(skip_all, name = "Fill symbol versions")]
pub(crate) fn fill_symbol_versions(ctx: &mut Context, image: &mut OutputImage) -> Result {
    let mut versioned: Vec<SymbolId> = image
        .dynsym
        .syms
        .iter()
        .copied()
        .filter(|&gid| {
            let sym = ctx.symbol_db.symbol(gid);
            sym.ver_idx() >= 2 && sym.is_imported
        })
        .collect();
    if versioned.is_empty() {
        return Ok(());
    }

    let soname_of = |ctx: &Context, gid: SymbolId| -> String {
        let Some(owner) = ctx.symbol_db.symbol(gid).owner() else {
            return String::new();
        };
        match &ctx.files[owner.file.as_usize()] {
            InputFile::Shared(s) => s.soname.clone(),
            _ => String::new(),
        }
    };
    versioned.sort_by_key(|&gid| (soname_of(ctx, gid), ctx.symbol_db.symbol(gid).ver_idx()));

    let mut versym = vec![elf::VER_NDX_GLOBAL; image.dynsym.syms.len() + 1];
    versym[0] = 0;

    let mut buf: Vec<u8> = Vec::new();
    let mut version: u16 = 1;
    let mut verneed_pos: Option<usize> = None;
    let mut aux_pos: Option<usize> = None;
    let mut verneed_count = 0u32;

    let mut prev: Option<(String, u16)> = None;
    for &gid in &versioned {
        let soname = soname_of(ctx, gid);
        let ver_idx = ctx.symbol_db.symbol(gid).ver_idx();
        let Some(owner) = ctx.symbol_db.symbol(gid).owner() else {
            continue;
        };
        let verstr = ctx.shared(owner.file).version_string(ver_idx).to_vec();

        let new_file = prev.as_ref().map(|(s, _)| s != &soname).unwrap_or(true);
        let new_version = new_file || prev.as_ref().map(|(_, v)| *v != ver_idx).unwrap_or(true);

        if new_file {
            if let Some(pos) = verneed_pos {
                let next = (buf.len() - pos) as u32;
                buf[pos + 12..pos + 16].copy_from_slice(&next.to_le_bytes());
            }
            verneed_pos = Some(buf.len());
            aux_pos = None;
            verneed_count += 1;
            let record = elf::Verneed {
                vn_version: 1,
                vn_cnt: 0,
                vn_file: image.dynstr.add(soname.as_bytes()),
                vn_aux: core::mem::size_of::<elf::Verneed>() as u32,
                vn_next: 0,
            };
            buf.extend_from_slice(bytemuck::bytes_of(&record));
        }
        if new_version {
            if let Some(pos) = aux_pos {
                let next = core::mem::size_of::<elf::Vernaux>() as u32;
                buf[pos + 12..pos + 16].copy_from_slice(&next.to_le_bytes());
            }
            version += 1;
            // Bump vn_cnt on the current Verneed record.
            let pos = verneed_pos.unwrap();
            let cnt = u16::from_le_bytes([buf[pos + 2], buf[pos + 3]]) + 1;
            buf[pos + 2..pos + 4].copy_from_slice(&cnt.to_le_bytes());
            aux_pos = Some(buf.len());
            let aux = elf::Vernaux {
                vna_hash: elf::sysv_hash(&verstr),
                vna_flags: 0,
                vna_other: version,
                vna_name: image.dynstr.add(&verstr),
                vna_next: 0,
            };
            buf.extend_from_slice(bytemuck::bytes_of(&aux));
        }

        let dynsym_idx = ctx.symbol_db.symbol(gid).dynsym_idx.max(0) as usize;
        versym[dynsym_idx] = version;
        prev = Some((soname, ver_idx));
    }

    image.versym = versym;
    image.verneed = buf;
    image.verneed_count = verneed_count;
    Ok(())
}
