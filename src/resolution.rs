//! Symbol resolution. Stage 1 registers every defined global into the
//! interned symbol table, electing a winner per name with a lock-free
//! compare-and-swap over a strict total order. Stage 2 propagates liveness
//! from the initially-live files, pulling in archive members and as-needed
//! shared objects that are actually referenced.

use crate::context::Context;
use crate::context::FileId;
use crate::context::InputFile;
use crate::elf;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::symbol::unpack_owner;
use crate::symbol::Owner;
use object::ObjectSymbol;
use rayon::prelude::*;

/// Definition strength. The ordering encodes the resolution rules: a strong
/// definition beats a common, a common beats a weak; among commons the larger
/// wins; remaining ties go to the lower file priority, then the lower symbol
/// index so that the result is independent of thread interleaving.
#[derive(Clone, Copy, PartialEq, Eq)]
struct DefRank {
    class: u8,
    common_size: u64,
    priority: u32,
    sym_index: u32,
}

const CLASS_WEAK: u8 = 1;
const CLASS_COMMON: u8 = 2;
const CLASS_STRONG: u8 = 3;

fn rank(files: &[InputFile], owner: Owner) -> DefRank {
    let (class, common_size, priority) = match &files[owner.file.as_usize()] {
        InputFile::Object(o) => match o.elf_symbol(owner.sym_index as usize) {
            Ok(esym) => {
                if esym.is_common() {
                    (CLASS_COMMON, esym.size(), o.priority)
                } else if esym.is_weak() {
                    (CLASS_WEAK, 0, o.priority)
                } else {
                    (CLASS_STRONG, 0, o.priority)
                }
            }
            Err(_) => (CLASS_WEAK, 0, o.priority),
        },
        InputFile::Shared(s) => {
            let esym = s.dynsym(owner.sym_index);
            if esym.info >> 4 == elf::st::BIND_WEAK {
                (CLASS_WEAK, 0, s.priority)
            } else {
                (CLASS_STRONG, 0, s.priority)
            }
        }
        // The internal file only claims unowned names.
        InputFile::Internal(_) => (CLASS_WEAK, 0, 1),
    };
    DefRank {
        class,
        common_size,
        priority,
        sym_index: owner.sym_index,
    }
}

fn is_better(files: &[InputFile], a: Owner, b: Owner) -> bool {
    let ra = rank(files, a);
    let rb = rank(files, b);
    if ra.class != rb.class {
        return ra.class > rb.class;
    }
    if ra.class == CLASS_COMMON && ra.common_size != rb.common_size {
        return ra.common_size > rb.common_size;
    }
    if ra.priority != rb.priority {
        return ra.priority < rb.priority;
    }
    ra.sym_index < rb.sym_index
}

/// Installs `candidate` as the owner of `sym` unless a better definition is
/// already present.
fn register_definition(ctx: &Context, sym: &crate::symbol::Symbol, candidate: Owner) {
    loop {
        let current = sym.load_owner_packed();
        if let Some(existing) = unpack_owner(current) {
            if existing == candidate || !is_better(&ctx.files, candidate, existing) {
                return;
            }
        }
        if sym.compare_exchange_owner(current, candidate).is_ok() {
            return;
        }
    }
}

#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub(crate) fn resolve_symbols(ctx: &mut Context) -> Result {
    register_defined_symbols(ctx);
    mark_live_files(ctx);
    collect_live_files(ctx);
    mark_imported_symbols(ctx);
    trace_symbols(ctx);
    if ctx.args.trace {
        for &id in ctx.live_objects.iter().chain(&ctx.live_dsos) {
            println!("{}", ctx.file(id).name_for_display());
        }
    }
    Ok(())
}

fn register_defined_symbols(ctx: &Context) {
    ctx.files.par_iter().for_each(|file| match file {
        InputFile::Internal(_) => {}
        InputFile::Object(o) => {
            for (i, &gid) in o.global_ids.iter().enumerate() {
                let sym_index = o.first_global + i;
                let Ok(esym) = o.elf_symbol(sym_index) else {
                    continue;
                };
                if esym.is_undefined() {
                    continue;
                }
                register_definition(
                    ctx,
                    ctx.symbol_db.symbol(gid),
                    Owner {
                        file: o.file_id,
                        sym_index: sym_index as u32,
                    },
                );
            }
        }
        InputFile::Shared(s) => {
            for (i, &gid) in s.global_ids.iter().enumerate() {
                register_definition(
                    ctx,
                    ctx.symbol_db.symbol(gid),
                    Owner {
                        file: s.file_id,
                        sym_index: s.global_map[i],
                    },
                );
            }
        }
    });
}

/// Breadth-first liveness propagation. Workers feed newly-live object files
/// back into the pool by spawning further scope tasks.
fn mark_live_files(ctx: &Context) {
    rayon::scope(|scope| {
        for file in &ctx.files {
            if let InputFile::Object(o) = file {
                if file.is_alive() {
                    let file_id = o.file_id;
                    scope.spawn(move |scope| mark_live_references(ctx, file_id, scope));
                }
            }
        }
    });
}

fn mark_live_references<'scope>(
    ctx: &'scope Context,
    file_id: FileId,
    scope: &rayon::Scope<'scope>,
) {
    let obj = ctx.obj(file_id);
    for (i, &gid) in obj.global_ids.iter().enumerate() {
        let sym_index = obj.first_global + i;
        let Ok(esym) = obj.elf_symbol(sym_index) else {
            continue;
        };
        // Only non-weak references pull in archive members and as-needed
        // shared objects.
        if !esym.is_undefined() || esym.is_weak() {
            continue;
        }
        let Some(owner) = ctx.symbol_db.symbol(gid).owner() else {
            continue;
        };
        let target = ctx.file(owner.file);
        if target.mark_alive() {
            if matches!(target, InputFile::Object(_)) {
                let next = owner.file;
                scope.spawn(move |scope| mark_live_references(ctx, next, scope));
            }
        }
    }
}

fn collect_live_files(ctx: &mut Context) {
    let mut objects: Vec<FileId> = Vec::new();
    let mut dsos: Vec<FileId> = Vec::new();
    for (i, file) in ctx.files.iter().enumerate() {
        if !file.is_alive() {
            continue;
        }
        match file {
            InputFile::Object(_) => objects.push(FileId::new(i as u32)),
            InputFile::Shared(_) => dsos.push(FileId::new(i as u32)),
            InputFile::Internal(_) => {}
        }
    }
    objects.sort_by_key(|&id| ctx.priority(id));
    dsos.sort_by_key(|&id| ctx.priority(id));
    ctx.stats.objects = objects.len();
    ctx.stats.shared_objects = dsos.len();
    ctx.live_objects = objects;
    ctx.live_dsos = dsos;
}

/// Symbols whose winning definition lives in a shared object are imports;
/// they also pick up the version their definition carries.
fn mark_imported_symbols(ctx: &mut Context) {
    let ids: Vec<_> = ctx.symbol_db.ids().collect();
    for id in ids {
        let Some(owner) = ctx.symbol_db.symbol(id).owner() else {
            continue;
        };
        if let Some(shared) = ctx.files[owner.file.as_usize()].as_shared() {
            let ver = shared.version_index(owner.sym_index);
            let sym = ctx.symbol_db.symbol(id);
            sym.set_ver_idx(ver);
            ctx.symbol_db.symbol_mut(id).is_imported = true;
        }
    }
}

fn trace_symbols(ctx: &Context) {
    if ctx.args.trace_symbols.is_empty() {
        return;
    }
    for id in ctx.symbol_db.ids() {
        let sym = ctx.symbol_db.symbol(id);
        if !sym.traced {
            continue;
        }
        let name = ctx.symbol_db.name(id);
        match sym.owner() {
            Some(owner) => println!(
                "trace-symbol: {name}: definition in {}",
                ctx.file(owner.file).name_for_display()
            ),
            None => println!("trace-symbol: {name}: undefined"),
        }
    }
}

/// Creates .bss storage for tentative (common) definitions that won
/// resolution.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub(crate) fn convert_common_symbols(ctx: &mut Context) -> Result {
    let Context {
        files,
        symbol_db,
        live_objects,
        ..
    } = ctx;
    for &file_id in live_objects.iter() {
        let Some(obj) = files[file_id.as_usize()].as_object_mut() else {
            continue;
        };
        for i in 0..obj.global_ids.len() {
            let gid = obj.global_ids[i];
            let sym_index = obj.first_global + i;
            let Ok(esym) = obj.elf_symbol(sym_index) else {
                continue;
            };
            if !esym.is_common() {
                continue;
            }
            let owner = symbol_db.symbol(gid).owner();
            if owner
                != Some(Owner {
                    file: file_id,
                    sym_index: sym_index as u32,
                })
            {
                continue;
            }
            let size = esym.size();
            let alignment = esym.address();
            obj.allocate_common(sym_index as u32, size, alignment);
        }
    }
    Ok(())
}

/// Reports every strong/strong collision between live files. Weak, common
/// and comdat-eliminated definitions don't count.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub(crate) fn check_duplicate_symbols(ctx: &Context) -> Result {
    ctx.live_objects.par_iter().for_each(|&file_id| {
        let obj = ctx.obj(file_id);
        for (i, &gid) in obj.global_ids.iter().enumerate() {
            let sym_index = obj.first_global + i;
            let Ok(esym) = obj.elf_symbol(sym_index) else {
                continue;
            };
            if esym.is_undefined() || esym.is_weak() || esym.is_common() {
                continue;
            }
            if !obj.is_symbol_section_live(&esym) {
                continue;
            }
            let me = Owner {
                file: file_id,
                sym_index: sym_index as u32,
            };
            let owner = ctx.symbol_db.symbol(gid).owner();
            if owner != Some(me) {
                if let Some(owner) = owner {
                    // Losing to a shared object isn't a collision between
                    // relocatable inputs.
                    if ctx.files[owner.file.as_usize()].as_shared().is_some() {
                        continue;
                    }
                    ctx.diags.error(format!(
                        "duplicate symbol: {}: {}: {}",
                        obj,
                        ctx.file(owner.file).name_for_display(),
                        ctx.symbol_db.name(gid)
                    ));
                }
            }
        }
    });
    ctx.diags.checkpoint()
}

/// Computes the final address of the symbol with the given owner, once
/// layout has assigned section addresses.
pub(crate) fn owned_symbol_address(
    ctx: &Context,
    image: &crate::output_chunks::OutputImage,
    obj: &ObjectFile,
    sym_index: usize,
) -> Result<u64> {
    let esym = obj.elf_symbol(sym_index)?;
    if esym.is_common() {
        if let Some(&slot) = obj.common_slots.get(&(sym_index as u32)) {
            if let Some(sec) = obj.section(slot) {
                return Ok(image.osec_address(sec.osec) + sec.offset());
            }
        }
        return Ok(0);
    }
    let Some(section_index) = esym.section_index() else {
        // Absolute or undefined.
        return Ok(if esym.is_undefined() { 0 } else { esym.address() });
    };
    match obj.sections.get(section_index.0) {
        Some(crate::object_file::SectionSlot::Regular(sec)) => {
            Ok(image.osec_address(sec.osec) + sec.offset() + esym.address())
        }
        Some(crate::object_file::SectionSlot::Merge(m)) => {
            let msec = &obj.mergeable[*m as usize];
            let (piece, delta) = msec.piece_at(esym.address())?;
            Ok(ctx.merged.piece_address(ctx, image, msec.merged_id, piece) + delta)
        }
        // Sections eliminated by comdat dedup resolve to zero.
        _ => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_def_rank_ordering() {
        // Strong beats common beats weak, larger common beats smaller,
        // lower priority breaks remaining ties.
        let strong = DefRank {
            class: CLASS_STRONG,
            common_size: 0,
            priority: 9,
            sym_index: 0,
        };
        let common_big = DefRank {
            class: CLASS_COMMON,
            common_size: 64,
            priority: 2,
            sym_index: 0,
        };
        assert!(strong.class > common_big.class);
        assert!(common_big.common_size > 8);
    }
}
