//! Merges identical strings from all live objects where those strings are in
//! sections marked with both SHF_MERGE and SHF_STRINGS.
//!
//! Pieces with identical content are interned into one table per merged
//! output section. Ownership of each piece is then elected in parallel with
//! an atomic minimum over section ordinals (which follow file priority), the
//! owners assign output offsets to their pieces in parallel, and finally the
//! per-input-section base offsets accumulate serially so the result is
//! deterministic.

use crate::context::Context;
use crate::context::FileId;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::output_chunks::OutputImage;
use rayon::prelude::*;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[derive(Default)]
pub(crate) struct MergedPool<'data> {
    pub(crate) sections: Vec<MergedSection<'data>>,
}

pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) addralign: u64,

    /// Total size, once the input sections have accumulated.
    pub(crate) size: u64,

    pub(crate) pieces: Vec<Piece<'data>>,
    piece_ids: PassThroughHashMap<PieceKey<'data>, u32>,

    /// Ordinal -> (file, index into that file's `mergeable`), in priority
    /// order. A piece's owner is the lowest ordinal that contains it.
    pub(crate) owners: Vec<(FileId, u32)>,
}

pub(crate) struct Piece<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) owner: AtomicU32,
    pub(crate) output_offset: AtomicI64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct PieceKey<'data> {
    hash: u64,
    bytes: &'data [u8],
}

impl<'data> Hash for PieceKey<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl<'data> MergedPool<'data> {
    pub(crate) fn piece_address(
        &self,
        ctx: &Context,
        image: &OutputImage,
        merged_id: u32,
        piece: u32,
    ) -> u64 {
        let section = &self.sections[merged_id as usize];
        let p = &section.pieces[piece as usize];
        let ordinal = p.owner.load(Ordering::Relaxed);
        let (file_id, msec_index) = section.owners[ordinal as usize];
        let msec = &ctx.obj(file_id).mergeable[msec_index as usize];
        let offset = p.output_offset.load(Ordering::Relaxed).max(0) as u64;
        image.merged_address(merged_id) + msec.offset + offset
    }
}

#[tracing::instrument(skip_all, name = "Merge strings")]
pub(crate) fn merge_strings(ctx: &mut Context) -> Result {
    let mut pool = MergedPool::default();
    intern_pieces(ctx, &mut pool);
    elect_owners(ctx, &pool);
    assign_piece_offsets(ctx, &pool);
    accumulate_section_sizes(ctx, &mut pool);
    ctx.stats.merged_pieces = pool.sections.iter().map(|s| s.pieces.len()).sum();
    ctx.merged = pool;
    Ok(())
}

/// Serial pass in priority order: build the merged-section registry, assign
/// ordinals and intern piece contents.
fn intern_pieces<'data>(ctx: &mut Context<'data>, pool: &mut MergedPool<'data>) {
    let Context {
        files,
        live_objects,
        ..
    } = ctx;
    let mut registry: ahash::AHashMap<(&[u8], u32, u64), u32> = ahash::AHashMap::new();
    for &file_id in live_objects.iter() {
        let Some(obj) = files[file_id.as_usize()].as_object_mut() else {
            continue;
        };
        for msec_index in 0..obj.mergeable.len() {
            let msec = &mut obj.mergeable[msec_index];
            if !msec.live {
                continue;
            }
            let key = (msec.name, msec.sh_type, msec.sh_flags);
            let merged_id = *registry.entry(key).or_insert_with(|| {
                pool.sections.push(MergedSection {
                    name: msec.name,
                    sh_type: msec.sh_type,
                    sh_flags: msec.sh_flags,
                    addralign: 1,
                    size: 0,
                    pieces: Vec::new(),
                    piece_ids: Default::default(),
                    owners: Vec::new(),
                });
                pool.sections.len() as u32 - 1
            });
            let section = &mut pool.sections[merged_id as usize];
            section.addralign = section.addralign.max(msec.addralign);
            msec.merged_id = merged_id;
            msec.ordinal = section.owners.len() as u32;
            section.owners.push((file_id, msec_index as u32));
            for piece in &mut msec.pieces {
                let key = PieceKey {
                    hash: piece.hash,
                    bytes: piece.data,
                };
                let next = section.pieces.len() as u32;
                let id = *section.piece_ids.entry(key).or_insert(next);
                if id == next {
                    section.pieces.push(Piece {
                        data: piece.data,
                        owner: AtomicU32::new(u32::MAX),
                        output_offset: AtomicI64::new(-1),
                    });
                }
                piece.piece = id;
            }
        }
    }
}

/// Parallel pass: each input section tries to claim each of its pieces; the
/// lowest ordinal (lowest file priority) wins.
fn elect_owners(ctx: &Context, pool: &MergedPool) {
    ctx.live_objects.par_iter().for_each(|&file_id| {
        let obj = ctx.obj(file_id);
        for msec in &obj.mergeable {
            if !msec.live {
                continue;
            }
            let section = &pool.sections[msec.merged_id as usize];
            for piece in &msec.pieces {
                section.pieces[piece.piece as usize]
                    .owner
                    .fetch_min(msec.ordinal, Ordering::Relaxed);
            }
        }
    });
}

/// Parallel pass: sections that won a piece give it a monotonically
/// increasing offset within themselves and record their total size.
fn assign_piece_offsets(ctx: &mut Context, pool: &MergedPool) {
    ctx.files.par_iter_mut().for_each(|file| {
        let Some(obj) = file.as_object_mut() else {
            return;
        };
        if !obj.is_alive.load(Ordering::Acquire) {
            return;
        }
        for msec in &mut obj.mergeable {
            if !msec.live {
                continue;
            }
            let section = &pool.sections[msec.merged_id as usize];
            let mut offset = 0u64;
            for piece_ref in &msec.pieces {
                let piece = &section.pieces[piece_ref.piece as usize];
                if piece.owner.load(Ordering::Relaxed) != msec.ordinal {
                    continue;
                }
                if piece.output_offset.load(Ordering::Relaxed) != -1 {
                    continue;
                }
                piece.output_offset.store(offset as i64, Ordering::Relaxed);
                offset += piece.data.len() as u64;
            }
            msec.size = offset;
        }
    });
}

/// Serial pass in priority order: stack each input section's owned bytes into
/// its merged output section.
fn accumulate_section_sizes<'data>(ctx: &mut Context<'data>, pool: &mut MergedPool<'data>) {
    let Context {
        files,
        live_objects,
        ..
    } = ctx;
    for &file_id in live_objects.iter() {
        let Some(obj) = files[file_id.as_usize()].as_object_mut() else {
            continue;
        };
        for msec in &mut obj.mergeable {
            if !msec.live {
                continue;
            }
            let section = &mut pool.sections[msec.merged_id as usize];
            msec.offset = section.size;
            section.size += msec.size;
        }
    }
}
