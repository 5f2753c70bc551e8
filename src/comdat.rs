//! Comdat group deduplication. Each group signature may survive in at most
//! one live object file; the winner is the file with the lowest priority.

use crate::context::Context;
use crate::context::InputFile;
use crate::error::Result;
use crate::object_file::SectionSlot;
use ahash::AHashMap;
use rayon::prelude::*;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Eliminate comdats")]
pub(crate) fn eliminate_comdats(ctx: &mut Context) -> Result {
    // Intern group signatures across live files.
    let mut group_ids: AHashMap<&[u8], u32> = AHashMap::new();
    for &file_id in &ctx.live_objects {
        for group in &ctx.obj(file_id).comdats {
            let next = group_ids.len() as u32;
            group_ids.entry(group.name).or_insert(next);
        }
    }

    // Elect a winner per group key by minimum priority.
    let winners: Vec<AtomicU32> = (0..group_ids.len())
        .map(|_| AtomicU32::new(u32::MAX))
        .collect();
    ctx.live_objects.par_iter().for_each(|&file_id| {
        let obj = ctx.obj(file_id);
        for group in &obj.comdats {
            let id = group_ids[group.name];
            winners[id as usize].fetch_min(obj.priority, Ordering::Relaxed);
        }
    });

    // Drop every section belonging to a losing group.
    ctx.files.par_iter_mut().for_each(|file| {
        let InputFile::Object(obj) = file else {
            return;
        };
        if !obj.is_alive.load(Ordering::Acquire) {
            return;
        }
        for group_index in 0..obj.comdats.len() {
            let id = group_ids[obj.comdats[group_index].name];
            if winners[id as usize].load(Ordering::Relaxed) == obj.priority {
                continue;
            }
            let sections: Vec<u32> = obj.comdats[group_index].sections.to_vec();
            for section_index in sections {
                let slot = &mut obj.sections[section_index as usize];
                match slot {
                    SectionSlot::Regular(_) => *slot = SectionSlot::Eliminated,
                    SectionSlot::Merge(m) => {
                        let m = *m as usize;
                        *slot = SectionSlot::Eliminated;
                        obj.mergeable[m].live = false;
                    }
                    _ => {}
                }
            }
        }
    });
    Ok(())
}
