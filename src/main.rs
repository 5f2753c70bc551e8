mod alignment;
mod archive;
mod args;
mod comdat;
mod context;
mod dynamic;
mod elf;
mod error;
mod file_kind;
mod hash;
mod input_data;
mod layout;
mod merge_strings;
mod object_file;
mod output_chunks;
mod output_file;
mod resolution;
mod scan_rels;
mod shared_file;
mod stats;
mod subprocess;
mod symbol;
mod symbol_db;
mod timing;

use crate::error::Result;
use rayon::prelude::*;

fn main() {
    let args = match args::Args::from_env() {
        Ok(args) => args,
        Err(error) => {
            eprintln!("weld: error: {error:#}");
            std::process::exit(1);
        }
    };
    timing::init_tracing();

    if args.should_fork {
        // Safety: no threads have been spawned yet.
        unsafe { subprocess::run_in_subprocess(&args) };
    }

    match link(&args, None) {
        Ok(()) => {}
        Err(error) => {
            eprintln!("weld: error: {error:#}");
            output_file::cleanup();
            std::process::exit(1);
        }
    }
}

/// The link pipeline. Phase order matters: each phase reads what the
/// previous ones established, and the barriers between them are the only
/// synchronisation most of the parallel work needs. `on_complete` fires once
/// the output file is committed, letting a forked parent exit early.
pub(crate) fn link(args: &args::Args, on_complete: Option<Box<dyn FnOnce()>>) -> Result {
    output_file::install_signal_handlers();
    args.setup_thread_pool()?;
    let mut timing = timing::Timing::new(args.perf);

    let mut cache = input_data::PreloadCache::default();
    if args.preload {
        input_data::InputData::preload(args, &mut cache)?;
        timing.complete("preload");
    }
    let input_data = input_data::InputData::from_args(args, &mut cache)?;
    timing.complete("read_input_files");

    let mut ctx = context::Context::build(args, &input_data)?;
    timing.complete("parse");

    resolution::resolve_symbols(&mut ctx)?;
    timing.complete("resolve_symbols");

    comdat::eliminate_comdats(&mut ctx)?;
    timing.complete("comdat");

    merge_strings::merge_strings(&mut ctx)?;
    timing.complete("resolve_strings");

    resolution::convert_common_symbols(&mut ctx)?;
    timing.complete("common");

    let mut osecs = layout::assign_output_sections(&mut ctx);
    layout::bin_sections(&ctx, &mut osecs);
    timing.complete("bin_sections");

    layout::set_isec_offsets(&ctx, &mut osecs);
    timing.complete("isec_offsets");

    let mut image = output_chunks::OutputImage::new(&ctx, osecs);
    layout::setup_internal_symbols(&mut ctx, &image)?;

    resolution::check_duplicate_symbols(&ctx)?;
    timing.complete("check_dup_syms");

    scan_rels::scan_relocations(&mut ctx, &mut image)?;
    timing.complete("scan_rels");

    dynamic::export_dynamic(&mut ctx, &mut image)?;
    dynamic::finalize_dynsym(&mut ctx, &mut image);
    dynamic::fill_symbol_versions(&mut ctx, &mut image)?;
    timing.complete("fill_symbol_versions");

    layout::compute_symtab(&mut ctx, &mut image)?;
    timing.complete("compute_symtab");

    image.update_shdrs(&ctx);
    image.drop_empty_chunks();
    let num_locals = image.num_locals;
    image.finalize_order(num_locals);
    image.update_shdrs(&ctx);

    let file_size = layout::set_osec_offsets(&ctx, &mut image);
    layout::fix_synthetic_symbols(&mut ctx, &image);
    ctx.stats.output_chunks = image.chunks.len();
    timing.complete("osec_offsets");

    let mut output = output_file::OutputFile::open(&args.output, file_size)?;
    timing.complete("open_file");

    let buf = output.buffer_mut();
    if let Some(filler) = args.filler {
        buf.fill(filler);
    }
    copy_chunks(&ctx, &image, buf);
    ctx.diags.checkpoint()?;
    timing.complete("copy_buf");

    output_file::clear_padding(&image, buf, file_size as usize);
    timing.complete("clear_padding");

    output.commit()?;
    timing.complete("commit");

    if args.print_map {
        layout::print_map(&image);
    }
    if args.stat {
        ctx.stats.print();
    }
    if let Some(callback) = on_complete {
        callback();
    }
    // Dropping the parsed inputs and the symbol table can take a while for
    // big links; with fork enabled the parent has already returned to its
    // caller by now.
    drop(ctx);
    Ok(())
}

/// Splits the output buffer into one slice per chunk (ordered by file
/// offset, which layout guarantees is non-decreasing) and copies all chunks
/// in parallel. Each chunk writes only its own slice.
fn copy_chunks(ctx: &context::Context, image: &output_chunks::OutputImage, buf: &mut [u8]) {
    let mut work: Vec<(usize, &mut [u8])> = Vec::with_capacity(image.chunks.len());
    let mut rest: &mut [u8] = buf;
    let mut consumed = 0u64;
    for (i, chunk) in image.chunks.iter().enumerate() {
        let size = if chunk.shdr.ty == elf::sht::NOBITS {
            0
        } else {
            chunk.shdr.size as usize
        };
        let gap = (chunk.shdr.offset - consumed) as usize;
        // Walk the buffer front to back: split off everything up to the end
        // of this chunk, then shave the padding off its front.
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(gap + size);
        let (_padding, chunk_out) = head.split_at_mut(gap);
        work.push((i, chunk_out));
        rest = tail;
        consumed = chunk.shdr.offset + size as u64;
    }
    work.into_par_iter().for_each(|(i, out)| {
        if let Err(error) = image.copy_buf(ctx, i, out) {
            ctx.diags.error(format!("Failed to write output section: {error:#}"));
        }
    });
}
