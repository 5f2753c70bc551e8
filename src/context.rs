//! The per-link context. The original design kept the file lists, the symbol
//! intern table and the output chunks in process-wide state; here they all
//! live in a `Context` value threaded through every phase so that tests can
//! run independent links in one process.

use crate::args::Args;
use crate::error::Diagnostics;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::layout::SyntheticDef;
use crate::merge_strings::MergedPool;
use crate::object_file::ObjectFile;
use crate::object_file::SymtabSizes;
use crate::shared_file::SharedFile;
use crate::stats::Stats;
use crate::symbol::SymbolName;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use ahash::AHashSet;
use anyhow::Context as _;
use rayon::prelude::*;
use std::sync::atomic::Ordering;

/// Identifies an input file. ID 0 is reserved for the internal file that
/// holds linker-synthesized symbols.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct FileId(u32);

pub(crate) const INTERNAL_FILE_ID: FileId = FileId(0);

impl FileId {
    pub(crate) const fn new(value: u32) -> FileId {
        FileId(value)
    }

    pub(crate) fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) enum InputFile<'data> {
    Internal(InternalFile),
    Object(Box<ObjectFile<'data>>),
    Shared(Box<SharedFile<'data>>),
}

/// A dummy file containing linker-synthesized symbols (e.g. `__bss_start`).
pub(crate) struct InternalFile {
    pub(crate) defined: Vec<SymbolId>,
    pub(crate) definitions: Vec<SyntheticDef>,
    pub(crate) symtab: SymtabSizes,
}

impl<'data> InputFile<'data> {
    pub(crate) fn priority(&self) -> u32 {
        match self {
            InputFile::Internal(_) => 1,
            InputFile::Object(o) => o.priority,
            InputFile::Shared(s) => s.priority,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            InputFile::Internal(_) => true,
            InputFile::Object(o) => o.is_alive.load(Ordering::Acquire),
            InputFile::Shared(s) => s.is_alive.load(Ordering::Acquire),
        }
    }

    /// Marks the file live. Returns whether it was previously dead.
    pub(crate) fn mark_alive(&self) -> bool {
        match self {
            InputFile::Internal(_) => false,
            InputFile::Object(o) => !o.is_alive.swap(true, Ordering::AcqRel),
            InputFile::Shared(s) => !s.is_alive.swap(true, Ordering::AcqRel),
        }
    }

    pub(crate) fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            InputFile::Object(o) => Some(o),
            _ => None,
        }
    }

    pub(crate) fn as_object_mut(&mut self) -> Option<&mut ObjectFile<'data>> {
        match self {
            InputFile::Object(o) => Some(o),
            _ => None,
        }
    }

    pub(crate) fn as_shared(&self) -> Option<&SharedFile<'data>> {
        match self {
            InputFile::Shared(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn name_for_display(&self) -> String {
        match self {
            InputFile::Internal(_) => "<internal>".to_owned(),
            InputFile::Object(o) => o.input.to_string(),
            InputFile::Shared(s) => s.input.to_string(),
        }
    }
}

pub(crate) struct Context<'data> {
    pub(crate) args: &'data Args,
    pub(crate) files: Vec<InputFile<'data>>,
    pub(crate) symbol_db: SymbolDb<'data>,
    pub(crate) merged: MergedPool<'data>,

    /// Live files in priority order, set once resolution reaches its
    /// fixpoint.
    pub(crate) live_objects: Vec<FileId>,
    pub(crate) live_dsos: Vec<FileId>,

    pub(crate) diags: Diagnostics,
    pub(crate) stats: Stats,
}

impl<'data> Context<'data> {
    #[tracing::instrument(skip_all, name = "Parse input files")]
    pub(crate) fn build(args: &'data Args, input_data: &'data InputData) -> Result<Context<'data>> {
        let parsed = input_data
            .units
            .par_iter()
            .map(|unit| {
                let data = input_data.unit_data(unit);
                let name = input_data.unit_name(unit);
                match unit.kind {
                    FileKind::ElfObject => ObjectFile::parse(data, name, unit.is_in_archive)
                        .map(|o| InputFile::Object(Box::new(o))),
                    FileKind::ElfDynamic => SharedFile::parse(data, name, unit.as_needed)
                        .map(|s| InputFile::Shared(Box::new(s))),
                    _ => unreachable!("Non-object parse unit"),
                }
            })
            .collect::<Result<Vec<InputFile>>>()?;

        let mut files = Vec::with_capacity(parsed.len() + 1);
        files.push(InputFile::Internal(InternalFile {
            defined: Vec::new(),
            definitions: Vec::new(),
            symtab: SymtabSizes::default(),
        }));

        // Uniquify shared object files by soname, keeping the first.
        let mut seen_sonames = AHashSet::new();
        for file in parsed {
            if let InputFile::Shared(s) = &file {
                if !seen_sonames.insert(s.soname.clone()) {
                    continue;
                }
            }
            files.push(file);
        }

        let mut ctx = Context {
            args,
            files,
            symbol_db: SymbolDb::new(),
            merged: MergedPool::default(),
            live_objects: Vec::new(),
            live_dsos: Vec::new(),
            diags: Diagnostics::new(),
            stats: Stats::default(),
        };
        let order = ctx.assign_priorities();
        ctx.build_symbol_db(&order)?;
        ctx.mark_traced_symbols()?;
        Ok(ctx)
    }

    /// Priority 1 is reserved for the internal file, then non-archive objects
    /// in command-line order, then archive members in enumeration order, then
    /// shared objects in command-line order. Lower wins ties during
    /// resolution.
    fn assign_priorities(&mut self) -> Vec<FileId> {
        let mut order = vec![INTERNAL_FILE_ID];
        let mut priority = 2;
        for pass in 0..3 {
            for i in 1..self.files.len() {
                let file_id = FileId::new(i as u32);
                match &mut self.files[i] {
                    InputFile::Object(o) if pass == 0 && !o.is_in_archive => {
                        o.priority = priority;
                        o.file_id = file_id;
                    }
                    InputFile::Object(o) if pass == 1 && o.is_in_archive => {
                        o.priority = priority;
                        o.file_id = file_id;
                    }
                    InputFile::Shared(s) if pass == 2 => {
                        s.priority = priority;
                        s.file_id = file_id;
                    }
                    _ => continue,
                }
                priority += 1;
                order.push(file_id);
            }
        }
        order
    }

    fn build_symbol_db(&mut self, order: &[FileId]) -> Result {
        for &file_id in order {
            let pending = match &mut self.files[file_id.as_usize()] {
                InputFile::Internal(_) => continue,
                InputFile::Object(o) => std::mem::take(&mut o.pending),
                InputFile::Shared(s) => std::mem::take(&mut s.pending),
            };
            let mut global_ids = Vec::with_capacity(pending.len());
            for name in pending {
                global_ids.push(self.symbol_db.intern(name)?);
            }
            match &mut self.files[file_id.as_usize()] {
                InputFile::Internal(_) => unreachable!(),
                InputFile::Object(o) => o.global_ids = global_ids,
                InputFile::Shared(s) => s.global_ids = global_ids,
            }
        }
        Ok(())
    }

    fn mark_traced_symbols(&mut self) -> Result {
        for name in &self.args.trace_symbols {
            let id = self
                .symbol_db
                .intern(SymbolName::new(name.as_bytes()))
                .context("Failed to intern traced symbol")?;
            self.symbol_db.symbol_mut(id).traced = true;
        }
        Ok(())
    }

    pub(crate) fn file(&self, id: FileId) -> &InputFile<'data> {
        &self.files[id.as_usize()]
    }

    pub(crate) fn obj(&self, id: FileId) -> &ObjectFile<'data> {
        self.files[id.as_usize()]
            .as_object()
            .expect("Expected an object file")
    }

    pub(crate) fn shared(&self, id: FileId) -> &SharedFile<'data> {
        self.files[id.as_usize()]
            .as_shared()
            .expect("Expected a shared object")
    }

    pub(crate) fn internal(&self) -> &InternalFile {
        match &self.files[INTERNAL_FILE_ID.as_usize()] {
            InputFile::Internal(i) => i,
            _ => unreachable!(),
        }
    }

    pub(crate) fn internal_mut(&mut self) -> &mut InternalFile {
        match &mut self.files[INTERNAL_FILE_ID.as_usize()] {
            InputFile::Internal(i) => i,
            _ => unreachable!(),
        }
    }

    pub(crate) fn priority(&self, id: FileId) -> u32 {
        self.files[id.as_usize()].priority()
    }
}
