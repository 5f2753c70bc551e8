//! Parses relocatable object files: section classification, global symbol
//! extraction, comdat group descriptors and mergeable-string splitting.

use crate::context::FileId;
use crate::context::INTERNAL_FILE_ID;
use crate::elf;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::hash::hash_bytes;
use crate::symbol::SymbolName;
use crate::symbol_db::SymbolId;
use ahash::AHashMap;
use anyhow::bail;
use anyhow::Context;
use object::Object;
use object::ObjectComdat;
use object::ObjectSection;
use object::ObjectSymbol;
use smallvec::SmallVec;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;

/// Identifies an input for error messages; an object may be a whole file or
/// an entry in an archive.
pub(crate) struct InputName {
    pub(crate) name: String,
}

impl std::fmt::Display for InputName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

/// A section of an input file, in whatever state the pipeline has got it to.
pub(crate) enum SectionSlot<'data> {
    /// Not copied to the output (symtab, relocation sections etc).
    Discard,

    Regular(InputSection<'data>),

    /// Index into the file's `mergeable` vector.
    Merge(u32),

    /// Comdat group member whose group lost the election.
    Eliminated,
}

pub(crate) struct InputSection<'data> {
    pub(crate) out_name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) size: u64,
    pub(crate) addralign: u64,
    pub(crate) is_nobits: bool,

    /// Index of the output section this section was binned into. u32::MAX
    /// until output sections are assigned.
    pub(crate) osec: u32,

    /// Offset within the output section. Written in parallel during offset
    /// assignment, hence the atomic; nothing reads it until that phase has
    /// completed.
    pub(crate) offset: AtomicU64,
}

impl<'data> InputSection<'data> {
    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A view of one SHF_MERGE|SHF_STRINGS input section, split into
/// null-terminated pieces.
pub(crate) struct MergeableInput<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) addralign: u64,

    /// Cleared when the section's comdat group loses its election.
    pub(crate) live: bool,
    pub(crate) pieces: Vec<InputPiece<'data>>,

    /// Index of the merged output section; set when the string pool is built.
    pub(crate) merged_id: u32,

    /// Ordinal of this section among all sections feeding the same merged
    /// output section, in file-priority order. Used as the owner key for
    /// piece election: lower ordinal wins.
    pub(crate) ordinal: u32,

    /// This section's base offset within the merged output section, and the
    /// total size of the pieces it owns.
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

pub(crate) struct InputPiece<'data> {
    pub(crate) input_offset: u64,
    pub(crate) data: &'data [u8],
    pub(crate) hash: u64,

    /// Index into the merged section's global piece table; set at interning.
    pub(crate) piece: u32,
}

impl<'data> MergeableInput<'data> {
    /// Finds the piece containing `offset` within this input section.
    /// Returns the piece index and the remaining offset into the piece.
    pub(crate) fn piece_at(&self, offset: u64) -> Result<(u32, u64)> {
        let idx = match self
            .pieces
            .binary_search_by_key(&offset, |p| p.input_offset)
        {
            Ok(i) => i,
            Err(0) => bail!("Offset {offset} is before the first string piece"),
            Err(i) => i - 1,
        };
        let piece = &self.pieces[idx];
        let delta = offset - piece.input_offset;
        if delta > piece.data.len() as u64 {
            bail!("Offset {offset} is past the end of a string piece");
        }
        Ok((piece.piece, delta))
    }
}

pub(crate) struct ComdatGroup<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sections: SmallVec<[u32; 4]>,
}

#[derive(Default, Clone, Copy)]
pub(crate) struct SymtabSizes {
    pub(crate) num_locals: u32,
    pub(crate) num_globals: u32,
    pub(crate) strtab_size: u32,
    pub(crate) local_start: u32,
    pub(crate) global_start: u32,
    pub(crate) strtab_start: u32,
}

pub(crate) struct ObjectFile<'data> {
    pub(crate) input: InputName,
    pub(crate) object: Box<elf::File<'data>>,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) is_in_archive: bool,

    /// Index of the first global entry in the file's symbol table.
    pub(crate) first_global: usize,

    /// Names of the file's global symbols, parallel to symbol-table indices
    /// `first_global..`. Taken when the symbol DB is built.
    pub(crate) pending: Vec<SymbolName<'data>>,
    pub(crate) global_ids: Vec<SymbolId>,

    pub(crate) sections: Vec<SectionSlot<'data>>,
    pub(crate) mergeable: Vec<MergeableInput<'data>>,
    pub(crate) comdats: Vec<ComdatGroup<'data>>,

    /// Synthetic .bss slots allocated for common symbols defined by this
    /// file, keyed by symbol-table index.
    pub(crate) common_slots: AHashMap<u32, u32>,

    pub(crate) symtab: SymtabSizes,
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse(
        data: &'data [u8],
        name: String,
        is_in_archive: bool,
    ) -> Result<ObjectFile<'data>> {
        let input = InputName { name };
        let object = Box::new(
            elf::File::parse(data)
                .with_context(|| format!("Failed to parse object file `{input}`"))?,
        );

        let num_sections = object
            .sections()
            .map(|s| s.index().0 + 1)
            .max()
            .unwrap_or(1);
        let mut sections = Vec::with_capacity(num_sections);
        sections.resize_with(num_sections, || SectionSlot::Discard);
        let mut mergeable = Vec::new();

        for section in object.sections() {
            let sh_flags = match section.flags() {
                object::SectionFlags::Elf { sh_flags } => sh_flags,
                _ => 0,
            };
            let sh_type = section_type(&section);
            let name_bytes = section.name_bytes().unwrap_or_default();
            let slot = match sh_type {
                sht::NULL | sht::SYMTAB | sht::STRTAB | sht::RELA | sht::REL | sht::GROUP => {
                    SectionSlot::Discard
                }
                _ if sh_flags & shf::EXCLUDE != 0 => SectionSlot::Discard,
                _ if name_bytes == b".note.GNU-stack" => SectionSlot::Discard,
                _ if sh_flags & shf::MERGE != 0
                    && sh_flags & shf::STRINGS != 0
                    && sh_flags & shf::WRITE == 0 =>
                {
                    let section_data = section.data()?;
                    let pieces = split_string_pieces(section_data).with_context(|| {
                        format!(
                            "String in section `{}` of `{input}` is not null-terminated",
                            String::from_utf8_lossy(name_bytes)
                        )
                    })?;
                    mergeable.push(MergeableInput {
                        name: section.name_bytes()?,
                        sh_type,
                        sh_flags,
                        addralign: section.align().max(1),
                        live: true,
                        pieces,
                        merged_id: u32::MAX,
                        ordinal: u32::MAX,
                        offset: 0,
                        size: 0,
                    });
                    SectionSlot::Merge(mergeable.len() as u32 - 1)
                }
                _ => SectionSlot::Regular(InputSection {
                    out_name: output_section_name(section.name_bytes()?),
                    sh_type,
                    sh_flags: sh_flags & !(shf::GROUP | shf::MERGE | shf::STRINGS),
                    size: section.size(),
                    addralign: section.align().max(1),
                    is_nobits: sh_type == sht::NOBITS,
                    osec: u32::MAX,
                    offset: AtomicU64::new(0),
                }),
            };
            sections[section.index().0] = slot;
        }

        let mut comdats = Vec::new();
        for comdat in object.comdats() {
            let mut group_sections = SmallVec::new();
            for section_index in comdat.sections() {
                group_sections.push(section_index.0 as u32);
            }
            comdats.push(ComdatGroup {
                name: comdat.name_bytes()?,
                sections: group_sections,
            });
        }

        let mut first_global = 0;
        let mut pending = Vec::new();
        for symbol in object.symbols() {
            if symbol.is_local() {
                first_global = symbol.index().0 + 1;
                continue;
            }
            pending.push(SymbolName::new(symbol.name_bytes()?));
        }

        Ok(ObjectFile {
            input,
            object,
            file_id: INTERNAL_FILE_ID,
            priority: 0,
            is_alive: AtomicBool::new(!is_in_archive),
            is_in_archive,
            first_global,
            pending,
            global_ids: Vec::new(),
            sections,
            mergeable,
            comdats,
            common_slots: AHashMap::new(),
            symtab: SymtabSizes::default(),
        })
    }

    pub(crate) fn elf_symbol(&self, sym_index: usize) -> Result<elf::Symbol<'data, '_>> {
        Ok(self.object.symbol_by_index(object::SymbolIndex(sym_index))?)
    }

    /// The symbol-db ID for symbol-table index `sym_index`, which must be a
    /// global.
    pub(crate) fn global_id(&self, sym_index: usize) -> Option<SymbolId> {
        sym_index
            .checked_sub(self.first_global)
            .and_then(|i| self.global_ids.get(i))
            .copied()
    }

    /// Appends a synthetic NOBITS slot for a common symbol and records which
    /// symbol it belongs to. The symbol's alignment is carried in st_value,
    /// per the ELF spec for SHN_COMMON.
    pub(crate) fn allocate_common(&mut self, sym_index: u32, size: u64, alignment: u64) -> u32 {
        let slot = self.sections.len() as u32;
        self.sections.push(SectionSlot::Regular(InputSection {
            out_name: b".bss",
            sh_type: sht::NOBITS,
            sh_flags: shf::ALLOC | shf::WRITE,
            size,
            addralign: alignment.max(1),
            is_nobits: true,
            osec: u32::MAX,
            offset: AtomicU64::new(0),
        }));
        self.common_slots.insert(sym_index, slot);
        slot
    }

    pub(crate) fn section(&self, slot: u32) -> Option<&InputSection<'data>> {
        match &self.sections[slot as usize] {
            SectionSlot::Regular(sec) => Some(sec),
            _ => None,
        }
    }

    /// Whether the section a defined symbol points at survived comdat
    /// elimination and section discarding.
    pub(crate) fn is_symbol_section_live(&self, symbol: &elf::Symbol) -> bool {
        match symbol.section_index() {
            Some(index) => matches!(
                self.sections.get(index.0),
                Some(SectionSlot::Regular(_) | SectionSlot::Merge(_))
            ),
            // Absolute and common symbols don't depend on a section.
            None => true,
        }
    }
}

impl<'data> std::fmt::Display for ObjectFile<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.input.fmt(f)
    }
}

fn section_type(section: &elf::Section) -> u32 {
    match section.kind() {
        object::SectionKind::UninitializedData
        | object::SectionKind::UninitializedTls
        | object::SectionKind::Common => sht::NOBITS,
        object::SectionKind::Note => sht::NOTE,
        object::SectionKind::Elf(sh_type) => sh_type,
        object::SectionKind::Metadata => sht::NULL,
        _ => sht::PROGBITS,
    }
}

fn split_string_pieces(mut data: &[u8]) -> Result<Vec<InputPiece>> {
    let mut pieces = Vec::new();
    let mut input_offset = 0;
    while !data.is_empty() {
        let Some(len) = memchr::memchr(0, data).map(|i| i + 1) else {
            bail!("Missing null terminator");
        };
        let (bytes, rest) = data.split_at(len);
        pieces.push(InputPiece {
            input_offset,
            data: bytes,
            hash: hash_bytes(bytes),
            piece: u32::MAX,
        });
        input_offset += len as u64;
        data = rest;
    }
    Ok(pieces)
}

/// Maps an input section name to the output section it aggregates into:
/// `.text.foo` goes to `.text` and so on. Names outside the well-known list
/// pass through unchanged.
pub(crate) fn output_section_name(name: &[u8]) -> &[u8] {
    const PREFIXES: &[&[u8]] = &[
        b".text",
        b".data.rel.ro",
        b".data",
        b".rodata",
        b".bss.rel.ro",
        b".bss",
        b".init_array",
        b".fini_array",
        b".tbss",
        b".tdata",
        b".gcc_except_table",
    ];
    for prefix in PREFIXES {
        if name == *prefix {
            return prefix;
        }
        if name.len() > prefix.len() && name.starts_with(prefix) && name[prefix.len()] == b'.' {
            return prefix;
        }
    }
    match name {
        b".ctors" | b".ctors.65535" => b".init_array",
        b".dtors" | b".dtors.65535" => b".fini_array",
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_section_name() {
        assert_eq!(output_section_name(b".text"), b".text");
        assert_eq!(output_section_name(b".text.main"), b".text");
        assert_eq!(output_section_name(b".textual"), b".textual");
        assert_eq!(output_section_name(b".data.rel.ro.foo"), b".data.rel.ro");
        assert_eq!(output_section_name(b".rodata.str1.1"), b".rodata");
        assert_eq!(output_section_name(b"my_custom"), b"my_custom");
    }

    #[test]
    fn test_split_string_pieces() {
        let pieces = split_string_pieces(b"hello\0world\0").unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].data, b"hello\0");
        assert_eq!(pieces[1].data, b"world\0");
        assert_eq!(pieces[1].input_offset, 6);
        assert!(split_string_pieces(b"unterminated").is_err());
    }
}
