//! Figures out what input files we need to read, maps them into memory and
//! expands archives and linker scripts into a flat, ordered list of parse
//! units. The order of that list is what file priorities are later assigned
//! from, so everything here is deliberately single threaded.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::args::Input;
use crate::args::InputSpec;
use crate::error::Result;
use crate::file_kind::FileKind;
use ahash::AHashMap;
use anyhow::bail;
use anyhow::Context;
use memmap2::Mmap;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

pub(crate) struct InputData {
    pub(crate) files: Vec<MappedFile>,
    pub(crate) units: Vec<ParseUnit>,
}

pub(crate) struct MappedFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    pub(crate) size: u64,
    pub(crate) mtime: SystemTime,
    data: Option<Mmap>,
}

/// One relocatable object or shared object to be parsed: either a whole
/// mapped file or a byte range of an archive member.
pub(crate) struct ParseUnit {
    pub(crate) file_idx: usize,
    pub(crate) range: Range<usize>,
    pub(crate) member_name: Option<String>,
    pub(crate) kind: FileKind,
    pub(crate) is_in_archive: bool,
    pub(crate) as_needed: bool,
}

/// Caches the expensive part of reading an input (archive member
/// enumeration) between a preload pass and the real link. Keyed by
/// `(path, size, mtime)`; no content hash, so a filesystem with coarse mtime
/// resolution can in principle yield a stale hit. Lookups consume the entry.
#[derive(Default)]
pub(crate) struct PreloadCache {
    entries: AHashMap<CacheKey, Vec<CachedMember>>,
}

type CacheKey = (PathBuf, u64, SystemTime);

#[derive(Clone)]
struct CachedMember {
    range: Range<usize>,
    name: String,
}

impl PreloadCache {
    fn key(file: &MappedFile) -> CacheKey {
        (file.filename.clone(), file.size, file.mtime)
    }

    fn insert(&mut self, file: &MappedFile, members: Vec<CachedMember>) {
        self.entries.insert(Self::key(file), members);
    }

    fn take(&mut self, file: &MappedFile) -> Option<Vec<CachedMember>> {
        self.entries.remove(&Self::key(file))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl MappedFile {
    pub(crate) fn open(path: &Path) -> Result<MappedFile> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;
        let metadata = file.metadata()?;
        let size = metadata.len();
        let mtime = metadata.modified()?;
        let data = if size == 0 {
            None
        } else {
            Some(
                unsafe { Mmap::map(&file) }
                    .with_context(|| format!("Failed to mmap `{}`", path.display()))?,
            )
        };
        let kind = FileKind::identify_bytes(data.as_deref().unwrap_or_default())
            .with_context(|| format!("Failed to identify `{}`", path.display()))?;
        Ok(MappedFile {
            filename: path.to_owned(),
            kind,
            size,
            mtime,
            data,
        })
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

impl InputData {
    pub(crate) fn from_args(args: &Args, cache: &mut PreloadCache) -> Result<InputData> {
        let mut input_data = InputData {
            files: Vec::new(),
            units: Vec::new(),
        };
        for input in &args.inputs {
            input_data.load_input(args, input, cache, 0)?;
        }
        Ok(input_data)
    }

    /// Warms `cache` with the archive enumerations for all inputs. The real
    /// link consumes the cache, skipping that work when the keys still match.
    pub(crate) fn preload(args: &Args, cache: &mut PreloadCache) -> Result {
        // Reuse the normal loading path; the populated cache is what we keep.
        InputData::from_args(args, cache).map(|input_data| {
            for file in &input_data.files {
                if matches!(file.kind, FileKind::Archive) {
                    let members = enumerate_archive(file).unwrap_or_default();
                    cache.insert(file, members);
                }
            }
        })
    }

    pub(crate) fn unit_data(&self, unit: &ParseUnit) -> &[u8] {
        &self.files[unit.file_idx].data()[unit.range.clone()]
    }

    pub(crate) fn unit_name(&self, unit: &ParseUnit) -> String {
        let filename = self.files[unit.file_idx].filename.display();
        match &unit.member_name {
            Some(member) => format!("{filename}({member})"),
            None => format!("{filename}"),
        }
    }

    fn load_input(
        &mut self,
        args: &Args,
        input: &Input,
        cache: &mut PreloadCache,
        depth: usize,
    ) -> Result {
        let path = match &input.spec {
            InputSpec::File(path) => path.clone(),
            InputSpec::Lib(name) => args.find_library(name)?,
        };
        self.load_path(args, &path, input.as_needed, cache, depth)
    }

    fn load_path(
        &mut self,
        args: &Args,
        path: &Path,
        as_needed: bool,
        cache: &mut PreloadCache,
        depth: usize,
    ) -> Result {
        if depth > 10 {
            bail!("Linker scripts nested too deeply at `{}`", path.display());
        }
        let mapped = MappedFile::open(path)?;
        match mapped.kind {
            FileKind::ElfObject => {
                let range = 0..mapped.data().len();
                let file_idx = self.push_file(mapped);
                self.units.push(ParseUnit {
                    file_idx,
                    range,
                    member_name: None,
                    kind: FileKind::ElfObject,
                    is_in_archive: false,
                    as_needed,
                });
            }
            FileKind::ElfDynamic => {
                if args.is_static {
                    bail!(
                        "Attempted to link against a shared object with -static: `{}`",
                        path.display()
                    );
                }
                let range = 0..mapped.data().len();
                let file_idx = self.push_file(mapped);
                self.units.push(ParseUnit {
                    file_idx,
                    range,
                    member_name: None,
                    kind: FileKind::ElfDynamic,
                    is_in_archive: false,
                    as_needed,
                });
            }
            FileKind::Archive => {
                let members = match cache.take(&mapped) {
                    Some(members) => members,
                    None => enumerate_archive(&mapped)
                        .with_context(|| format!("Failed to read `{}`", path.display()))?,
                };
                let file_idx = self.push_file(mapped);
                for member in members {
                    let data = &self.files[file_idx].data()[member.range.clone()];
                    let kind = FileKind::identify_bytes(data).with_context(|| {
                        format!("Failed to identify `{}({})`", path.display(), member.name)
                    })?;
                    if kind != FileKind::ElfObject {
                        bail!(
                            "Archive member `{}({})` is not a relocatable object",
                            path.display(),
                            member.name
                        );
                    }
                    self.units.push(ParseUnit {
                        file_idx,
                        range: member.range,
                        member_name: Some(member.name),
                        kind,
                        is_in_archive: true,
                        as_needed,
                    });
                }
            }
            FileKind::ThinArchive => {
                let dir = path.parent().unwrap_or(Path::new("."));
                let member_paths = enumerate_thin_archive(&mapped)
                    .with_context(|| format!("Failed to read `{}`", path.display()))?;
                for member_path in member_paths {
                    let resolved = dir.join(&member_path);
                    let member = MappedFile::open(&resolved)?;
                    if member.kind != FileKind::ElfObject {
                        bail!(
                            "Thin archive member `{}` is not a relocatable object",
                            resolved.display()
                        );
                    }
                    let range = 0..member.data().len();
                    let file_idx = self.push_file(member);
                    self.units.push(ParseUnit {
                        file_idx,
                        range,
                        member_name: None,
                        kind: FileKind::ElfObject,
                        is_in_archive: true,
                        as_needed,
                    });
                }
            }
            FileKind::Text => {
                let inputs = parse_linker_script(mapped.data(), as_needed).with_context(|| {
                    format!("Failed to parse linker script `{}`", path.display())
                })?;
                let script_dir = path.parent().map(Path::to_owned);
                for entry in inputs {
                    match entry.spec {
                        InputSpec::File(ref file) => {
                            let resolved =
                                resolve_script_path(args, file, script_dir.as_deref())?;
                            self.load_path(args, &resolved, entry.as_needed, cache, depth + 1)?;
                        }
                        InputSpec::Lib(_) => {
                            self.load_input(args, &entry, cache, depth + 1)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn push_file(&mut self, file: MappedFile) -> usize {
        self.files.push(file);
        self.files.len() - 1
    }
}

fn enumerate_archive(file: &MappedFile) -> Result<Vec<CachedMember>> {
    let data = file.data();
    let base = data.as_ptr() as usize;
    let mut extended_filenames = None;
    let mut members = Vec::new();
    for entry in ArchiveIterator::from_archive_bytes(data)? {
        match entry? {
            ArchiveEntry::Symbols(_) => {}
            ArchiveEntry::Filenames(f) => extended_filenames = Some(f),
            ArchiveEntry::Regular(content) => {
                let start = content.entry_data.as_ptr() as usize - base;
                let name = String::from_utf8_lossy(
                    content.identifier(extended_filenames).as_slice(),
                )
                .into_owned();
                members.push(CachedMember {
                    range: start..start + content.entry_data.len(),
                    name,
                });
            }
        }
    }
    Ok(members)
}

fn enumerate_thin_archive(file: &MappedFile) -> Result<Vec<PathBuf>> {
    let mut extended_filenames = None;
    let mut paths = Vec::new();
    for entry in ArchiveIterator::from_archive_bytes(file.data())? {
        match entry? {
            ArchiveEntry::Symbols(_) => {}
            ArchiveEntry::Filenames(f) => extended_filenames = Some(f),
            ArchiveEntry::Regular(content) => {
                let ident = content.identifier(extended_filenames).as_slice();
                paths.push(PathBuf::from(String::from_utf8_lossy(ident).into_owned()));
            }
        }
    }
    Ok(paths)
}

/// Paths named in linker scripts are looked up first as given, then in the
/// library search path, then relative to the script itself.
fn resolve_script_path(args: &Args, file: &Path, script_dir: Option<&Path>) -> Result<PathBuf> {
    if file.exists() {
        return Ok(file.to_owned());
    }
    if !file.is_absolute() {
        for dir in &args.lib_search_path {
            let candidate = dir.join(file);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if let Some(dir) = script_dir {
            let candidate = dir.join(file);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    bail!("Linker script input not found: `{}`", file.display());
}

/// Minimal linker script reader: handles GROUP, INPUT, AS_NEEDED and
/// OUTPUT_FORMAT. Anything else is rejected.
fn parse_linker_script(data: &[u8], as_needed: bool) -> Result<Vec<Input>> {
    let text = std::str::from_utf8(data).context("Linker script is not valid UTF-8")?;
    let tokens = tokenize_script(text);
    let mut out = Vec::new();
    let mut it = tokens.iter().peekable();
    while let Some(token) = it.next() {
        match token.as_str() {
            "GROUP" | "INPUT" => {
                expect(&mut it, "(")?;
                let mut needed = as_needed;
                let mut depth = 0;
                for token in it.by_ref() {
                    match token.as_str() {
                        ")" if depth == 0 => break,
                        ")" => {
                            depth -= 1;
                            needed = as_needed;
                        }
                        "AS_NEEDED" => {}
                        "(" => {
                            depth += 1;
                            needed = true;
                        }
                        name => out.push(script_entry(name, needed)),
                    }
                }
            }
            "OUTPUT_FORMAT" => {
                expect(&mut it, "(")?;
                for token in it.by_ref() {
                    if token == ")" {
                        break;
                    }
                }
            }
            other => bail!("Unsupported linker script command `{other}`"),
        }
    }
    Ok(out)
}

fn script_entry(name: &str, as_needed: bool) -> Input {
    let spec = match name.strip_prefix("-l") {
        Some(lib) => InputSpec::Lib(lib.to_owned()),
        None => InputSpec::File(PathBuf::from(name)),
    };
    Input { spec, as_needed }
}

fn expect(it: &mut std::iter::Peekable<std::slice::Iter<String>>, token: &str) -> Result {
    match it.next() {
        Some(t) if t == token => Ok(()),
        other => bail!("Expected `{token}` in linker script, got {other:?}"),
    }
}

fn tokenize_script(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = text;
    'outer: while !rest.is_empty() {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => {
                    rest = &after[end + 2..];
                    continue;
                }
                None => break,
            }
        }
        if rest.starts_with('(') || rest.starts_with(')') {
            tokens.push(rest[..1].to_owned());
            rest = &rest[1..];
            continue;
        }
        for (i, ch) in rest.char_indices() {
            if ch.is_whitespace() || ch == '(' || ch == ')' {
                if i > 0 {
                    tokens.push(rest[..i].to_owned());
                }
                rest = &rest[i..];
                continue 'outer;
            }
        }
        if !rest.is_empty() {
            tokens.push(rest.to_owned());
        }
        break;
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_object_bytes() -> Vec<u8> {
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        header[4] = 2;
        header[5] = 1;
        header[16..18].copy_from_slice(&object::elf::ET_REL.to_le_bytes());
        header
    }

    #[test]
    fn test_preload_cache_is_consumed() {
        let dir = std::env::temp_dir().join(format!("weld-unit-preload-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let member = fake_object_bytes();
        let mut builder =
            ar::Builder::new(std::fs::File::create(dir.join("libt.a")).unwrap());
        let header = ar::Header::new(b"m.o".to_vec(), member.len() as u64);
        builder.append(&header, &member[..]).unwrap();
        drop(builder);

        let mut args = Args::default();
        args.inputs.push(Input {
            spec: InputSpec::File(dir.join("libt.a")),
            as_needed: false,
        });

        let mut cache = PreloadCache::default();
        InputData::preload(&args, &mut cache).unwrap();
        assert_eq!(cache.len(), 1);
        let input_data = InputData::from_args(&args, &mut cache).unwrap();
        assert_eq!(cache.len(), 0, "lookups must consume cache entries");
        assert_eq!(input_data.units.len(), 1);
        assert!(input_data.units[0].is_in_archive);
        assert_eq!(input_data.units[0].member_name.as_deref(), Some("m.o"));
    }

    #[test]
    fn test_tokenize_script() {
        assert_eq!(
            tokenize_script("GROUP ( /lib/libc.so.6 AS_NEEDED(-lm) )"),
            ["GROUP", "(", "/lib/libc.so.6", "AS_NEEDED", "(", "-lm", ")", ")"]
        );
    }

    #[test]
    fn test_parse_group() {
        let inputs =
            parse_linker_script(b"/* GNU ld script */\nGROUP ( a.o AS_NEEDED ( -lm ) b.o )", false)
                .unwrap();
        assert_eq!(inputs.len(), 3);
        assert!(!inputs[0].as_needed);
        assert!(inputs[1].as_needed);
        assert!(matches!(&inputs[1].spec, InputSpec::Lib(l) if l == "m"));
        assert!(!inputs[2].as_needed);
    }

    #[test]
    fn test_output_format_is_skipped() {
        let inputs = parse_linker_script(b"OUTPUT_FORMAT(elf64-x86-64)", false).unwrap();
        assert!(inputs.is_empty());
    }

    #[test]
    fn test_unknown_command_fails() {
        assert!(parse_linker_script(b"SECTIONS { }", false).is_err());
    }
}
