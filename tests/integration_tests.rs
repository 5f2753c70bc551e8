//! Tests that synthesize small relocatable objects, link them with weld and
//! then examine the resulting binaries. Input objects are built in-memory
//! with the object crate so the tests don't depend on a system toolchain.

use object::write::Object;
use object::write::Relocation;
use object::write::Symbol;
use object::write::SymbolSection;
use object::Architecture;
use object::BinaryFormat;
use object::Endianness;
use object::RelocationFlags;
use object::SectionKind;
use object::SymbolFlags;
use object::SymbolKind;
use object::SymbolScope;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

// exit(0) on x86-64 linux.
const EXIT_CODE: &[u8] = &[
    0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
    0x31, 0xff, // xor edi, edi
    0x0f, 0x05, // syscall
];

fn new_object() -> Object<'static> {
    Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

struct ObjBuilder {
    obj: Object<'static>,
}

impl ObjBuilder {
    fn new() -> ObjBuilder {
        ObjBuilder { obj: new_object() }
    }

    fn define(
        &mut self,
        section_name: &str,
        kind: SectionKind,
        data: &[u8],
        symbol: &str,
        weak: bool,
    ) -> &mut Self {
        let section = self
            .obj
            .add_section(Vec::new(), section_name.as_bytes().to_vec(), kind);
        self.obj.append_section_data(section, data, 8);
        self.obj.add_symbol(Symbol {
            name: symbol.as_bytes().to_vec(),
            value: 0,
            size: data.len() as u64,
            kind: if kind == SectionKind::Text {
                SymbolKind::Text
            } else {
                SymbolKind::Data
            },
            scope: SymbolScope::Linkage,
            weak,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        self
    }

    fn reference(&mut self, symbol: &str) -> &mut Self {
        self.obj.add_symbol(Symbol {
            name: symbol.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self
    }

    fn write_to(&mut self, path: &Path) {
        let bytes = self.obj.write().unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

fn workdir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("weld-test-{}-{test}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn run_linker(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_weld"))
        .arg("-no-fork")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run weld")
}

/// A minimal ELF64 reader; enough to check what the linker produced without
/// relying on a reader's interpretation of it.
struct LinkedOutput {
    data: Vec<u8>,
}

#[derive(Clone)]
struct OutSection {
    name: String,
    sh_type: u32,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
}

struct OutSymbol {
    name: String,
    value: u64,
    shndx: u16,
}

impl LinkedOutput {
    fn parse(path: &Path) -> LinkedOutput {
        let data = std::fs::read(path).unwrap();
        assert!(data.len() > 64, "output too short");
        assert_eq!(&data[..4], b"\x7fELF");
        LinkedOutput { data }
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.data[offset..offset + 2].try_into().unwrap())
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap())
    }

    fn entry(&self) -> u64 {
        self.u64_at(24)
    }

    fn e_type(&self) -> u16 {
        self.u16_at(16)
    }

    fn program_header_types(&self) -> Vec<u32> {
        let phoff = self.u64_at(32) as usize;
        let phnum = self.u16_at(56) as usize;
        (0..phnum)
            .map(|i| self.u32_at(phoff + i * 56))
            .collect()
    }

    fn sections(&self) -> Vec<OutSection> {
        let shoff = self.u64_at(40) as usize;
        let shnum = self.u16_at(60) as usize;
        let shstrndx = self.u16_at(62) as usize;
        let raw = |i: usize| {
            let at = shoff + i * 64;
            (
                self.u32_at(at),          // sh_name
                self.u32_at(at + 4),      // sh_type
                self.u64_at(at + 16),     // sh_addr
                self.u64_at(at + 24),     // sh_offset
                self.u64_at(at + 32),     // sh_size
                self.u32_at(at + 40),     // sh_link
                self.u32_at(at + 44),     // sh_info
            )
        };
        let (_, _, _, str_off, _, _, _) = raw(shstrndx);
        let name_at = |name_offset: u32| {
            let start = str_off as usize + name_offset as usize;
            let end = self.data[start..].iter().position(|&b| b == 0).unwrap() + start;
            String::from_utf8_lossy(&self.data[start..end]).into_owned()
        };
        (0..shnum)
            .map(|i| {
                let (sh_name, sh_type, addr, offset, size, link, info) = raw(i);
                OutSection {
                    name: name_at(sh_name),
                    sh_type,
                    addr,
                    offset,
                    size,
                    link,
                    info,
                }
            })
            .collect()
    }

    fn section(&self, name: &str) -> Option<OutSection> {
        self.sections().into_iter().find(|s| s.name == name)
    }

    fn read_symbols(&self, symtab_name: &str, strtab_name: &str) -> Vec<OutSymbol> {
        let sections = self.sections();
        let Some(symtab) = sections.iter().find(|s| s.name == symtab_name) else {
            return Vec::new();
        };
        let strtab = sections
            .iter()
            .find(|s| s.name == strtab_name)
            .expect("symbol table without string table");
        let count = (symtab.size / 24) as usize;
        (1..count)
            .map(|i| {
                let at = symtab.offset as usize + i * 24;
                OutSymbol {
                    name: self.string_at(strtab, self.u32_at(at)),
                    value: self.u64_at(at + 8),
                    shndx: self.u16_at(at + 6),
                }
            })
            .collect()
    }

    fn string_at(&self, strtab: &OutSection, offset: u32) -> String {
        let start = strtab.offset as usize + offset as usize;
        let end = self.data[start..].iter().position(|&b| b == 0).unwrap() + start;
        String::from_utf8_lossy(&self.data[start..end]).into_owned()
    }

    fn symbols(&self) -> Vec<OutSymbol> {
        self.read_symbols(".symtab", ".strtab")
    }

    fn symbol(&self, name: &str) -> Option<OutSymbol> {
        self.symbols().into_iter().find(|s| s.name == name)
    }

    fn dynamic_symbols(&self) -> Vec<OutSymbol> {
        self.read_symbols(".dynsym", ".dynstr")
    }
}

#[test]
fn test_static_executable() {
    let dir = workdir("static");
    ObjBuilder::new()
        .define(".text", SectionKind::Text, EXIT_CODE, "_start", false)
        .write_to(&dir.join("main.o"));

    let out = run_linker(&dir, &["-static", "-o", "out", "main.o"]);
    assert!(out.status.success(), "link failed: {:?}", out);

    let linked = LinkedOutput::parse(&dir.join("out"));
    assert_eq!(linked.e_type(), 2, "expected ET_EXEC");
    let start = linked.symbol("_start").expect("_start missing from symtab");
    assert_eq!(linked.entry(), start.value);
    let text = linked.section(".text").expect(".text missing");
    assert!(start.value >= text.addr && start.value < text.addr + text.size);
    assert!(
        !linked.program_header_types().contains(&3),
        "static executable must not have PT_INTERP"
    );
    // The copied code must be present at .text's file offset.
    let at = text.offset as usize;
    assert_eq!(&linked.data[at..at + EXIT_CODE.len()], EXIT_CODE);
}

#[test]
fn test_weak_definition_is_overridden() {
    let dir = workdir("weak");
    ObjBuilder::new()
        .define("adata", SectionKind::Data, &[0x11; 8], "foo", true)
        .write_to(&dir.join("a.o"));
    ObjBuilder::new()
        .define("bdata", SectionKind::Data, &[0x22; 8], "foo", false)
        .write_to(&dir.join("b.o"));

    for order in [["a.o", "b.o"], ["b.o", "a.o"]] {
        let out = run_linker(&dir, &["-o", "out", order[0], order[1]]);
        assert!(out.status.success(), "link failed: {:?}", out);
        let linked = LinkedOutput::parse(&dir.join("out"));
        let foo = linked.symbol("foo").expect("foo missing");
        let strong_home = linked.section("bdata").expect("bdata missing");
        assert!(
            foo.value >= strong_home.addr && foo.value < strong_home.addr + strong_home.size,
            "foo resolved into the weak definition for order {order:?}"
        );
    }
}

#[test]
fn test_duplicate_strong_definitions_fail() {
    let dir = workdir("dup");
    ObjBuilder::new()
        .define(".data", SectionKind::Data, &[1; 4], "foo", false)
        .write_to(&dir.join("a.o"));
    ObjBuilder::new()
        .define(".data", SectionKind::Data, &[2; 4], "foo", false)
        .write_to(&dir.join("b.o"));

    let out = run_linker(&dir, &["-o", "out", "a.o", "b.o"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("duplicate symbol"), "stderr: {stderr}");
    assert!(!dir.join("out").exists(), "no output may remain on failure");
}

#[test]
fn test_unused_archive_member_is_excluded() {
    let dir = workdir("archive");
    ObjBuilder::new()
        .define(".text", SectionKind::Text, EXIT_CODE, "_start", false)
        .reference("used_fn")
        .write_to(&dir.join("main.o"));
    ObjBuilder::new()
        .define("usedsec", SectionKind::Text, &[0xc3], "used_fn", false)
        .write_to(&dir.join("used.o"));
    ObjBuilder::new()
        .define("unusedsec", SectionKind::Text, &[0xc3], "unused_fn", false)
        .write_to(&dir.join("unused.o"));

    let mut builder = ar::Builder::new(std::fs::File::create(dir.join("libx.a")).unwrap());
    for name in ["used.o", "unused.o"] {
        let data = std::fs::read(dir.join(name)).unwrap();
        let header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
        builder.append(&header, &data[..]).unwrap();
    }
    drop(builder);

    let out = run_linker(&dir, &["-static", "-o", "out", "main.o", "libx.a"]);
    assert!(out.status.success(), "link failed: {:?}", out);

    let linked = LinkedOutput::parse(&dir.join("out"));
    assert!(linked.section("usedsec").is_some());
    assert!(linked.section("unusedsec").is_none());
    assert!(linked.symbol("used_fn").is_some());
    assert!(linked.symbol("unused_fn").is_none());
}

#[test]
fn test_mergeable_strings_are_deduplicated() {
    let dir = workdir("merge");
    for name in ["a.o", "b.o", "c.o"] {
        let mut builder = ObjBuilder::new();
        let section = builder.obj.add_section(
            Vec::new(),
            b".rodata.str1.1".to_vec(),
            SectionKind::ReadOnlyString,
        );
        builder
            .obj
            .append_section_data(section, b"hello\0world\0", 1);
        builder.write_to(&dir.join(name));
    }

    let out = run_linker(&dir, &["-o", "out", "a.o", "b.o", "c.o"]);
    assert!(out.status.success(), "link failed: {:?}", out);

    let linked = LinkedOutput::parse(&dir.join("out"));
    let merged = linked.section(".rodata.str1.1").expect("merged section missing");
    assert_eq!(merged.size, 12, "each distinct string must appear once");
    let at = merged.offset as usize;
    assert_eq!(&linked.data[at..at + 12], b"hello\0world\0");
}

#[test]
fn test_inter_section_padding_is_zero() {
    let dir = workdir("padding");
    ObjBuilder::new()
        .define(".text", SectionKind::Text, EXIT_CODE, "_start", false)
        .define(".data", SectionKind::Data, &[0x55; 32], "some_data", false)
        .write_to(&dir.join("main.o"));

    let out = run_linker(&dir, &["-static", "-filler", "0xaa", "-o", "out", "main.o"]);
    assert!(out.status.success(), "link failed: {:?}", out);

    let linked = LinkedOutput::parse(&dir.join("out"));
    let mut extents: Vec<(u64, u64)> = linked
        .sections()
        .iter()
        .filter(|s| s.sh_type != 8 && s.sh_type != 0) // skip NOBITS and null
        .map(|s| (s.offset, s.offset + s.size))
        .collect();
    extents.push((0, 64)); // file header
    let phoff = linked.u64_at(32);
    let phnum = linked.u16_at(56) as u64;
    extents.push((phoff, phoff + phnum * 56));
    let shoff = linked.u64_at(40);
    let shnum = linked.u16_at(60) as u64;
    extents.push((shoff, shoff + shnum * 64));
    extents.sort();
    // Every byte between consecutive chunk extents must be zero.
    for pair in extents.windows(2) {
        let (_, prev_end) = pair[0];
        let (next_start, _) = pair[1];
        if next_start > prev_end {
            let gap = &linked.data[prev_end as usize..next_start as usize];
            assert!(
                gap.iter().all(|&b| b == 0),
                "padding between chunks not cleared at {prev_end:#x}..{next_start:#x}"
            );
        }
    }
}

#[test]
fn test_entry_option() {
    let dir = workdir("entry");
    ObjBuilder::new()
        .define(".text", SectionKind::Text, EXIT_CODE, "begin", false)
        .write_to(&dir.join("main.o"));

    let out = run_linker(&dir, &["-static", "-e", "begin", "-o", "out", "main.o"]);
    assert!(out.status.success(), "link failed: {:?}", out);
    let linked = LinkedOutput::parse(&dir.join("out"));
    let begin = linked.symbol("begin").expect("begin missing");
    assert_eq!(linked.entry(), begin.value);
}

#[test]
fn test_synthetic_symbols_are_defined() {
    let dir = workdir("synthetic");
    ObjBuilder::new()
        .define(".text", SectionKind::Text, EXIT_CODE, "_start", false)
        .define(".data", SectionKind::Data, &[1; 16], "dat", false)
        .define("mysec", SectionKind::Data, &[2; 8], "in_mysec", false)
        .write_to(&dir.join("main.o"));

    let out = run_linker(&dir, &["-static", "-o", "out", "main.o"]);
    assert!(out.status.success(), "link failed: {:?}", out);
    let linked = LinkedOutput::parse(&dir.join("out"));

    let etext = linked.symbol("_etext").expect("_etext missing");
    let text = linked.section(".text").unwrap();
    assert_eq!(etext.value, text.addr + text.size);

    let mysec = linked.section("mysec").unwrap();
    let start = linked.symbol("__start_mysec").expect("__start_mysec missing");
    let stop = linked.symbol("__stop_mysec").expect("__stop_mysec missing");
    assert_eq!(start.value, mysec.addr);
    assert_eq!(stop.value, mysec.addr + mysec.size);

    let ehdr_start = linked.symbol("__ehdr_start").expect("__ehdr_start missing");
    assert_eq!(ehdr_start.value, 0x400_000);
    assert_ne!(linked.symbol("_end").expect("_end missing").shndx, 0);
}

/// Builds a minimal shared object by hand: a dynamic symbol table, a soname,
/// version definitions and per-symbol version indices. The object crate
/// can't emit verdef records, and hand assembly also keeps the test
/// independent of any reader's interpretation of them.
///
/// The library is `libver.so.1` defining version `WELD_1.1` (index 2) and
/// three symbols carrying it: the function `vfunc`, the data symbol `vdata`
/// and `vdata_alias` at the same address.
fn build_versioned_dso(path: &Path) {
    fn push_str(strtab: &mut Vec<u8>, s: &str) -> u32 {
        let offset = strtab.len() as u32;
        strtab.extend_from_slice(s.as_bytes());
        strtab.push(0);
        offset
    }
    fn dynsym_entry(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
        let mut e = Vec::with_capacity(24);
        e.extend_from_slice(&name.to_le_bytes());
        e.push(info);
        e.push(0);
        e.extend_from_slice(&shndx.to_le_bytes());
        e.extend_from_slice(&value.to_le_bytes());
        e.extend_from_slice(&size.to_le_bytes());
        e
    }
    fn append(out: &mut Vec<u8>, blob: &[u8]) -> u64 {
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let offset = out.len() as u64;
        out.extend_from_slice(blob);
        offset
    }
    fn shdr(ty: u32, offset: u64, size: u64, link: u32, info: u32, entsize: u64) -> Vec<u8> {
        let mut h = Vec::with_capacity(64);
        h.extend_from_slice(&0u32.to_le_bytes()); // sh_name
        h.extend_from_slice(&ty.to_le_bytes());
        h.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
        h.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
        h.extend_from_slice(&offset.to_le_bytes());
        h.extend_from_slice(&size.to_le_bytes());
        h.extend_from_slice(&link.to_le_bytes());
        h.extend_from_slice(&info.to_le_bytes());
        h.extend_from_slice(&8u64.to_le_bytes()); // sh_addralign
        h.extend_from_slice(&entsize.to_le_bytes());
        h
    }

    let mut dynstr = vec![0u8];
    let soname = push_str(&mut dynstr, "libver.so.1");
    let base_ver = push_str(&mut dynstr, "libver.so");
    let version = push_str(&mut dynstr, "WELD_1.1");
    let vfunc = push_str(&mut dynstr, "vfunc");
    let vdata = push_str(&mut dynstr, "vdata");
    let alias = push_str(&mut dynstr, "vdata_alias");

    let mut dynsym = dynsym_entry(0, 0, 0, 0, 0);
    dynsym.extend(dynsym_entry(vfunc, 0x12, 1, 0x1000, 0x10)); // GLOBAL FUNC
    dynsym.extend(dynsym_entry(vdata, 0x11, 1, 0x2000, 8)); // GLOBAL OBJECT
    dynsym.extend(dynsym_entry(alias, 0x11, 1, 0x2000, 8));

    let mut versym = Vec::new();
    for v in [0u16, 2, 2, 2] {
        versym.extend_from_slice(&v.to_le_bytes());
    }

    // Two verdef records: the base version (index 1) and WELD_1.1 (index 2),
    // each with one verdaux naming it.
    let mut verdef = Vec::new();
    for (ndx, flags, name, next) in [(1u16, 1u16, base_ver, 28u32), (2, 0, version, 0)] {
        verdef.extend_from_slice(&1u16.to_le_bytes()); // vd_version
        verdef.extend_from_slice(&flags.to_le_bytes());
        verdef.extend_from_slice(&ndx.to_le_bytes());
        verdef.extend_from_slice(&1u16.to_le_bytes()); // vd_cnt
        verdef.extend_from_slice(&0u32.to_le_bytes()); // vd_hash
        verdef.extend_from_slice(&20u32.to_le_bytes()); // vd_aux
        verdef.extend_from_slice(&next.to_le_bytes());
        verdef.extend_from_slice(&name.to_le_bytes()); // vda_name
        verdef.extend_from_slice(&0u32.to_le_bytes()); // vda_next
    }

    let mut dynamic = Vec::new();
    for (tag, value) in [(14u64, u64::from(soname)), (0, 0)] {
        dynamic.extend_from_slice(&tag.to_le_bytes());
        dynamic.extend_from_slice(&value.to_le_bytes());
    }

    let mut out = vec![0u8; 64];
    let dynsym_off = append(&mut out, &dynsym);
    let dynstr_off = append(&mut out, &dynstr);
    let versym_off = append(&mut out, &versym);
    let verdef_off = append(&mut out, &verdef);
    let dynamic_off = append(&mut out, &dynamic);

    let mut shdrs = vec![0u8; 64]; // null section
    shdrs.extend(shdr(0xb, dynsym_off, dynsym.len() as u64, 2, 1, 24)); // .dynsym
    shdrs.extend(shdr(3, dynstr_off, dynstr.len() as u64, 0, 0, 0)); // .dynstr
    shdrs.extend(shdr(0x6fff_ffff, versym_off, versym.len() as u64, 1, 0, 2));
    shdrs.extend(shdr(0x6fff_fffd, verdef_off, verdef.len() as u64, 2, 2, 0));
    shdrs.extend(shdr(6, dynamic_off, dynamic.len() as u64, 2, 0, 16)); // .dynamic
    let shoff = append(&mut out, &shdrs);

    out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // 64 bit
    out[5] = 1; // little endian
    out[6] = 1;
    out[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
    out[18..20].copy_from_slice(&0x3eu16.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[40..48].copy_from_slice(&shoff.to_le_bytes()); // e_shoff
    out[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out[60..62].copy_from_slice(&6u16.to_le_bytes()); // e_shnum

    std::fs::write(path, out).unwrap();
}

#[test]
fn test_dso_with_versioned_symbols() {
    let dir = workdir("versions");
    build_versioned_dso(&dir.join("libver.so"));

    // The main object calls vfunc through the PLT and takes the address of
    // vdata directly, which forces a copy relocation.
    let mut builder = ObjBuilder::new();
    let text = builder
        .obj
        .add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    let mut code = vec![0xe8, 0, 0, 0, 0]; // call vfunc
    code.extend_from_slice(EXIT_CODE);
    builder.obj.append_section_data(text, &code, 16);
    builder.obj.add_symbol(Symbol {
        name: b"_start".to_vec(),
        value: 0,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    let vfunc_ref = builder.obj.add_symbol(Symbol {
        name: b"vfunc".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    builder
        .obj
        .add_relocation(
            text,
            Relocation {
                offset: 1,
                symbol: vfunc_ref,
                addend: -4,
                flags: RelocationFlags::Elf { r_type: 4 }, // R_X86_64_PLT32
            },
        )
        .unwrap();
    let data = builder
        .obj
        .add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
    builder.obj.append_section_data(data, &[0u8; 8], 8);
    let vdata_ref = builder.obj.add_symbol(Symbol {
        name: b"vdata".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    builder
        .obj
        .add_relocation(
            data,
            Relocation {
                offset: 0,
                symbol: vdata_ref,
                addend: 0,
                flags: RelocationFlags::Elf { r_type: 1 }, // R_X86_64_64
            },
        )
        .unwrap();
    builder.write_to(&dir.join("main.o"));

    let out = run_linker(&dir, &["-o", "out", "main.o", "libver.so"]);
    assert!(out.status.success(), "link failed: {:?}", out);
    let linked = LinkedOutput::parse(&dir.join("out"));

    // Both vdata and its alias were copy-relocated to the same address.
    let dynsyms = linked.dynamic_symbols();
    let dynsym_index = |name: &str| {
        1 + dynsyms
            .iter()
            .position(|s| s.name == name)
            .unwrap_or_else(|| panic!("{name} missing from .dynsym"))
    };
    let vdata_sym = &dynsyms[dynsym_index("vdata") - 1];
    let alias_sym = &dynsyms[dynsym_index("vdata_alias") - 1];
    let copyrel = linked.section(".copyrel").expect(".copyrel missing");
    assert_ne!(vdata_sym.value, 0);
    assert_eq!(vdata_sym.value, alias_sym.value);
    assert!(vdata_sym.value >= copyrel.addr && vdata_sym.value < copyrel.addr + copyrel.size);

    // One COPY relocation for vdata, none for the alias.
    let reladyn = linked.section(".rela.dyn").expect(".rela.dyn missing");
    let relas: Vec<(u64, u32, u32)> = (0..reladyn.size / 24)
        .map(|i| {
            let at = reladyn.offset as usize + i as usize * 24;
            let info = linked.u64_at(at + 8);
            (linked.u64_at(at), info as u32, (info >> 32) as u32)
        })
        .collect();
    let copies: Vec<_> = relas.iter().filter(|(_, r_type, _)| *r_type == 5).collect();
    assert_eq!(copies.len(), 1, "expected exactly one R_X86_64_COPY");
    assert_eq!(copies[0].0, vdata_sym.value);
    assert_eq!(copies[0].2 as usize, dynsym_index("vdata"));

    // Every versioned import's .gnu.version entry holds the Vernaux counter,
    // which starts at 2.
    let versym = linked.section(".gnu.version").expect(".gnu.version missing");
    assert_eq!(versym.size / 2, dynsyms.len() as u64 + 1);
    let versym_at =
        |idx: usize| linked.u16_at(versym.offset as usize + idx * 2);
    assert_eq!(versym_at(0), 0);
    assert_eq!(versym_at(dynsym_index("vfunc")), 2);
    assert_eq!(versym_at(dynsym_index("vdata")), 2);
    assert_eq!(versym_at(dynsym_index("vdata_alias")), 2);

    // One Verneed record for the library with one Vernaux for WELD_1.1.
    let verneed = linked.section(".gnu.version_r").expect(".gnu.version_r missing");
    let dynstr = linked.section(".dynstr").unwrap();
    assert_eq!(verneed.info, 1, "expected one Verneed record");
    let at = verneed.offset as usize;
    assert_eq!(linked.u16_at(at), 1); // vn_version
    assert_eq!(linked.u16_at(at + 2), 1); // vn_cnt
    assert_eq!(linked.string_at(&dynstr, linked.u32_at(at + 4)), "libver.so.1");
    assert_eq!(linked.u32_at(at + 8), 16); // vn_aux
    assert_eq!(linked.u32_at(at + 12), 0); // vn_next
    let aux = at + 16;
    assert_eq!(linked.u16_at(aux + 6), 2); // vna_other
    assert_eq!(linked.string_at(&dynstr, linked.u32_at(aux + 8)), "WELD_1.1");
    assert_eq!(linked.u32_at(aux + 12), 0); // vna_next

    // The library itself is recorded as needed.
    let dynamic = linked.section(".dynamic").expect(".dynamic missing");
    let needed = (0..dynamic.size / 16).find_map(|i| {
        let at = dynamic.offset as usize + i as usize * 16;
        (linked.u64_at(at) == 1).then(|| linked.u64_at(at + 8))
    });
    let needed = needed.expect("DT_NEEDED missing");
    assert_eq!(linked.string_at(&dynstr, needed as u32), "libver.so.1");
}

#[test]
fn test_response_file() {
    let dir = workdir("response");
    ObjBuilder::new()
        .define(".text", SectionKind::Text, EXIT_CODE, "_start", false)
        .write_to(&dir.join("main.o"));
    std::fs::write(dir.join("args.rsp"), "-static -o out 'main.o'").unwrap();

    let out = run_linker(&dir, &["@args.rsp"]);
    assert!(out.status.success(), "link failed: {:?}", out);
    assert!(dir.join("out").exists());
}
