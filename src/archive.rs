//! Code to read ar files. We don't use the ar crate because it provides access
//! to data only via the Read trait and we want to borrow the data of each
//! entry. We do however use the ar crate as a dev dependency in our tests so
//! that we can verify consistency.
//!
//! Thin archives use the same entry headers, but member contents live in
//! separate files; each entry's identifier is a path relative to the archive.

use crate::error::Result;
use crate::file_kind;
use anyhow::bail;
use anyhow::Context;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) enum ArchiveEntry<'data> {
    Regular(ArchiveContent<'data>),
    Symbols(SymbolTable<'data>),
    Filenames(ExtendedFilenames<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

#[derive(Clone, Copy)]
pub(crate) struct Identifier<'data> {
    /// The start of the identifier. We don't yet know where the identifier
    /// ends and compute that on-demand to avoid needing to read the memory
    /// unless we actually have to.
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,
    pub(crate) entry_data: &'data [u8],
}

pub(crate) struct SymbolTable<'data> {
    #[allow(dead_code)]
    pub(crate) data: &'data [u8],
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    thin: bool,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const _ASSERTS: () = {
    assert!(core::mem::size_of::<EntryHeader>() == 60);
};

const HEADER_SIZE: usize = core::mem::size_of::<EntryHeader>();

impl<'data> ArchiveIterator<'data> {
    /// Create an iterator from the bytes of the whole archive, including the
    /// magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        if let Some(data) = data.strip_prefix(file_kind::ARCHIVE_MAGIC) {
            return Ok(Self { data, thin: false });
        }
        if let Some(data) = data.strip_prefix(file_kind::THIN_ARCHIVE_MAGIC) {
            return Ok(Self { data, thin: true });
        }
        bail!("Missing archive header");
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("Short entry header");
        }
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        let size: usize = parse_decimal_int(&header.size);
        self.data = rest;
        let ident = std::str::from_utf8(&header.ident).context("archive ident is invalid UTF-8")?;
        let ident = ident.trim_end();
        // In a thin archive, only the symbol table and the extended filenames
        // table carry data; regular entries are just headers.
        let has_data = !self.thin || ident == "/" || ident == "//";
        let entry_data = if has_data {
            if self.data.len() < size {
                bail!("Entry size is {size}, but only {} bytes left", self.data.len());
            }
            let entry_data = &self.data[..size];
            let size_with_padding = size.next_multiple_of(2).min(self.data.len());
            self.data = &self.data[size_with_padding..];
            entry_data
        } else {
            &[]
        };
        let entry = match ident {
            "/" => ArchiveEntry::Symbols(SymbolTable { data: entry_data }),
            "//" => ArchiveEntry::Filenames(ExtendedFilenames { data: entry_data }),
            _ => ArchiveEntry::Regular(ArchiveContent { ident, entry_data }),
        };
        Ok(Some(entry))
    }
}

fn parse_decimal_int(bytes: &[u8]) -> usize {
    let mut value = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value * 10 + ((byte - b'0') as usize);
    }
    value
}

impl<'data> ArchiveContent<'data> {
    /// Returns the identifier (generally a filename) that identifies this
    /// entry. The entry's identifier may be stored in the entry's header, or
    /// it may be in the extended filenames entry, in which case it will be
    /// obtained from `extended_filenames` if present. Since we generally only
    /// need entry identifiers if there's an error, we avoid reading the
    /// actual bytes of the filename until `Identifier::as_slice` is called.
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> Identifier<'data> {
        if let Some(filenames) = extended_filenames {
            if let Some(rest) = self.ident.strip_prefix('/') {
                if let Ok(offset) = rest.parse::<usize>() {
                    if offset <= filenames.data.len() {
                        return Identifier {
                            data: &filenames.data[offset..],
                        };
                    }
                }
            }
        }
        Identifier {
            data: self.ident.as_bytes(),
        }
    }
}

impl<'data> Identifier<'data> {
    pub(crate) fn as_slice(&self) -> &'data [u8] {
        // Identifiers in the entry header are terminated by a '/'; extended
        // filenames by "/\n".
        let end = memchr::memchr2(b'/', b'\n', self.data).unwrap_or(self.data.len());
        &self.data[..end]
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = ar::Builder::new(Vec::new());
        for (name, data) in entries {
            let header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_read_archive() {
        let bytes = build_archive(&[("a.o", b"aaaa"), ("b.o", b"bbbbb"), ("c.o", b"c")]);
        let mut filenames = None;
        let mut entries = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Regular(content) => entries.push(content),
                ArchiveEntry::Symbols(_) => {}
                ArchiveEntry::Filenames(f) => filenames = Some(f),
            }
        }
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_data, b"aaaa");
        assert_eq!(entries[1].entry_data, b"bbbbb");
        assert_eq!(entries[2].entry_data, b"c");
        let names: Vec<&[u8]> = entries
            .iter()
            .map(|e| e.identifier(filenames).as_slice())
            .collect();
        assert_eq!(names, [b"a.o".as_slice(), b"b.o", b"c.o"]);
    }

    #[test]
    fn test_odd_sized_entry_padding() {
        let bytes = build_archive(&[("x.o", b"abc"), ("y.o", b"de")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&bytes)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let regular: usize = entries
            .iter()
            .filter(|e| matches!(e, ArchiveEntry::Regular(_)))
            .count();
        assert_eq!(regular, 2);
    }

    #[test]
    fn test_parse_decimal_int() {
        assert_eq!(parse_decimal_int("123   ".as_bytes()), 123);
        assert_eq!(parse_decimal_int("0   ".as_bytes()), 0);
    }

    #[test]
    fn test_thin_archive() {
        // A hand-built thin archive with one member whose path is in the
        // extended filenames table.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"!<thin>\n");
        let names = b"dir/member.o/\n";
        let mut header = Vec::new();
        header.extend_from_slice(format!("{:<16}", "//").as_bytes());
        header.extend_from_slice(format!("{:<12}", "").as_bytes());
        header.extend_from_slice(format!("{:<6}", "").as_bytes());
        header.extend_from_slice(format!("{:<6}", "").as_bytes());
        header.extend_from_slice(format!("{:<8}", "").as_bytes());
        header.extend_from_slice(format!("{:<10}", names.len()).as_bytes());
        header.extend_from_slice(b"`\n");
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(names);
        let mut member_header = Vec::new();
        member_header.extend_from_slice(format!("{:<16}", "/0").as_bytes());
        member_header.extend_from_slice(format!("{:<12}", "0").as_bytes());
        member_header.extend_from_slice(format!("{:<6}", "0").as_bytes());
        member_header.extend_from_slice(format!("{:<6}", "0").as_bytes());
        member_header.extend_from_slice(format!("{:<8}", "644").as_bytes());
        member_header.extend_from_slice(format!("{:<10}", 1234).as_bytes());
        member_header.extend_from_slice(b"`\n");
        bytes.extend_from_slice(&member_header);

        let mut filenames = None;
        let mut members = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Regular(content) => members.push(content),
                ArchiveEntry::Symbols(_) => {}
                ArchiveEntry::Filenames(f) => filenames = Some(f),
            }
        }
        assert_eq!(members.len(), 1);
        assert!(members[0].entry_data.is_empty());
        assert_eq!(members[0].identifier(filenames).as_slice(), b"dir/member.o");
    }
}
