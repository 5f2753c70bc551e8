//! Identifies what sort of file we're dealing with based on its first bytes.

use crate::error::Result;
use anyhow::bail;

pub(crate) const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";
pub(crate) const THIN_ARCHIVE_MAGIC: &[u8] = b"!<thin>\n";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
    ThinArchive,
    Text,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(ARCHIVE_MAGIC) {
            return Ok(FileKind::Archive);
        }
        if bytes.starts_with(THIN_ARCHIVE_MAGIC) {
            return Ok(FileKind::ThinArchive);
        }
        if bytes.len() >= 20 && bytes.starts_with(&[0x7f, b'E', b'L', b'F']) {
            if bytes[4] != 2 {
                bail!("Only 64 bit ELF is currently supported");
            }
            if bytes[5] != 1 {
                bail!("Only little endian is currently supported");
            }
            let e_type = u16::from_le_bytes([bytes[16], bytes[17]]);
            return match e_type {
                object::elf::ET_REL => Ok(FileKind::ElfObject),
                object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("Unsupported ELF kind {t}"),
            };
        }
        // A file whose first four bytes are printable is assumed to be a
        // linker script.
        if bytes.len() >= 4 && bytes[..4].iter().all(|b| b.is_ascii() && !b.is_ascii_control()) {
            return Ok(FileKind::Text);
        }
        bail!("Unknown file type");
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF dynamic",
            FileKind::Archive => "archive",
            FileKind::ThinArchive => "thin archive",
            FileKind::Text => "linker script",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header(e_type: u16) -> Vec<u8> {
        let mut h = vec![0u8; 64];
        h[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        h[4] = 2;
        h[5] = 1;
        h[16..18].copy_from_slice(&e_type.to_le_bytes());
        h
    }

    #[test]
    fn test_identify() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\nrest").unwrap(),
            FileKind::Archive
        );
        assert_eq!(
            FileKind::identify_bytes(b"!<thin>\nrest").unwrap(),
            FileKind::ThinArchive
        );
        assert_eq!(
            FileKind::identify_bytes(&elf_header(object::elf::ET_REL)).unwrap(),
            FileKind::ElfObject
        );
        assert_eq!(
            FileKind::identify_bytes(&elf_header(object::elf::ET_DYN)).unwrap(),
            FileKind::ElfDynamic
        );
        assert_eq!(
            FileKind::identify_bytes(b"GROUP(libc.a)").unwrap(),
            FileKind::Text
        );
        assert!(FileKind::identify_bytes(&[0x7f, 0, 1, 2]).is_err());
        assert!(FileKind::identify_bytes(&elf_header(object::elf::ET_EXEC)).is_err());
    }
}
