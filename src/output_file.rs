//! Output file materialization. The normal backend creates a temp file next
//! to the destination, renames any existing output onto the temp name first
//! (so a running copy of the executable keeps its inode and is never
//! truncated under its own feet), maps it, and atomically renames it into
//! place on commit. Writing to stdout or to a special file goes through an
//! anonymous mapping instead.

use crate::error::Result;
use crate::output_chunks::OutputImage;
use anyhow::bail;
use anyhow::Context as _;
use memmap2::MmapMut;
use memmap2::MmapOptions;
use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

const OUTPUT_PERM: u32 = 0o777;

/// The temp file to unlink if we die. Process-wide because the signal
/// handler has to reach it; only the path bytes live here, never a handle.
static TMPFILE: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

pub(crate) enum OutputFile {
    Mapped {
        path: PathBuf,
        tmp_path: PathBuf,
        mmap: MmapMut,
    },
    Anon {
        path: PathBuf,
        buf: MmapMut,
    },
}

impl OutputFile {
    pub(crate) fn open(path: &Path, file_size: u64) -> Result<OutputFile> {
        let is_special = path == Path::new("-")
            || matches!(std::fs::metadata(path), Ok(m) if !m.is_file());
        if is_special {
            let buf = MmapMut::map_anon(file_size as usize)
                .context("Failed to create anonymous output buffer")?;
            return Ok(OutputFile::Anon {
                path: path.to_owned(),
                buf,
            });
        }

        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        let template = dir
            .unwrap_or(Path::new("."))
            .join(".weld-XXXXXX");
        let mut template_bytes = template.as_os_str().as_bytes().to_vec();
        template_bytes.push(0);
        let fd = unsafe { libc::mkstemp(template_bytes.as_mut_ptr().cast()) };
        if fd < 0 {
            bail!(
                "cannot create temporary file in `{}`: {}",
                dir.unwrap_or(Path::new(".")).display(),
                std::io::Error::last_os_error()
            );
        }
        template_bytes.pop();
        let tmp_path = PathBuf::from(std::ffi::OsStr::from_bytes(&template_bytes));
        set_tmpfile(&tmp_path);

        // If the destination exists, move it over the temp name. Reusing the
        // existing file would also be an option, but that would error if the
        // file is currently being executed.
        let mut file = if std::fs::rename(path, &tmp_path).is_ok() {
            unsafe { libc::close(fd) };
            match open_rw(&tmp_path) {
                Ok(file) => file,
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    open_rw(&tmp_path).with_context(|| {
                        format!("cannot open `{}`", tmp_path.display())
                    })?
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("cannot open `{}`", tmp_path.display()))
                }
            }
        } else {
            unsafe { std::fs::File::from_raw_fd(fd) }
        };

        file.set_len(file_size)
            .with_context(|| format!("Failed to resize `{}`", tmp_path.display()))?;
        let mode = OUTPUT_PERM & !get_umask();
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("Failed to mmap `{}`", tmp_path.display()))?;
        // The mapping keeps the pages; the descriptor isn't needed any more.
        drop(file);
        Ok(OutputFile::Mapped {
            path: path.to_owned(),
            tmp_path,
            mmap,
        })
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        match self {
            OutputFile::Mapped { mmap, .. } => mmap,
            OutputFile::Anon { buf, .. } => buf,
        }
    }

    pub(crate) fn commit(self) -> Result {
        match self {
            OutputFile::Mapped {
                path,
                tmp_path,
                mmap,
            } => {
                // Unmap before the rename so the file isn't busy when the
                // new name becomes visible.
                drop(mmap);
                std::fs::rename(&tmp_path, &path).with_context(|| {
                    format!("Failed to rename `{}` to `{}`", tmp_path.display(), path.display())
                })?;
                clear_tmpfile();
                Ok(())
            }
            OutputFile::Anon { path, buf } => {
                if path == Path::new("-") {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    lock.write_all(&buf)?;
                    lock.flush()?;
                } else {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&path)
                        .with_context(|| format!("cannot open `{}`", path.display()))?;
                    file.write_all(&buf)?;
                }
                Ok(())
            }
        }
    }
}

fn open_rw(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(OUTPUT_PERM)
        .open(path)
}

fn get_umask() -> u32 {
    // umask can only be read by setting it.
    unsafe {
        let current = libc::umask(0);
        libc::umask(current);
        current as u32
    }
}

fn set_tmpfile(path: &Path) {
    if let Ok(cstr) = CString::new(path.as_os_str().as_bytes()) {
        let old = TMPFILE.swap(cstr.into_raw(), Ordering::AcqRel);
        if !old.is_null() {
            drop(unsafe { CString::from_raw(old) });
        }
    }
}

fn clear_tmpfile() {
    let old = TMPFILE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        drop(unsafe { CString::from_raw(old) });
    }
}

/// Unlinks any temp output. Called on fatal errors and from the signal
/// handler.
pub(crate) fn cleanup() {
    let ptr = TMPFILE.load(Ordering::Acquire);
    if !ptr.is_null() {
        unsafe { libc::unlink(ptr) };
    }
}

extern "C" fn handle_signal(_: libc::c_int) {
    // Only async-signal-safe calls are allowed here.
    let ptr = TMPFILE.load(Ordering::Acquire);
    if !ptr.is_null() {
        unsafe { libc::unlink(ptr) };
    }
    unsafe { libc::_exit(1) };
}

pub(crate) fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

/// Zeroes every byte between the logical end of one chunk and the start of
/// the next, plus the tail of the file. Gaps inside a chunk (alignment
/// padding between input sections) are left alone, so -filler survives
/// there.
pub(crate) fn clear_padding(image: &OutputImage, buf: &mut [u8], file_size: usize) {
    let ends: Vec<(usize, usize)> = image
        .chunks
        .iter()
        .map(|c| {
            let mut end = c.shdr.offset as usize;
            if c.shdr.ty != crate::elf::sht::NOBITS {
                end += c.shdr.size as usize;
            }
            (end, c.shdr.offset as usize)
        })
        .collect();
    for i in 1..ends.len() {
        let (prev_end, _) = ends[i - 1];
        let (_, next_start) = ends[i];
        buf[prev_end..next_start].fill(0);
    }
    if let Some(&(last_end, _)) = ends.last() {
        buf[last_end..file_size].fill(0);
    }
}
