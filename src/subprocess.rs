//! Forks a child to do the actual link so that the parent can return to its
//! caller as soon as the output file exists. The child reports completion
//! over a pipe, then finishes shutdown work (unmapping inputs, dropping the
//! symbol table) in the background. `-no-fork` keeps everything in one
//! process.

use crate::args::Args;
use crate::error::Result;
use anyhow::Context as _;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::FromRawFd;

/// Byte the child sends once the output file has been committed.
const LINK_DONE: u8 = b'D';

/// Forks, links and exits with the appropriate status.
///
/// # Safety
/// Must be called before any threads exist. Forking a threaded process
/// would leave the child holding locks whose owners are gone.
pub(crate) unsafe fn run_in_subprocess(args: &Args) -> ! {
    let status = match fork_and_link(args) {
        Ok(status) => status,
        Err(error) => {
            eprintln!("weld: error: {error:#}");
            crate::output_file::cleanup();
            1
        }
    };
    std::process::exit(status);
}

unsafe fn fork_and_link(args: &Args) -> Result<i32> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if libc::pipe(fds.as_mut_ptr()) != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create pipe");
    }
    let [read_fd, write_fd] = fds;

    match libc::fork() {
        0 => {
            // Child: do the link here and wake the parent once the output
            // is on disk.
            libc::close(read_fd);
            let on_done = move || signal_done_and_detach(write_fd);
            crate::link(args, Some(Box::new(on_done)))?;
            Ok(0)
        }
        -1 => {
            // Couldn't fork; do the work in this process instead.
            libc::close(read_fd);
            libc::close(write_fd);
            crate::link(args, None)?;
            Ok(0)
        }
        child => {
            libc::close(write_fd);
            Ok(await_child(read_fd, child))
        }
    }
}

/// Runs in the child once the output file is committed. After waking the
/// parent we also close stdout and stderr: the shell (or anything reading
/// our output through a pipe or command substitution) must see end-of-file
/// when the parent exits, even though this process lingers to clean up.
fn signal_done_and_detach(write_fd: libc::c_int) {
    // Safety: we own write_fd and the File takes over closing it.
    let mut pipe = unsafe { File::from_raw_fd(write_fd) };
    let _ = pipe.write_all(&[LINK_DONE]);
    drop(pipe);
    unsafe {
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }
}

/// Blocks until the child reports completion or dies. A completion byte
/// means success; end-of-file means the child exited without reporting (an
/// error or a crash), so reap it and forward its exit status.
fn await_child(read_fd: libc::c_int, child: libc::pid_t) -> i32 {
    // Safety: we own read_fd and the File takes over closing it.
    let mut pipe = unsafe { File::from_raw_fd(read_fd) };
    let mut byte = [0u8; 1];
    if matches!(pipe.read(&mut byte), Ok(1)) && byte[0] == LINK_DONE {
        return 0;
    }
    let mut status: libc::c_int = 0;
    unsafe { libc::waitpid(child, &mut status, 0) };
    libc::WEXITSTATUS(status)
}
