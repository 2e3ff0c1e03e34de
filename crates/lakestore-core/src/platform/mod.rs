//! Per-OS fast paths behind a common contract. Callers never switch on the
//! platform; the engine picks one implementation at construction.

#[cfg(target_os = "linux")]
mod linux;

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

pub trait PlatformIo: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Reserve space for an upcoming write of `len` bytes. Best-effort.
    fn preallocate(&self, _file: &File, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Hint that `file` will be read sequentially from the start.
    fn advise_sequential(&self, _file: &File, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Hint that `file` will be read at scattered offsets.
    fn advise_random(&self, _file: &File, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Copy `len` bytes from the current offset of `src` to the current
    /// offset of `dst`, kernel-side when the OS supports it.
    fn copy_range(&self, src: &mut File, dst: &mut File, len: u64) -> io::Result<u64> {
        fallback_copy_range(src, dst, len)
    }

    /// Unlink `names` inside `dir`, holding the directory open once.
    /// Returns the number of entries removed; missing entries are skipped.
    fn batch_unlink(&self, dir: &Path, names: &[OsString]) -> io::Result<usize> {
        let mut removed = 0;
        for name in names {
            match std::fs::remove_file(dir.join(name)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Kernel-side copy from `src` at `*offset` into the (socket) fd `dst`.
    /// Advances `offset` by the bytes moved. `Unsupported` when the OS has
    /// no zero-copy path; callers fall back to buffered copies.
    #[cfg(unix)]
    fn sendfile(
        &self,
        _src: RawFd,
        _dst: RawFd,
        _offset: &mut u64,
        _len: usize,
    ) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

pub(crate) fn fallback_copy_range(
    src: &mut File,
    dst: &mut File,
    len: u64,
) -> io::Result<u64> {
    let mut taken = src.take(len);
    let copied = io::copy(&mut taken, dst)?;
    Ok(copied)
}

/// Portable implementation: plain syscalls, no hints, no zero-copy.
pub struct GenericIo;

impl PlatformIo for GenericIo {
    fn name(&self) -> &'static str {
        "generic"
    }
}

pub fn default_platform() -> Arc<dyn PlatformIo> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxIo)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(GenericIo)
    }
}
