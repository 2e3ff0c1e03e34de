use super::PlatformIo;
use std::ffi::{CString, OsString};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

pub struct LinuxIo;

fn cvt(ret: libc::c_long) -> io::Result<u64> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as u64)
    }
}

impl PlatformIo for LinuxIo {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn preallocate(&self, file: &File, len: u64) -> io::Result<()> {
        let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn advise_sequential(&self, file: &File, len: u64) -> io::Result<()> {
        fadvise(file, len, libc::POSIX_FADV_SEQUENTIAL)
    }

    fn advise_random(&self, file: &File, len: u64) -> io::Result<()> {
        fadvise(file, len, libc::POSIX_FADV_RANDOM)
    }

    fn copy_range(&self, src: &mut File, dst: &mut File, len: u64) -> io::Result<u64> {
        let mut copied = 0u64;
        while copied < len {
            let remaining = (len - copied).min(isize::MAX as u64) as usize;
            let ret = unsafe {
                libc::copy_file_range(
                    src.as_raw_fd(),
                    std::ptr::null_mut(),
                    dst.as_raw_fd(),
                    std::ptr::null_mut(),
                    remaining,
                    0,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // Cross-device or unsupported filesystem; safe to fall back
                // only before any bytes moved, offsets are untouched then.
                if copied == 0
                    && matches!(
                        err.raw_os_error(),
                        Some(libc::EXDEV) | Some(libc::EINVAL) | Some(libc::ENOSYS)
                    )
                {
                    return super::fallback_copy_range(src, dst, len);
                }
                return Err(err);
            }
            if ret == 0 {
                break;
            }
            copied += ret as u64;
        }
        Ok(copied)
    }

    fn batch_unlink(&self, dir: &Path, names: &[OsString]) -> io::Result<usize> {
        let dir_handle = File::open(dir)?;
        let dirfd = dir_handle.as_raw_fd();
        let mut removed = 0;
        for name in names {
            let c_name = CString::new(name.as_bytes())
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            let ret = unsafe { libc::unlinkat(dirfd, c_name.as_ptr(), 0) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOENT) {
                    continue;
                }
                return Err(err);
            }
            removed += 1;
        }
        Ok(removed)
    }

    fn sendfile(
        &self,
        src: RawFd,
        dst: RawFd,
        offset: &mut u64,
        len: usize,
    ) -> io::Result<usize> {
        let mut off = *offset as libc::off_t;
        let sent = cvt(unsafe { libc::sendfile(dst, src, &mut off, len) } as libc::c_long)?;
        *offset = off as u64;
        Ok(sent as usize)
    }
}

fn fadvise(file: &File, len: u64, advice: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, len as libc::off_t, advice)
    };
    // posix_fadvise returns the error number directly.
    if ret != 0 {
        Err(io::Error::from_raw_os_error(ret))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn test_preallocate_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("pre")).unwrap();
        LinuxIo.preallocate(&file, 64 * 1024).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 64 * 1024);
    }

    #[test]
    fn test_copy_range_same_fs() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        std::fs::write(&src_path, b"kernel copy").unwrap();
        let mut src = File::open(&src_path).unwrap();
        let mut dst = File::create(dir.path().join("dst")).unwrap();
        let copied = LinuxIo.copy_range(&mut src, &mut dst, 11).unwrap();
        assert_eq!(copied, 11);
        drop(dst);
        assert_eq!(
            std::fs::read(dir.path().join("dst")).unwrap(),
            b"kernel copy"
        );
    }

    #[test]
    fn test_copy_range_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("short");
        std::fs::write(&src_path, b"abc").unwrap();
        let mut src = File::open(&src_path).unwrap();
        let mut dst = File::create(dir.path().join("out")).unwrap();
        let copied = LinuxIo.copy_range(&mut src, &mut dst, 100).unwrap();
        assert_eq!(copied, 3);
    }

    #[test]
    fn test_batch_unlink_via_dirfd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("p1"), b"1").unwrap();
        std::fs::write(dir.path().join("p2"), b"2").unwrap();
        let removed = LinuxIo
            .batch_unlink(dir.path(), &["p1".into(), "p2".into(), "gone".into()])
            .unwrap();
        assert_eq!(removed, 2);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_advise_hints_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adv");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"data").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let file = File::open(&path).unwrap();
        LinuxIo.advise_sequential(&file, 4).unwrap();
        LinuxIo.advise_random(&file, 4).unwrap();
    }
}
