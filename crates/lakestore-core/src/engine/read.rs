use super::{Bucket, check_cancelled, modified_time};
use crate::engine::object::{DEFAULT_CONTENT_TYPE, Object};
use crate::error::StoreError;
use crate::hotcache::CACHEABLE_MAX;
use crate::platform::PlatformIo;
use crate::pool::{BufferPools, Tier};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

const STREAM_READ_MIN: u64 = 32 * 1024 * 1024;
const LARGE_READ_MIN: u64 = 4 * 1024 * 1024;
#[cfg(unix)]
const MMAP_READ_MIN: u64 = 64 * 1024;

impl Bucket {
    /// Open a byte range of an object. `length <= 0` reads to the end; the
    /// range is clamped to the object size. Returns the reader and the
    /// object's attributes.
    pub async fn open(
        &self,
        cx: &CancellationToken,
        key: &str,
        offset: u64,
        length: i64,
    ) -> Result<(ObjectReader, Object), StoreError> {
        check_cancelled(cx)?;
        let key = crate::path::clean_key(key)?;
        let want_full = offset == 0 && length <= 0;

        if self.engine.in_memory() {
            let obj = self
                .engine
                .mem
                .get(&self.name, &key)
                .ok_or(StoreError::NotFound)?;
            let size = obj.data.len() as u64;
            let (start, len) = clamp_range(size, offset, length);
            let reader = ObjectReader::Cached(CachedReader::new(
                obj.data.slice(start as usize..(start + len) as usize),
            ));
            let object =
                Object::regular(&self.name, &key, size, &obj.content_type, obj.modified);
            return Ok((reader, object));
        }

        if want_full && self.engine.cache_enabled() {
            if let Some((data, modified)) = self.engine.cache.get_shared(&self.name, &key) {
                let object = Object::regular(
                    &self.name,
                    &key,
                    data.len() as u64,
                    DEFAULT_CONTENT_TYPE,
                    modified,
                );
                return Ok((ObjectReader::Cached(CachedReader::new(data)), object));
            }
        }

        let path = self.object_path(&key)?;
        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            return Err(StoreError::PermissionDenied);
        }
        let size = meta.len();
        let modified = modified_time(&meta);
        let (start, len) = clamp_range(size, offset, length);
        let object = Object::regular(&self.name, &key, size, DEFAULT_CONTENT_TYPE, modified);

        if size >= LARGE_READ_MIN {
            let tier = if size >= STREAM_READ_MIN {
                Tier::Huge
            } else {
                Tier::Large
            };
            let open_path = path.clone();
            let std_file = tokio::task::spawn_blocking(move || std::fs::File::open(&open_path))
                .await
                .map_err(|e| StoreError::Io(io::Error::other(e)))??;
            // Sequential full reads enable kernel readahead; ranged reads
            // hint random access instead.
            let hint = if want_full {
                self.engine.platform.advise_sequential(&std_file, size)
            } else {
                self.engine.platform.advise_random(&std_file, size)
            };
            if let Err(e) = hint {
                tracing::debug!(error = %e, "fadvise unavailable");
            }
            let mut file = tokio::fs::File::from_std(std_file);
            if start > 0 {
                file.seek(io::SeekFrom::Start(start)).await?;
            }
            let reader = FileReader {
                file,
                remaining: len,
                pos: start,
                tier,
                pools: Arc::clone(&self.engine.pools),
                platform: Arc::clone(&self.engine.platform),
            };
            return Ok((ObjectReader::File(reader), object));
        }

        #[cfg(unix)]
        if size >= MMAP_READ_MIN {
            let open_path = path.clone();
            let map = tokio::task::spawn_blocking(move || -> io::Result<memmap2::Mmap> {
                let file = std::fs::File::open(&open_path)?;
                // Read-only mapping over a regular file.
                unsafe { memmap2::Mmap::map(&file) }
            })
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))??;
            let advice = if want_full {
                memmap2::Advice::Sequential
            } else {
                memmap2::Advice::Random
            };
            if let Err(e) = map.advise(advice) {
                tracing::debug!(error = %e, "madvise unavailable");
            }
            let reader = MmapReader {
                map: Arc::new(map),
                pos: start as usize,
                end: (start + len) as usize,
            };
            return Ok((ObjectReader::Mmap(reader), object));
        }

        if want_full && size <= CACHEABLE_MAX as u64 {
            let data = tokio::fs::read(&path).await?;
            if self.engine.cache_enabled() {
                self.engine.cache.put(&self.name, &key, &data, modified);
            }
            let mut object = object;
            object.size = data.len() as u64;
            let reader = ObjectReader::Cached(CachedReader::new(Bytes::from(data)));
            return Ok((reader, object));
        }

        let mut file = tokio::fs::File::open(&path).await?;
        if start > 0 {
            file.seek(io::SeekFrom::Start(start)).await?;
        }
        let reader = FileReader {
            file,
            remaining: len,
            pos: start,
            tier: Tier::Medium,
            pools: Arc::clone(&self.engine.pools),
            platform: Arc::clone(&self.engine.platform),
        };
        Ok((ObjectReader::File(reader), object))
    }
}

fn clamp_range(size: u64, offset: u64, length: i64) -> (u64, u64) {
    let start = offset.min(size);
    let len = if length <= 0 {
        size - start
    } else {
        (length as u64).min(size - start)
    };
    (start, len)
}

/// Reader over an object's bytes, tiered by file size at open time.
pub enum ObjectReader {
    Cached(CachedReader),
    #[cfg(unix)]
    Mmap(MmapReader),
    File(FileReader),
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectReader::Cached(_) => f.write_str("ObjectReader::Cached"),
            #[cfg(unix)]
            ObjectReader::Mmap(_) => f.write_str("ObjectReader::Mmap"),
            ObjectReader::File(_) => f.write_str("ObjectReader::File"),
        }
    }
}

impl ObjectReader {
    /// Drain the reader into `writer` through a pooled buffer.
    pub async fn copy_to<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
    ) -> Result<u64, StoreError> {
        match self {
            ObjectReader::Cached(r) => {
                let rest = r.data.len() - r.pos;
                writer.write_all(&r.data[r.pos..]).await?;
                r.pos = r.data.len();
                Ok(rest as u64)
            }
            #[cfg(unix)]
            ObjectReader::Mmap(r) => {
                let rest = r.end - r.pos;
                writer.write_all(&r.map[r.pos..r.end]).await?;
                r.pos = r.end;
                Ok(rest as u64)
            }
            ObjectReader::File(r) => {
                let mut buf = r.pools.get(r.tier);
                let mut total = 0u64;
                loop {
                    let n = r.read(buf.as_mut_slice()).await?;
                    if n == 0 {
                        break;
                    }
                    writer.write_all(&buf.as_slice()[..n]).await?;
                    total += n as u64;
                }
                Ok(total)
            }
        }
    }

    /// Drain the reader into a TCP socket, using `sendfile` for file-backed
    /// readers and falling back to buffered copies everywhere else.
    #[cfg(target_os = "linux")]
    pub async fn copy_to_tcp(
        &mut self,
        socket: &tokio::net::TcpStream,
    ) -> Result<u64, StoreError> {
        use std::os::unix::io::AsRawFd;

        let mut total = 0u64;
        let mut fall_back = true;
        if let ObjectReader::File(r) = self {
            fall_back = false;
            while r.remaining > 0 {
                socket.writable().await?;
                let want = r.remaining.min(1024 * 1024) as usize;
                let file_fd = r.file.as_raw_fd();
                let sock_fd = socket.as_raw_fd();
                let mut off = r.pos;
                let platform = Arc::clone(&r.platform);
                match socket.try_io(tokio::io::Interest::WRITABLE, || {
                    platform.sendfile(file_fd, sock_fd, &mut off, want)
                }) {
                    Ok(0) => break,
                    Ok(sent) => {
                        r.pos = off;
                        r.remaining -= sent as u64;
                        total += sent as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                        fall_back = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if fall_back {
            total += self.copy_to_socket_buffered(socket).await?;
        }
        Ok(total)
    }

    #[cfg(target_os = "linux")]
    async fn copy_to_socket_buffered(
        &mut self,
        socket: &tokio::net::TcpStream,
    ) -> Result<u64, StoreError> {
        let mut scratch = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            let mut written = 0;
            while written < n {
                socket.writable().await?;
                match socket.try_write(&scratch[written..n]) {
                    Ok(m) => written += m,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            total += n as u64;
        }
        Ok(total)
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObjectReader::Cached(r) => Pin::new(r).poll_read(cx, buf),
            #[cfg(unix)]
            ObjectReader::Mmap(r) => Pin::new(r).poll_read(cx, buf),
            ObjectReader::File(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Reader over cached or in-memory bytes.
pub struct CachedReader {
    data: Bytes,
    pos: usize,
}

impl CachedReader {
    fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }
}

impl AsyncRead for CachedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let n = buf.remaining().min(me.data.len() - me.pos);
        if n > 0 {
            buf.put_slice(&me.data[me.pos..me.pos + n]);
            me.pos += n;
        }
        Poll::Ready(Ok(()))
    }
}

/// Reader that copies out of a whole-file read-only mapping on demand. The
/// mapping is dropped (unmapped) with the reader.
#[cfg(unix)]
pub struct MmapReader {
    map: Arc<memmap2::Mmap>,
    pos: usize,
    end: usize,
}

#[cfg(unix)]
impl AsyncRead for MmapReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let n = buf.remaining().min(me.end - me.pos);
        if n > 0 {
            buf.put_slice(&me.map[me.pos..me.pos + n]);
            me.pos += n;
        }
        Poll::Ready(Ok(()))
    }
}

/// Length-limited file reader backed by pooled buffers for bulk copies.
pub struct FileReader {
    file: tokio::fs::File,
    remaining: u64,
    pos: u64,
    tier: Tier,
    pools: Arc<BufferPools>,
    platform: Arc<dyn PlatformIo>,
}

impl AsyncRead for FileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let mut limited = buf.take(me.remaining.min(usize::MAX as u64) as usize);
        ready!(Pin::new(&mut me.file).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        // SAFETY: `limited` borrows `buf`'s storage; the first `n` bytes of
        // the unfilled region were just initialized by the read.
        unsafe { buf.assume_init(n) };
        buf.advance(n);
        me.remaining -= n as u64;
        me.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}
