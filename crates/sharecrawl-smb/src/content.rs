//! Spooling remote content into memory or temporary files.
//!
//! Content is copied off the session before it is returned, so the session
//! can go back to the pool while the caller reads at its own pace.

use crate::error::Result;
use crate::interrupt::Interrupt;
use bytes::Bytes;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

/// Chunk size for copies; the interrupt is checked between chunks.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Prefix of temporary files holding response bodies.
pub const TEMP_FILE_PREFIX: &str = "crawler-smb-";
pub const TEMP_FILE_SUFFIX: &str = ".out";

#[derive(Debug)]
enum Spool {
    Memory(Cursor<Vec<u8>>),
    Disk(NamedTempFile),
}

/// Content copied off a remote file.
///
/// Content shorter than the threshold given at creation stays in memory.
/// Anything longer lives in a `crawler-smb-*.out` temporary file that is
/// removed when the stream, or the [`ResponseBody`] made from it, is dropped.
#[derive(Debug)]
pub struct ContentStream {
    spool: Spool,
    threshold: usize,
    len: u64,
}

impl ContentStream {
    /// Copy `reader` to the end, moving to disk once `threshold` bytes are
    /// reached.
    pub fn spool(reader: &mut dyn Read, threshold: usize, interrupt: &Interrupt) -> Result<Self> {
        let mut stream = Self {
            spool: Spool::Memory(Cursor::new(Vec::new())),
            threshold,
            len: 0,
        };
        let len = copy_chunked(reader, &mut SpoolWriter(&mut stream), interrupt)?;
        stream.len = len;
        stream.seek(SeekFrom::Start(0))?;
        debug!(len = stream.len, on_disk = !stream.is_in_memory(), "Spooled content");
        Ok(stream)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.spool, Spool::Memory(_))
    }

    /// Temporary file holding the content, once it has spilled.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.spool {
            Spool::Memory(_) => None,
            Spool::Disk(file) => Some(file.path()),
        }
    }

    /// Read up to `limit` bytes from the start, then rewind.
    pub fn peek(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut head = Vec::with_capacity(limit.min(COPY_CHUNK_SIZE));
        self.by_ref().take(limit as u64).read_to_end(&mut head)?;
        self.seek(SeekFrom::Start(0))?;
        Ok(head)
    }

    fn roll_over(&mut self) -> io::Result<()> {
        let Spool::Memory(cursor) = &self.spool else {
            return Ok(());
        };
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .suffix(TEMP_FILE_SUFFIX)
            .tempfile()?;
        file.write_all(cursor.get_ref())?;
        debug!(path = %file.path().display(), "Content moved to temporary file");
        self.spool = Spool::Disk(file);
        Ok(())
    }
}

/// Appends to a stream while it is being filled.
struct SpoolWriter<'a>(&'a mut ContentStream);

impl Write for SpoolWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = &mut *self.0;
        if let Spool::Memory(cursor) = &stream.spool {
            if cursor.get_ref().len() + buf.len() >= stream.threshold {
                stream.roll_over()?;
            }
        }
        match &mut stream.spool {
            Spool::Memory(cursor) => cursor.write(buf),
            Spool::Disk(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0.spool {
            Spool::Memory(_) => Ok(()),
            Spool::Disk(file) => file.flush(),
        }
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.spool {
            Spool::Memory(cursor) => cursor.read(buf),
            Spool::Disk(file) => file.read(buf),
        }
    }
}

impl Seek for ContentStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.spool {
            Spool::Memory(cursor) => cursor.seek(pos),
            Spool::Disk(file) => file.seek(pos),
        }
    }
}

/// Copy in chunks, stopping early when the request is interrupted.
pub fn copy_chunked(reader: &mut dyn Read, writer: &mut dyn Write, interrupt: &Interrupt) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        interrupt.check("content copy")?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Response body handed to the pipeline.
#[derive(Debug, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Memory(Bytes),
    /// Removed from disk when dropped.
    File(TempPath),
}

impl ResponseBody {
    /// Take over the stream's buffer or temporary file without copying.
    pub fn from_stream(stream: ContentStream) -> Self {
        if stream.is_empty() {
            return ResponseBody::Empty;
        }
        match stream.spool {
            Spool::Memory(cursor) => ResponseBody::Memory(Bytes::from(cursor.into_inner())),
            Spool::Disk(file) => {
                let path = file.into_temp_path();
                debug!(path = %path.display(), "Response body kept in temporary file");
                ResponseBody::File(path)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            ResponseBody::File(path) => Some(path),
            _ => None,
        }
    }

    /// Read the whole body. Intended for small bodies and tests.
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Memory(data) => Ok(data.clone()),
            ResponseBody::File(path) => std::fs::read(path).map(Bytes::from),
        }
    }
}
