//! Chunked byte transfer between caller streams and back-end streams.

use std::io::{self, Read, Write};

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Copy everything `source` yields into `target` through a buffer of
/// `capacity` bytes, returning the number of bytes moved.
///
/// Short reads are looped until the source reports end of stream and every
/// chunk is written in full before the next read.
pub fn copy<R, W>(source: &mut R, target: &mut W, capacity: usize) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; capacity.max(1)];
    let mut count = 0u64;
    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        target.write_all(&buffer[..read])?;
        count += read as u64;
    }
    target.flush()?;
    Ok(count)
}

/// Reader wrapper that tallies the bytes handed out.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer wrapper that tallies the bytes accepted.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most three bytes per call and fails once with `Interrupted`.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        interrupted: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::Error::new(io::ErrorKind::Interrupted, "again"));
            }
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_copy_drains_short_reads() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut source = Trickle {
            data: data.clone(),
            pos: 0,
            interrupted: false,
        };
        let mut target = Vec::new();
        let copied = copy(&mut source, &mut target, 16).unwrap();
        assert_eq!(copied, 1000);
        assert_eq!(target, data);
    }

    #[test]
    fn test_copy_empty_source() {
        let mut target = Vec::new();
        let copied = copy(&mut io::empty(), &mut target, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(copied, 0);
        assert!(target.is_empty());
    }

    #[test]
    fn test_counting_wrappers() {
        let mut reader = CountingReader::new(&b"hello world"[..]);
        let mut writer = CountingWriter::new(Vec::new());
        copy(&mut reader, &mut writer, 4).unwrap();
        assert_eq!(reader.count(), 11);
        assert_eq!(writer.count(), 11);
        assert_eq!(writer.into_inner(), b"hello world");
    }
}
