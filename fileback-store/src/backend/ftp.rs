//! FTP back-end.
//!
//! Objects live at their derived path relative to a root directory on the
//! server. The back-end drives an already connected, authenticated
//! [`FtpTransport`] in binary mode; connecting and reconnecting belong to
//! whoever builds the transport.
//!
//! Every operation starts by changing into the root and addresses objects
//! with root-relative paths. A WRITE walks the parent segments one at a
//! time, creating the ones that are missing, then returns to the root so
//! the next operation starts from a known working directory.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, warn};

use fileback_common::backend::{ensure_distinct, DerivationConfig, StorageBackend};
use fileback_common::error::{FileBackError, IoContext, Result, Side};
use fileback_common::transfer::{self, CountingReader, CountingWriter};
use fileback_common::{BackendObject, FileContext, PathDeriver, RemoteEntry};

/// The handful of FTP commands the back-end needs.
///
/// Methods returning `bool` report a negative server reply as `Ok(false)`;
/// `Err` is kept for broken connections and other transport failures.
pub trait FtpTransport: Send {
    type Reader: Read;
    type Writer: Write;

    /// CWD
    fn change_dir(&mut self, path: &str) -> io::Result<bool>;

    /// MKD
    fn make_dir(&mut self, path: &str) -> io::Result<bool>;

    /// MLST. `Ok(None)` when the server reports no such object.
    fn entry(&mut self, path: &str) -> io::Result<Option<RemoteEntry>>;

    /// DELE
    fn remove(&mut self, path: &str) -> io::Result<bool>;

    /// RETR, returning the open data connection.
    fn retrieve(&mut self, path: &str) -> io::Result<Self::Reader>;

    /// Close a RETR data connection and read the completion reply.
    fn finish_retrieve(&mut self, reader: Self::Reader) -> io::Result<bool>;

    /// STOR, returning the open data connection.
    fn store(&mut self, path: &str) -> io::Result<Self::Writer>;

    /// Close a STOR data connection and read the completion reply.
    fn finish_store(&mut self, writer: Self::Writer) -> io::Result<bool>;
}

pub struct RemoteBackend<T: FtpTransport> {
    transport: Mutex<T>,
    root: String,
    deriver: PathDeriver,
    buffer_size: usize,
}

impl<T: FtpTransport> RemoteBackend<T> {
    pub fn new(transport: T, root: impl Into<String>, config: &DerivationConfig) -> Result<Self> {
        let deriver = config.deriver()?;
        let mut root = root.into();
        if root.trim().is_empty() {
            root = "/".to_string();
        }
        Ok(Self {
            transport: Mutex::new(transport),
            root,
            deriver,
            buffer_size: config.buffer_size,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn deriver(&self) -> &PathDeriver {
        &self.deriver
    }

    /// Exclusive access to the transport, e.g. to send QUIT before shutdown.
    pub fn lock_transport(&self) -> Result<MutexGuard<'_, T>> {
        self.transport
            .lock()
            .map_err(|_| FileBackError::TransportUnavailable)
    }

    pub fn into_transport(self) -> T {
        self.transport
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Root-relative remote segments of a derived or literal path.
    fn segments<'p>(&self, path: &'p str) -> Result<Vec<&'p str>> {
        let segments = self.deriver.segments(path);
        let escapes = segments
            .iter()
            .flat_map(|s| s.split('/'))
            .any(|part| part == "." || part == "..");
        if segments.is_empty() || escapes {
            return Err(FileBackError::InvalidPath(path.to_string()));
        }
        Ok(segments)
    }

    fn remote_path(&self, path: &str) -> Result<String> {
        Ok(self.segments(path)?.join("/"))
    }

    fn enter_root(&self, transport: &mut T) -> Result<()> {
        let entered = transport
            .change_dir(&self.root)
            .io_context(|| format!("CWD {} failed", self.root))?;
        if !entered {
            return Err(FileBackError::io(
                format!("Remote root {} is not accessible", self.root),
                io::Error::new(io::ErrorKind::NotFound, "CWD refused"),
            ));
        }
        Ok(())
    }

    /// Create every parent directory of `path`, then return to the root.
    fn make_parents(&self, transport: &mut T, path: &str) -> Result<()> {
        let segments = self.segments(path)?;
        let parents = &segments[..segments.len() - 1];
        let mut walked = String::new();
        for segment in parents {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(segment);
            if transport
                .change_dir(segment)
                .io_context(|| format!("CWD {walked} failed"))?
            {
                continue;
            }
            let created = transport
                .make_dir(segment)
                .io_context(|| format!("MKD {walked} failed"))?;
            if !created {
                // Another writer may have created it in the meantime.
                debug!(dir = %walked, "MKD refused, retrying CWD");
            }
            if !transport
                .change_dir(segment)
                .io_context(|| format!("CWD {walked} failed"))?
            {
                error!(dir = %walked, "Could not create remote directory");
                return Err(FileBackError::DirectoryCreationFailed(walked));
            }
        }
        self.enter_root(transport)
    }

    /// Look up `path`, treating anything but a regular file as absent.
    /// `None` means the server could not be asked.
    fn lookup(transport: &mut T, path: &str) -> Option<Option<RemoteEntry>> {
        match transport.entry(path) {
            Ok(entry) => Some(entry.filter(RemoteEntry::is_file)),
            Err(e) => {
                warn!(path = %path, error = %e, "MLST failed, continuing without metadata");
                None
            }
        }
    }

    fn remove(transport: &mut T, path: &str) -> Result<bool> {
        transport
            .remove(path)
            .io_context(|| format!("DELE {path} failed"))
    }

    fn download<W: Write + ?Sized>(&self, transport: &mut T, path: &str, sink: &mut W) -> Result<u64> {
        let mut reader = transport
            .retrieve(path)
            .io_context(|| format!("RETR {path} failed"))?;
        let copied = match transfer::copy(&mut reader, sink, self.buffer_size) {
            Ok(copied) => copied,
            Err(e) => {
                Self::abandon_retrieve(transport, reader, path);
                return Err(FileBackError::io(format!("Failed to read {path}"), e));
            }
        };
        Self::complete_retrieve(transport, reader, path)?;
        Ok(copied)
    }

    fn upload<R: Read + ?Sized>(&self, transport: &mut T, path: &str, input: &mut R) -> Result<u64> {
        let mut writer = transport
            .store(path)
            .io_context(|| format!("STOR {path} failed"))?;
        let copied = match transfer::copy(input, &mut writer, self.buffer_size) {
            Ok(copied) => copied,
            Err(e) => {
                Self::abandon_store(transport, writer, path);
                return Err(FileBackError::io(format!("Failed to write {path}"), e));
            }
        };
        Self::complete_store(transport, writer, path)?;
        Ok(copied)
    }

    /// Close a data connection after a failed transfer, consuming its
    /// completion reply so the control connection stays in step.
    fn abandon_retrieve(transport: &mut T, reader: T::Reader, path: &str) {
        match transport.finish_retrieve(reader) {
            Ok(confirmed) => debug!(path = %path, confirmed, "Closed RETR after failed transfer"),
            Err(e) => warn!(path = %path, error = %e, "Could not close RETR after failed transfer"),
        }
    }

    fn abandon_store(transport: &mut T, writer: T::Writer, path: &str) {
        match transport.finish_store(writer) {
            Ok(confirmed) => debug!(path = %path, confirmed, "Closed STOR after failed transfer"),
            Err(e) => warn!(path = %path, error = %e, "Could not close STOR after failed transfer"),
        }
    }

    fn complete_retrieve(transport: &mut T, reader: T::Reader, path: &str) -> Result<()> {
        let done = transport
            .finish_retrieve(reader)
            .io_context(|| format!("RETR {path} did not complete"))?;
        if !done {
            error!(path = %path, "Server did not confirm RETR");
            return Err(FileBackError::CommandNotCompleted(path.to_string()));
        }
        Ok(())
    }

    fn complete_store(transport: &mut T, writer: T::Writer, path: &str) -> Result<()> {
        let done = transport
            .finish_store(writer)
            .io_context(|| format!("STOR {path} did not complete"))?;
        if !done {
            error!(path = %path, "Server did not confirm STOR");
            return Err(FileBackError::CommandNotCompleted(path.to_string()));
        }
        Ok(())
    }
}

impl<T: FtpTransport> StorageBackend for RemoteBackend<T> {
    fn copy(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let source_path = ctx.resolve_path(Side::Source, &self.deriver)?;
        let target_path = ctx.resolve_path(Side::Target, &self.deriver)?;
        ensure_distinct(&source_path, &target_path)?;
        let source = self.remote_path(&source_path)?;
        let target = self.remote_path(&target_path)?;
        ensure_distinct(&source, &target)?;

        let mut transport = self.lock_transport()?;
        self.enter_root(&mut transport)?;

        match Self::lookup(&mut transport, &source) {
            Some(None) => {
                warn!(path = %source, "Copy source not found on server, nothing copied");
                ctx.publish_path(Side::Source, &source_path);
                ctx.publish_path(Side::Target, &target_path);
                ctx.publish_copied(None);
                return Ok(());
            }
            Some(Some(entry)) => ctx.publish_object(Side::Source, BackendObject::Remote(entry)),
            None => {}
        }
        if let Some(Some(existing)) = Self::lookup(&mut transport, &target) {
            ctx.publish_object(Side::Target, BackendObject::Remote(existing));
        }

        let mut spool = tempfile::tempfile().io_context(|| "Failed to create spool file".to_string())?;
        let fetched = self.download(&mut transport, &source, &mut spool)?;
        spool
            .seek(SeekFrom::Start(0))
            .io_context(|| "Failed to rewind spool file".to_string())?;
        self.make_parents(&mut transport, &target)?;
        let copied = self.upload(&mut transport, &target, &mut spool)?;
        if copied != fetched {
            warn!(source = %source, fetched, copied, "Spooled size differs from stored size");
        }

        debug!(source = %source, target = %target, bytes = copied, "Remote copy complete");
        ctx.publish_path(Side::Source, &source_path);
        ctx.publish_path(Side::Target, &target_path);
        ctx.publish_copied(Some(copied));
        Ok(())
    }

    fn delete(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let path = ctx.resolve_path(Side::Source, &self.deriver)?;
        let remote = self.remote_path(&path)?;

        let mut transport = self.lock_transport()?;
        self.enter_root(&mut transport)?;

        // Without metadata DELE is tried anyway and its reply decides.
        let deleted = match Self::lookup(&mut transport, &remote) {
            Some(None) => false,
            Some(Some(entry)) => {
                ctx.publish_object(Side::Source, BackendObject::Remote(entry));
                Self::remove(&mut transport, &remote)?
            }
            None => Self::remove(&mut transport, &remote)?,
        };

        if deleted {
            debug!(path = %remote, "Remote delete complete");
        } else {
            warn!(path = %remote, "Nothing to delete on server");
            ctx.publish_copied(None);
        }
        ctx.publish_path(Side::Source, &path);
        ctx.publish_deleted(deleted);
        Ok(())
    }

    fn read(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let path = ctx.resolve_path(Side::Source, &self.deriver)?;
        let remote = self.remote_path(&path)?;

        let mut transport = self.lock_transport()?;
        self.enter_root(&mut transport)?;

        match Self::lookup(&mut transport, &remote) {
            Some(None) => {
                warn!(path = %remote, "Not found on server, nothing read");
                ctx.publish_path(Side::Source, &path);
                ctx.publish_copied(None);
                return Ok(());
            }
            Some(Some(entry)) => ctx.publish_object(Side::Source, BackendObject::Remote(entry)),
            None => {}
        }

        let copied = if let Some(receiver) = ctx.take_source_stream_receiver() {
            let reader = transport
                .retrieve(&remote)
                .io_context(|| format!("RETR {remote} failed"))?;
            let mut reader = CountingReader::new(reader);
            if let Err(e) = receiver(&mut reader) {
                Self::abandon_retrieve(&mut transport, reader.into_inner(), &remote);
                return Err(FileBackError::io(
                    format!("Source stream receiver failed for {remote}"),
                    e,
                ));
            }
            let copied = reader.count();
            Self::complete_retrieve(&mut transport, reader.into_inner(), &remote)?;
            copied
        } else if let Some(provider) = ctx.take_target_stream() {
            let mut sink = provider().io_context(|| "Failed to open target stream".to_string())?;
            self.download(&mut transport, &remote, &mut sink)?
        } else {
            return Err(FileBackError::MissingStream(
                "source stream receiver or target stream",
            ));
        };

        debug!(path = %remote, bytes = copied, "Remote read complete");
        ctx.publish_path(Side::Source, &path);
        ctx.publish_copied(Some(copied));
        Ok(())
    }

    fn write(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let path = ctx.resolve_path(Side::Target, &self.deriver)?;
        let remote = self.remote_path(&path)?;

        let source = ctx.take_source_stream();
        let receiver = ctx.take_target_stream_receiver();
        if source.is_none() && receiver.is_none() {
            return Err(FileBackError::MissingStream(
                "source stream or target stream receiver",
            ));
        }

        let mut transport = self.lock_transport()?;
        self.enter_root(&mut transport)?;

        if let Some(Some(existing)) = Self::lookup(&mut transport, &remote) {
            ctx.publish_object(Side::Target, BackendObject::Remote(existing));
        }
        self.make_parents(&mut transport, &remote)?;

        let copied = if let Some(provider) = source {
            let mut input = provider().io_context(|| "Failed to open source stream".to_string())?;
            self.upload(&mut transport, &remote, &mut input)?
        } else if let Some(receiver) = receiver {
            let writer = transport
                .store(&remote)
                .io_context(|| format!("STOR {remote} failed"))?;
            let mut writer = CountingWriter::new(writer);
            if let Err(e) = receiver(&mut writer).and_then(|_| writer.flush()) {
                Self::abandon_store(&mut transport, writer.into_inner(), &remote);
                return Err(FileBackError::io(
                    format!("Target stream receiver failed for {remote}"),
                    e,
                ));
            }
            let copied = writer.count();
            Self::complete_store(&mut transport, writer.into_inner(), &remote)?;
            copied
        } else {
            0
        };

        debug!(path = %remote, bytes = copied, "Remote write complete");
        ctx.publish_path(Side::Target, &path);
        ctx.publish_copied(Some(copied));
        Ok(())
    }
}
