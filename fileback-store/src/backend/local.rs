//! Local filesystem back-end.
//!
//! Objects live under a root directory at their derived path, with the
//! delimiter translated into the platform separator. Writes and copies are
//! staged in a temp file next to the destination, fsynced, then renamed
//! over it, so a reader never sees half an object.

use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use fileback_common::backend::{ensure_distinct, DerivationConfig, StorageBackend};
use fileback_common::error::{FileBackError, IoContext, Result, Side};
use fileback_common::transfer::{self, CountingReader, CountingWriter};
use fileback_common::{BackendObject, FileContext, LocalEntry, PathDeriver};

pub struct LocalBackend {
    root: PathBuf,
    deriver: PathDeriver,
    buffer_size: usize,
}

impl LocalBackend {
    /// `root` must already exist and be writable.
    pub fn new(root: impl Into<PathBuf>, config: &DerivationConfig) -> Result<Self> {
        let root = root.into();
        let deriver = config.deriver()?;
        if !root.is_dir() {
            return Err(FileBackError::io(
                format!("Local root is not a directory: {}", root.display()),
                io::Error::new(io::ErrorKind::NotFound, "missing root"),
            ));
        }
        Ok(Self {
            root,
            deriver,
            buffer_size: config.buffer_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deriver(&self) -> &PathDeriver {
        &self.deriver
    }

    /// Map a derived or literal path onto the filesystem under the root.
    pub fn full_path(&self, path: &str) -> Result<PathBuf> {
        let segments = self.deriver.segments(path);
        if segments.is_empty() {
            return Err(FileBackError::InvalidPath(path.to_string()));
        }
        let mut full = self.root.clone();
        for segment in segments {
            // Prevent path traversal
            let escapes = Path::new(segment)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if escapes {
                return Err(FileBackError::InvalidPath(path.to_string()));
            }
            full.push(segment);
        }
        Ok(full)
    }

    fn ensure_parent<'p>(&self, path: &'p Path) -> Result<&'p Path> {
        let parent = path
            .parent()
            .ok_or_else(|| FileBackError::InvalidPath(path.display().to_string()))?;
        // Already-existing directories, including ones a concurrent writer
        // just created, are fine.
        fs::create_dir_all(parent)
            .io_context(|| format!("Failed to create parent directory {}", parent.display()))?;
        Ok(parent)
    }

    fn stage(&self, dir: &Path) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(".fileback-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .io_context(|| format!("Failed to create temp file in {}", dir.display()))
    }

    fn commit(&self, mut staged: NamedTempFile, dest: &Path) -> Result<()> {
        staged
            .flush()
            .and_then(|_| staged.as_file().sync_all())
            .io_context(|| format!("fsync failed for {}", dest.display()))?;
        staged
            .persist(dest)
            .map_err(|e| FileBackError::io(format!("Failed to replace {}", dest.display()), e.error))?;
        Ok(())
    }
}

/// Metadata of `path` when it is a regular file, `None` when it is absent
/// or something else.
fn regular_file(path: &Path) -> Result<Option<Metadata>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FileBackError::io(format!("Failed to stat {}", path.display()), e)),
    }
}

fn local_object(path: &Path, metadata: &Metadata) -> BackendObject {
    BackendObject::Local(LocalEntry::from_metadata(path.to_path_buf(), metadata))
}

impl StorageBackend for LocalBackend {
    fn copy(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let source_path = ctx.resolve_path(Side::Source, &self.deriver)?;
        let target_path = ctx.resolve_path(Side::Target, &self.deriver)?;
        ensure_distinct(&source_path, &target_path)?;
        let source = self.full_path(&source_path)?;
        let target = self.full_path(&target_path)?;
        if source == target {
            return ensure_distinct(&source.display().to_string(), &target.display().to_string());
        }

        let Some(metadata) = regular_file(&source)? else {
            warn!(path = %source.display(), "Copy source is not a regular file, nothing copied");
            ctx.publish_path(Side::Source, &source_path);
            ctx.publish_path(Side::Target, &target_path);
            ctx.publish_copied(None);
            return Ok(());
        };
        ctx.publish_object(Side::Source, local_object(&source, &metadata));
        if let Some(existing) = regular_file(&target)? {
            ctx.publish_object(Side::Target, local_object(&target, &existing));
        }

        let mut input =
            File::open(&source).io_context(|| format!("Failed to open {}", source.display()))?;
        let parent = self.ensure_parent(&target)?;
        let mut staged = self.stage(parent)?;
        let copied = transfer::copy(&mut input, &mut staged, self.buffer_size)
            .io_context(|| format!("Failed to copy {} to {}", source.display(), target.display()))?;
        self.commit(staged, &target)?;

        debug!(source = %source_path, target = %target_path, bytes = copied, "Local copy complete");
        ctx.publish_path(Side::Source, &source_path);
        ctx.publish_path(Side::Target, &target_path);
        ctx.publish_copied(Some(copied));
        Ok(())
    }

    fn delete(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let path = ctx.resolve_path(Side::Source, &self.deriver)?;
        let full = self.full_path(&path)?;

        let deleted = match regular_file(&full)? {
            Some(metadata) => {
                ctx.publish_object(Side::Source, local_object(&full, &metadata));
                match fs::remove_file(&full) {
                    Ok(()) => true,
                    // Lost a race with another deleter.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                    Err(e) => {
                        return Err(FileBackError::io(
                            format!("Failed to delete {}", full.display()),
                            e,
                        ))
                    }
                }
            }
            None => false,
        };

        if deleted {
            debug!(path = %path, "Local delete complete");
        } else {
            warn!(path = %full.display(), "Nothing to delete");
            ctx.publish_copied(None);
        }
        ctx.publish_path(Side::Source, &path);
        ctx.publish_deleted(deleted);
        Ok(())
    }

    fn read(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let path = ctx.resolve_path(Side::Source, &self.deriver)?;
        let full = self.full_path(&path)?;

        let Some(metadata) = regular_file(&full)? else {
            warn!(path = %full.display(), "Not a regular file, nothing read");
            ctx.publish_path(Side::Source, &path);
            ctx.publish_copied(None);
            return Ok(());
        };
        ctx.publish_object(Side::Source, local_object(&full, &metadata));

        let file = File::open(&full).io_context(|| format!("Failed to open {}", full.display()))?;
        let copied = if let Some(receiver) = ctx.take_source_stream_receiver() {
            let mut reader = CountingReader::new(file);
            receiver(&mut reader)
                .io_context(|| format!("Source stream receiver failed for {}", full.display()))?;
            reader.count()
        } else if let Some(provider) = ctx.take_target_stream() {
            let mut sink = provider().io_context(|| "Failed to open target stream".to_string())?;
            let mut file = file;
            transfer::copy(&mut file, &mut sink, self.buffer_size)
                .io_context(|| format!("Failed to read {}", full.display()))?
        } else {
            return Err(FileBackError::MissingStream(
                "source stream receiver or target stream",
            ));
        };

        debug!(path = %path, bytes = copied, "Local read complete");
        ctx.publish_path(Side::Source, &path);
        ctx.publish_copied(Some(copied));
        Ok(())
    }

    fn write(&self, ctx: &mut FileContext<'_>) -> Result<()> {
        let path = ctx.resolve_path(Side::Target, &self.deriver)?;
        let full = self.full_path(&path)?;

        let source = ctx.take_source_stream();
        let receiver = ctx.take_target_stream_receiver();
        if source.is_none() && receiver.is_none() {
            return Err(FileBackError::MissingStream(
                "source stream or target stream receiver",
            ));
        }

        if let Some(existing) = regular_file(&full)? {
            ctx.publish_object(Side::Target, local_object(&full, &existing));
        }
        let parent = self.ensure_parent(&full)?;
        let mut staged = self.stage(parent)?;

        let copied = if let Some(provider) = source {
            let mut input = provider().io_context(|| "Failed to open source stream".to_string())?;
            transfer::copy(&mut input, &mut staged, self.buffer_size)
                .io_context(|| format!("Failed to write {}", full.display()))?
        } else if let Some(receiver) = receiver {
            let mut writer = CountingWriter::new(&mut staged);
            receiver(&mut writer)
                .and_then(|_| writer.flush())
                .io_context(|| format!("Target stream receiver failed for {}", full.display()))?;
            writer.count()
        } else {
            0
        };
        self.commit(staged, &full)?;

        debug!(path = %path, bytes = copied, "Local write complete");
        ctx.publish_path(Side::Target, &path);
        ctx.publish_copied(Some(copied));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io::{Cursor, Read};

    use fileback_common::FileOperation;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new(dir, &DerivationConfig::default()).unwrap()
    }

    fn write_key(backend: &LocalBackend, key: &str, data: &[u8]) -> Option<u64> {
        let copied = Cell::new(None);
        let data = data.to_vec();
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Write)
            .with_target_key(key);
        ctx.set_source_stream(move || Ok(Box::new(Cursor::new(data)) as Box<dyn Read>));
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        copied.get()
    }

    fn read_key(backend: &LocalBackend, key: &str) -> (Vec<u8>, Option<u64>) {
        let copied = Cell::new(None);
        let mut out = Vec::new();
        let sink = &mut out;
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Read)
            .with_source_key(key);
        ctx.set_target_stream(move || Ok(Box::new(sink) as Box<dyn Write + '_>));
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        (out, copied.get())
    }

    #[test]
    fn test_local_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        assert_eq!(write_key(&backend, "K1", b"hello world"), Some(11));
        let (data, copied) = read_key(&backend, "K1");
        assert_eq!(data, b"hello world");
        assert_eq!(copied, Some(11));

        let derived = backend.deriver().derive(b"K1").unwrap();
        let on_disk = dir.path().join(derived.replace('/', std::path::MAIN_SEPARATOR_STR));
        assert_eq!(fs::read(on_disk).unwrap(), b"hello world");
    }

    #[test]
    fn test_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        write_key(&backend, "K1", b"a much longer first version");
        write_key(&backend, "K1", b"short");
        assert_eq!(read_key(&backend, "K1").0, b"short");
    }

    #[test]
    fn test_write_reports_previous_object_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        write_key(&backend, "K1", b"12345");

        let previous = RefCell::new(None);
        let resolved = RefCell::new(None);
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Write)
            .with_target_key("K1");
        ctx.set_source_stream(|| Ok(Box::new(Cursor::new(b"x".to_vec())) as Box<dyn Read>));
        ctx.set_target_object_receiver(|o| *previous.borrow_mut() = Some(o));
        ctx.set_target_path_receiver(|p| *resolved.borrow_mut() = Some(p));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);

        match previous.into_inner() {
            Some(BackendObject::Local(entry)) => assert_eq!(entry.len, 5),
            other => panic!("unexpected object: {other:?}"),
        }
        assert_eq!(
            resolved.into_inner().unwrap(),
            backend.deriver().derive(b"K1").unwrap()
        );
    }

    #[test]
    fn test_stream_receivers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let written = Cell::new(None);
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Write)
            .with_target_key("K2");
        ctx.set_target_stream_receiver(|w| {
            w.write_all(b"pushed ")?;
            w.write_all(b"bytes")
        });
        ctx.set_bytes_copied_receiver(|c| written.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(written.get(), Some(12));

        let read = RefCell::new(Vec::new());
        let copied = Cell::new(None);
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Read)
            .with_source_key("K2");
        ctx.set_source_stream_receiver(|r| r.read_to_end(&mut read.borrow_mut()).map(|_| ()));
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(read.into_inner(), b"pushed bytes");
        assert_eq!(copied.get(), Some(12));
    }

    #[test]
    fn test_read_absent_does_not_open_streams() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let opened = Cell::new(false);
        let copied = Cell::new(Some(99));
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Read)
            .with_source_key("never written");
        ctx.set_target_stream(|| {
            opened.set(true);
            Ok(Box::new(io::sink()) as Box<dyn Write>)
        });
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert!(!opened.get());
        assert_eq!(copied.get(), None);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        write_key(&backend, "K1", b"doomed");

        let deleted = Cell::new(None);
        let object = RefCell::new(None);
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Delete)
            .with_source_key("K1");
        ctx.set_file_deleted_receiver(|d| deleted.set(Some(d)));
        ctx.set_source_object_receiver(|o| *object.borrow_mut() = Some(o));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(deleted.get(), Some(true));
        assert!(matches!(object.into_inner(), Some(BackendObject::Local(e)) if e.len == 6));
        assert_eq!(read_key(&backend, "K1").1, None);
    }

    #[test]
    fn test_delete_absent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let deleted = Cell::new(None);
        let copied = Cell::new(Some(1));
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Delete)
            .with_source_key("ghost");
        ctx.set_file_deleted_receiver(|d| deleted.set(Some(d)));
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(deleted.get(), Some(false));
        assert_eq!(copied.get(), None);
    }

    #[test]
    fn test_copy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        write_key(&backend, "src", b"copied content");

        let copied = Cell::new(None);
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Copy)
            .with_source_key("src")
            .with_target_key("dst");
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(copied.get(), Some(14));
        assert_eq!(read_key(&backend, "dst").0, b"copied content");
        assert_eq!(read_key(&backend, "src").0, b"copied content");
    }

    #[test]
    fn test_copy_absent_source_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let copied = Cell::new(Some(1));
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Copy)
            .with_source_key("missing")
            .with_target_key("dst");
        ctx.set_bytes_copied_receiver(|c| copied.set(c));
        backend.operate(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(copied.get(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_copy_rejects_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Copy)
            .with_source_path("a/b")
            .with_target_path("a//b");
        assert!(matches!(
            backend.operate(&mut ctx),
            Err(FileBackError::SourceEqualsTarget(_))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_literal_path_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Write)
            .with_target_path("legacy/report.pdf")
            .with_target_key("ignored")
            .with_file_suffix("bin");
        ctx.set_source_stream(|| Ok(Box::new(Cursor::new(b"pdf".to_vec())) as Box<dyn Read>));
        backend.operate(&mut ctx).unwrap();
        assert_eq!(fs::read(dir.path().join("legacy").join("report.pdf")).unwrap(), b"pdf");

        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Write)
            .with_target_key("K1")
            .with_file_suffix("txt");
        ctx.set_source_stream(|| Ok(Box::new(Cursor::new(b"txt".to_vec())) as Box<dyn Read>));
        backend.operate(&mut ctx).unwrap();
        let derived = backend.deriver().derive(b"K1").unwrap();
        let expected = backend.full_path(&format!("{derived}.txt")).unwrap();
        assert_eq!(fs::read(expected).unwrap(), b"txt");
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(matches!(
            backend.full_path("../../etc/passwd"),
            Err(FileBackError::InvalidPath(_))
        ));
        assert!(matches!(backend.full_path("a/./b"), Err(FileBackError::InvalidPath(_))));
        assert!(matches!(backend.full_path("//"), Err(FileBackError::InvalidPath(_))));
        // A leading delimiter stays inside the root.
        assert!(backend.full_path("/etc/passwd").unwrap().starts_with(dir.path()));
    }

    #[test]
    fn test_write_without_stream() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let mut ctx = FileContext::new()
            .with_operation(FileOperation::Write)
            .with_target_key("K1");
        assert!(matches!(
            backend.operate(&mut ctx),
            Err(FileBackError::MissingStream(_))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(LocalBackend::new(&missing, &DerivationConfig::default()).is_err());
    }
}
