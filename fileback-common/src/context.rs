//! The per-operation context handed to [`StorageBackend::operate`].
//!
//! A context is a closed set of optional slots. Inputs are *providers*:
//! closures evaluated lazily, only once the back-end needs the value, so an
//! expensive stream is never opened for an object that turns out not to
//! exist. Outputs are *receivers*: closures the back-end invokes at most once
//! to hand a result or an opened stream back to the caller.
//!
//! The stored object is always the source of a READ or DELETE and the target
//! of a WRITE. So a READ either pushes the opened object into the source
//! stream receiver, or copies it into the caller's target stream; a WRITE
//! either pulls from the caller's source stream, or pushes the opened
//! destination into the target stream receiver.
//!
//! [`StorageBackend::operate`]: crate::backend::StorageBackend::operate

use std::fmt;
use std::io::{self, Read, Write};

use tracing::debug;

use crate::backend::FileOperation;
use crate::error::{FileBackError, Result, Side};
use crate::object::BackendObject;
use crate::path::PathDeriver;

pub type KeyProvider<'a> = Box<dyn FnOnce() -> Option<Vec<u8>> + 'a>;
pub type TextProvider<'a> = Box<dyn FnOnce() -> Option<String> + 'a>;
pub type ReadProvider<'a> = Box<dyn FnOnce() -> io::Result<Box<dyn Read + 'a>> + 'a>;
pub type WriteProvider<'a> = Box<dyn FnOnce() -> io::Result<Box<dyn Write + 'a>> + 'a>;
pub type ReadReceiver<'a> = Box<dyn FnOnce(&mut dyn Read) -> io::Result<()> + 'a>;
pub type WriteReceiver<'a> = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + 'a>;
pub type Receiver<'a, T> = Box<dyn FnOnce(T) + 'a>;

/// The slot vocabulary of a [`FileContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Operation,
    SourceKey,
    TargetKey,
    SourcePath,
    TargetPath,
    FileSuffix,
    SourceStream,
    SourceStreamReceiver,
    TargetStream,
    TargetStreamReceiver,
    SourcePathReceiver,
    TargetPathReceiver,
    BytesCopiedReceiver,
    SourceObjectReceiver,
    TargetObjectReceiver,
    FileDeletedReceiver,
}

impl Slot {
    pub const ALL: [Slot; 16] = [
        Slot::Operation,
        Slot::SourceKey,
        Slot::TargetKey,
        Slot::SourcePath,
        Slot::TargetPath,
        Slot::FileSuffix,
        Slot::SourceStream,
        Slot::SourceStreamReceiver,
        Slot::TargetStream,
        Slot::TargetStreamReceiver,
        Slot::SourcePathReceiver,
        Slot::TargetPathReceiver,
        Slot::BytesCopiedReceiver,
        Slot::SourceObjectReceiver,
        Slot::TargetObjectReceiver,
        Slot::FileDeletedReceiver,
    ];
}

/// Inputs and result sinks for one logical file operation.
///
/// Create one per call, fill it, pass it to `operate`, then drop it. Every
/// `set_*` method returns whatever the slot held before; [`FileContext::clear`]
/// empties a slot.
#[derive(Default)]
pub struct FileContext<'a> {
    operation: Option<FileOperation>,
    source_key: Option<KeyProvider<'a>>,
    target_key: Option<KeyProvider<'a>>,
    source_path: Option<TextProvider<'a>>,
    target_path: Option<TextProvider<'a>>,
    file_suffix: Option<TextProvider<'a>>,
    source_stream: Option<ReadProvider<'a>>,
    source_stream_receiver: Option<ReadReceiver<'a>>,
    target_stream: Option<WriteProvider<'a>>,
    target_stream_receiver: Option<WriteReceiver<'a>>,
    source_path_receiver: Option<Receiver<'a, String>>,
    target_path_receiver: Option<Receiver<'a, String>>,
    bytes_copied_receiver: Option<Receiver<'a, Option<u64>>>,
    source_object_receiver: Option<Receiver<'a, BackendObject>>,
    target_object_receiver: Option<Receiver<'a, BackendObject>>,
    file_deleted_receiver: Option<Receiver<'a, bool>>,
    // Suffix provider result, evaluated at most once and shared by both sides.
    suffix: Option<Option<String>>,
}

impl<'a> FileContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: FileOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_source_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        self.set_source_key(move || Some(key));
        self
    }

    pub fn with_target_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        self.set_target_key(move || Some(key));
        self
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.set_source_path(move || Some(path));
        self
    }

    pub fn with_target_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.set_target_path(move || Some(path));
        self
    }

    pub fn with_file_suffix(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        self.set_file_suffix(move || Some(suffix));
        self
    }

    pub fn operation(&self) -> Option<FileOperation> {
        self.operation
    }

    pub fn set_operation(&mut self, operation: FileOperation) -> Option<FileOperation> {
        self.operation.replace(operation)
    }

    pub fn set_source_key<F>(&mut self, provider: F) -> Option<KeyProvider<'a>>
    where
        F: FnOnce() -> Option<Vec<u8>> + 'a,
    {
        self.source_key.replace(Box::new(provider))
    }

    pub fn set_target_key<F>(&mut self, provider: F) -> Option<KeyProvider<'a>>
    where
        F: FnOnce() -> Option<Vec<u8>> + 'a,
    {
        self.target_key.replace(Box::new(provider))
    }

    /// A literal source path. When it yields a value it wins over the source key.
    pub fn set_source_path<F>(&mut self, provider: F) -> Option<TextProvider<'a>>
    where
        F: FnOnce() -> Option<String> + 'a,
    {
        self.source_path.replace(Box::new(provider))
    }

    /// A literal target path. When it yields a value it wins over the target key.
    pub fn set_target_path<F>(&mut self, provider: F) -> Option<TextProvider<'a>>
    where
        F: FnOnce() -> Option<String> + 'a,
    {
        self.target_path.replace(Box::new(provider))
    }

    /// Suffix appended to key-derived paths as `.{suffix}`.
    pub fn set_file_suffix<F>(&mut self, provider: F) -> Option<TextProvider<'a>>
    where
        F: FnOnce() -> Option<String> + 'a,
    {
        self.suffix = None;
        self.file_suffix.replace(Box::new(provider))
    }

    /// Bytes for a WRITE, or nothing when the caller prefers to push through
    /// [`FileContext::set_target_stream_receiver`].
    pub fn set_source_stream<F>(&mut self, provider: F) -> Option<ReadProvider<'a>>
    where
        F: FnOnce() -> io::Result<Box<dyn Read + 'a>> + 'a,
    {
        self.source_stream.replace(Box::new(provider))
    }

    /// Receives the opened stored object on READ. The back-end closes it
    /// once the receiver returns.
    pub fn set_source_stream_receiver<F>(&mut self, receiver: F) -> Option<ReadReceiver<'a>>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<()> + 'a,
    {
        self.source_stream_receiver.replace(Box::new(receiver))
    }

    /// Sink a READ copies the stored object into.
    pub fn set_target_stream<F>(&mut self, provider: F) -> Option<WriteProvider<'a>>
    where
        F: FnOnce() -> io::Result<Box<dyn Write + 'a>> + 'a,
    {
        self.target_stream.replace(Box::new(provider))
    }

    /// Receives the opened destination on WRITE. The back-end commits and
    /// closes it once the receiver returns.
    pub fn set_target_stream_receiver<F>(&mut self, receiver: F) -> Option<WriteReceiver<'a>>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + 'a,
    {
        self.target_stream_receiver.replace(Box::new(receiver))
    }

    pub fn set_source_path_receiver<F>(&mut self, receiver: F) -> Option<Receiver<'a, String>>
    where
        F: FnOnce(String) + 'a,
    {
        self.source_path_receiver.replace(Box::new(receiver))
    }

    pub fn set_target_path_receiver<F>(&mut self, receiver: F) -> Option<Receiver<'a, String>>
    where
        F: FnOnce(String) + 'a,
    {
        self.target_path_receiver.replace(Box::new(receiver))
    }

    /// Receives the number of bytes transferred, or `None` when nothing was.
    pub fn set_bytes_copied_receiver<F>(
        &mut self,
        receiver: F,
    ) -> Option<Receiver<'a, Option<u64>>>
    where
        F: FnOnce(Option<u64>) + 'a,
    {
        self.bytes_copied_receiver.replace(Box::new(receiver))
    }

    pub fn set_source_object_receiver<F>(
        &mut self,
        receiver: F,
    ) -> Option<Receiver<'a, BackendObject>>
    where
        F: FnOnce(BackendObject) + 'a,
    {
        self.source_object_receiver.replace(Box::new(receiver))
    }

    pub fn set_target_object_receiver<F>(
        &mut self,
        receiver: F,
    ) -> Option<Receiver<'a, BackendObject>>
    where
        F: FnOnce(BackendObject) + 'a,
    {
        self.target_object_receiver.replace(Box::new(receiver))
    }

    pub fn set_file_deleted_receiver<F>(&mut self, receiver: F) -> Option<Receiver<'a, bool>>
    where
        F: FnOnce(bool) + 'a,
    {
        self.file_deleted_receiver.replace(Box::new(receiver))
    }

    pub fn contains(&self, slot: Slot) -> bool {
        match slot {
            Slot::Operation => self.operation.is_some(),
            Slot::SourceKey => self.source_key.is_some(),
            Slot::TargetKey => self.target_key.is_some(),
            Slot::SourcePath => self.source_path.is_some(),
            Slot::TargetPath => self.target_path.is_some(),
            Slot::FileSuffix => self.file_suffix.is_some(),
            Slot::SourceStream => self.source_stream.is_some(),
            Slot::SourceStreamReceiver => self.source_stream_receiver.is_some(),
            Slot::TargetStream => self.target_stream.is_some(),
            Slot::TargetStreamReceiver => self.target_stream_receiver.is_some(),
            Slot::SourcePathReceiver => self.source_path_receiver.is_some(),
            Slot::TargetPathReceiver => self.target_path_receiver.is_some(),
            Slot::BytesCopiedReceiver => self.bytes_copied_receiver.is_some(),
            Slot::SourceObjectReceiver => self.source_object_receiver.is_some(),
            Slot::TargetObjectReceiver => self.target_object_receiver.is_some(),
            Slot::FileDeletedReceiver => self.file_deleted_receiver.is_some(),
        }
    }

    /// Remove whatever `slot` holds. Returns whether it held anything.
    pub fn clear(&mut self, slot: Slot) -> bool {
        match slot {
            Slot::Operation => self.operation.take().is_some(),
            Slot::SourceKey => self.source_key.take().is_some(),
            Slot::TargetKey => self.target_key.take().is_some(),
            Slot::SourcePath => self.source_path.take().is_some(),
            Slot::TargetPath => self.target_path.take().is_some(),
            Slot::FileSuffix => {
                self.suffix = None;
                self.file_suffix.take().is_some()
            }
            Slot::SourceStream => self.source_stream.take().is_some(),
            Slot::SourceStreamReceiver => self.source_stream_receiver.take().is_some(),
            Slot::TargetStream => self.target_stream.take().is_some(),
            Slot::TargetStreamReceiver => self.target_stream_receiver.take().is_some(),
            Slot::SourcePathReceiver => self.source_path_receiver.take().is_some(),
            Slot::TargetPathReceiver => self.target_path_receiver.take().is_some(),
            Slot::BytesCopiedReceiver => self.bytes_copied_receiver.take().is_some(),
            Slot::SourceObjectReceiver => self.source_object_receiver.take().is_some(),
            Slot::TargetObjectReceiver => self.target_object_receiver.take().is_some(),
            Slot::FileDeletedReceiver => self.file_deleted_receiver.take().is_some(),
        }
    }

    /// Resolve the path for one side of the operation.
    ///
    /// A literal path wins; otherwise the key is digested with `deriver` and
    /// the file suffix, if any, is appended. Providers of that side are
    /// consumed, so each side resolves once per operation.
    pub fn resolve_path(&mut self, side: Side, deriver: &PathDeriver) -> Result<String> {
        let literal = match side {
            Side::Source => self.source_path.take(),
            Side::Target => self.target_path.take(),
        };
        if let Some(path) = literal.and_then(|provider| provider()) {
            debug!(%side, path = %path, "Using literal path");
            return Ok(path);
        }

        let key = match side {
            Side::Source => self.source_key.take(),
            Side::Target => self.target_key.take(),
        };
        let key = key
            .and_then(|provider| provider())
            .ok_or(FileBackError::NoPathLocated(side))?;
        let mut path = deriver.derive(&key)?;
        if let Some(suffix) = self.file_suffix() {
            path.push('.');
            path.push_str(&suffix);
        }
        debug!(%side, path = %path, "Derived path from key");
        Ok(path)
    }

    fn file_suffix(&mut self) -> Option<String> {
        if self.suffix.is_none() {
            let value = self
                .file_suffix
                .take()
                .and_then(|provider| provider())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            self.suffix = Some(value);
        }
        self.suffix.clone().flatten()
    }

    pub fn take_source_stream(&mut self) -> Option<ReadProvider<'a>> {
        self.source_stream.take()
    }

    pub fn take_source_stream_receiver(&mut self) -> Option<ReadReceiver<'a>> {
        self.source_stream_receiver.take()
    }

    pub fn take_target_stream(&mut self) -> Option<WriteProvider<'a>> {
        self.target_stream.take()
    }

    pub fn take_target_stream_receiver(&mut self) -> Option<WriteReceiver<'a>> {
        self.target_stream_receiver.take()
    }

    pub fn publish_path(&mut self, side: Side, path: &str) {
        let receiver = match side {
            Side::Source => self.source_path_receiver.take(),
            Side::Target => self.target_path_receiver.take(),
        };
        if let Some(receiver) = receiver {
            receiver(path.to_string());
        }
    }

    pub fn publish_copied(&mut self, copied: Option<u64>) {
        if let Some(receiver) = self.bytes_copied_receiver.take() {
            receiver(copied);
        }
    }

    pub fn publish_object(&mut self, side: Side, object: BackendObject) {
        let receiver = match side {
            Side::Source => self.source_object_receiver.take(),
            Side::Target => self.target_object_receiver.take(),
        };
        if let Some(receiver) = receiver {
            receiver(object);
        }
    }

    pub fn publish_deleted(&mut self, deleted: bool) {
        if let Some(receiver) = self.file_deleted_receiver.take() {
            receiver(deleted);
        }
    }
}

impl fmt::Debug for FileContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<Slot> = Slot::ALL
            .into_iter()
            .filter(|slot| *slot != Slot::Operation && self.contains(*slot))
            .collect();
        f.debug_struct("FileContext")
            .field("operation", &self.operation)
            .field("slots", &slots)
            .finish()
    }
}
