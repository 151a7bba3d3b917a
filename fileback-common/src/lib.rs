//! Back-end agnostic core of fileback: key to path derivation, the
//! per-operation context, and the `StorageBackend` contract every storage
//! medium implements.

pub mod backend;
pub mod context;
pub mod error;
pub mod object;
pub mod path;
pub mod transfer;

pub use backend::{DerivationConfig, FileOperation, StorageBackend};
pub use context::{FileContext, Slot};
pub use error::{FileBackError, Result, Side};
pub use object::{BackendObject, LocalEntry, RemoteEntry, RemoteKind};
pub use path::{DigestAlgorithm, PathDeriver};
