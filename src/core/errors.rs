use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy shared by all four subsystems.
///
/// There is deliberately one error enum for the whole crate rather than one
/// per subsystem: the caller-facing surface (Storage, Index, Transactions)
/// is a single API, and a `NotFound` raised while resolving a read inside a
/// transaction is the same `NotFound` a direct `Storage::read_document` call
/// would raise.
#[derive(Error, Debug)]
pub enum Error {
    #[error("collection '{name}' does not exist")]
    NoSuchCollection { name: String },

    #[error("collection '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("document not found: collection={collection:?}, id={id:?}")]
    NotFound { collection: String, id: String },

    #[error("corrupt data in {component}: {details}")]
    Corrupt { component: String, details: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not acquire lock on collection '{collection}': {reason}")]
    LockFailure { collection: String, reason: String },

    #[error("serialization error ({context}): {source}")]
    SerializationError {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("transaction {tx_id} is not active")]
    TxNotActive { tx_id: u64 },

    #[error("commit failed for transaction {tx_id}: {reason}")]
    CommitFailed { tx_id: u64, reason: String },

    #[error("WAL replay failed: {reason}")]
    ReplayFailed { reason: String },

    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("lock poisoned: {lock_name} (a prior holder panicked while mutating this state)")]
    LockPoisoned { lock_name: String },
}

impl Error {
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::SerializationError {
            context: context.into(),
            source,
        }
    }

    /// Maps the taxonomy onto the HTTP status codes §7 documents, so an
    /// out-of-scope HTTP layer can consume this without `shelfdb` depending
    /// on any HTTP crate.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Corrupt { .. } | Error::ReplayFailed { .. } => 500,
            Error::LockFailure { .. } => 503,
            Error::AlreadyExists { .. } => 409,
            Error::SerializationError { .. } | Error::ConfigError { .. } => 400,
            Error::NoSuchCollection { .. } => 404,
            Error::TxNotActive { .. } | Error::CommitFailed { .. } => 400,
            Error::Io(_) | Error::LockPoisoned { .. } => 500,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupt { .. })
    }
}

/// Lets a poisoned `RwLock`/`Mutex` guard be recovered instead of panicking.
///
/// A panic inside one transaction's commit must not wedge every other
/// collection's latch for the rest of the process; the poisoned data is by
/// definition mid-mutation, but for an in-memory index or a writer latch the
/// worst case is a stale read, which is no worse than the crash-consistency
/// guarantees the WAL already has to account for.
pub trait PoisonedLockExt<T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<std::sync::RwLockReadGuard<'a, T>>
    for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<std::sync::RwLockWriteGuard<'a, T>>
    for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<std::sync::MutexGuard<'a, T>>
    for std::sync::LockResult<std::sync::MutexGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
