//! Stream and stream factory contracts.
//!
//! The sorter is written once against these traits and instantiated over
//! either the file backend ([`crate::file`]) or the in-memory backend
//! ([`crate::memory`]). Streams cross the boundary as boxed trait objects;
//! the per-record hot path stays monomorphized over the record type and its
//! serializer.

use crate::error::Result;

/// Opaque, printable storage identifier.
///
/// For the file backend this is a path; for the in-memory backend an
/// arbitrary string key. The sorter treats IDs as opaque except for the
/// output-under-temp-namespace check.
pub type StorageId = String;

/// A sequential reader over a stored sequence of `T`.
///
/// A freshly opened stream over a non-empty storage is primed: `value()`
/// returns the first record. `take_value()` moves the current record out and
/// leaves the stream in a "needs advance" state; `advance()` loads the next
/// record into the cache.
pub trait InputStream<T> {
    /// Advances the stream to the next record.
    fn advance(&mut self) -> Result<()>;

    /// Returns the cached current record.
    ///
    /// Fails with `InvalidState` if the stream is exhausted or the current
    /// record has already been taken.
    fn value(&self) -> Result<&T>;

    /// Transfers ownership of the cached current record.
    ///
    /// Fails with `InvalidState` if the stream is exhausted or the current
    /// record has already been taken.
    fn take_value(&mut self) -> Result<T>;

    /// Checks whether there are no more records to read.
    fn is_exhausted(&self) -> bool;

    /// Checks whether the original storage held no records at all.
    fn is_empty_original_storage(&self) -> bool;
}

/// A sequential writer producing a stored sequence of `T`.
pub trait OutputStream<T> {
    /// Writes a record to the stream, taking ownership of it.
    ///
    /// Fails with `InvalidState` if the stream has been finalized.
    fn write(&mut self, value: T) -> Result<()>;

    /// Finalizes the stream: flushes buffered records and commits the record
    /// count. Idempotent; also performed (best-effort) on drop.
    fn finalize(&mut self) -> Result<()>;

    /// Returns the number of records written so far.
    fn elements_written(&self) -> u64;

    /// Returns the identifier of the backing storage.
    fn id(&self) -> &StorageId;
}

/// Creates streams and manages storage lifecycle for one backend.
pub trait StreamFactory<T: 'static> {
    /// Opens an existing storage for reading. Fails if the storage is absent.
    fn create_input(&mut self, id: &StorageId, buffer_capacity: u64) -> Result<Box<dyn InputStream<T>>>;

    /// Opens a storage for writing, overwriting pre-existing content.
    fn create_output(&mut self, id: &StorageId, buffer_capacity: u64) -> Result<Box<dyn OutputStream<T>>>;

    /// Creates a fresh temporary storage and opens it for writing, returning
    /// the minted ID alongside the stream.
    fn create_temp_output(&mut self, buffer_capacity: u64) -> Result<(StorageId, Box<dyn OutputStream<T>>)>;

    /// Deletes a storage. Deleting an absent storage is not an error.
    fn delete(&mut self, id: &StorageId) -> Result<()>;

    /// Moves a temporary storage under a permanent ID. A no-op when
    /// `temp_id == final_id`; pre-existing content under `final_id` is
    /// replaced.
    fn make_permanent(&mut self, temp_id: &StorageId, final_id: &StorageId) -> Result<()>;

    /// Checks whether a storage with the given ID exists.
    fn exists(&self, id: &StorageId) -> bool;

    /// Returns the ID of the temporary namespace (directory or key prefix)
    /// this factory mints temp IDs under. Used to reject output IDs that
    /// would collide with intermediate runs.
    fn temp_namespace_id(&self) -> StorageId;
}
