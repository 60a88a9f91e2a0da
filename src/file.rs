//! File-backed streams and factory.
//!
//! Storage layout: an 8-byte little-endian record count, then the records in
//! the order written, encoded by the stream's serializer. The header holds a
//! placeholder zero until the stream is finalized, so a writer that dies
//! mid-write leaves behind a file that readers see as empty.
//!
//! File handles are used unbuffered; batching happens in the streams' own
//! [`ElementBuffer`], sized in records by the caller.

use std::fs;
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log;

use crate::buffer::ElementBuffer;
use crate::error::{Result, SortError};
use crate::serial::Serializer;
use crate::stream::{InputStream, OutputStream, StorageId, StreamFactory};

/// Reads a stored sequence from a file, one record ahead.
pub struct FileInputStream<T, S> {
    id: StorageId,
    file: File,
    buffer: ElementBuffer<T>,
    total_in_file: u64,
    total_read: u64,
    exhausted: bool,
    current: Option<T>,
    serializer: S,
}

impl<T, S> FileInputStream<T, S>
where
    T: Default,
    S: Serializer<T>,
{
    /// Opens a file and primes the stream on its first record.
    ///
    /// A file shorter than the header, or one with a zero header, yields an
    /// immediately exhausted stream.
    pub fn open(id: &StorageId, buffer_capacity: u64, serializer: S) -> Result<Self> {
        let mut file = File::open(Path::new(id)).map_err(|err| {
            SortError::Io(io::Error::new(
                err.kind(),
                format!("cannot open input file '{}': {}", id, err),
            ))
        })?;

        let total_in_file = match file.read_u64::<LittleEndian>() {
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(err) => return Err(SortError::Io(err)),
        };
        log::debug!("opened input '{}', header records: {}", id, total_in_file);

        let mut stream = FileInputStream {
            id: id.clone(),
            file,
            buffer: ElementBuffer::new(buffer_capacity),
            total_in_file,
            total_read: 0,
            exhausted: total_in_file == 0,
            current: None,
            serializer,
        };
        if stream.total_in_file > 0 {
            stream.advance()?;
        }
        return Ok(stream);
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let remaining = self.total_in_file - self.total_read;
        let count = remaining.min(self.buffer.capacity());
        if count == 0 {
            self.buffer.clear();
            return Ok(());
        }
        return self.serializer.read_batch(&mut self.file, &mut self.buffer, count);
    }
}

impl<T, S> InputStream<T> for FileInputStream<T, S>
where
    T: Default,
    S: Serializer<T>,
{
    fn advance(&mut self) -> Result<()> {
        if self.exhausted || (self.total_in_file > 0 && self.total_read >= self.total_in_file) {
            self.current = None;
            self.exhausted = true;
            return Ok(());
        }
        if !self.buffer.has_more() {
            self.fill_buffer()?;
            if !self.buffer.has_more() {
                self.current = None;
                self.exhausted = true;
                return Ok(());
            }
        }
        self.current = Some(self.buffer.read_next());
        self.total_read += 1;
        if self.total_read >= self.total_in_file {
            self.exhausted = true;
        }
        return Ok(());
    }

    fn value(&self) -> Result<&T> {
        self.current
            .as_ref()
            .ok_or_else(|| SortError::InvalidState(format!("value from exhausted stream '{}'", self.id)))
    }

    fn take_value(&mut self) -> Result<T> {
        self.current
            .take()
            .ok_or_else(|| SortError::InvalidState(format!("take_value from exhausted stream '{}'", self.id)))
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted && self.current.is_none()
    }

    fn is_empty_original_storage(&self) -> bool {
        self.total_in_file == 0
    }
}

/// Writes a stored sequence to a file.
///
/// The true record count is committed by [`OutputStream::finalize`], which
/// also runs (best-effort) on drop.
pub struct FileOutputStream<T: Default, S: Serializer<T>> {
    id: StorageId,
    file: File,
    buffer: ElementBuffer<T>,
    elements_written: u64,
    bytes_written: u64,
    finalized: bool,
    serializer: S,
}

impl<T, S> FileOutputStream<T, S>
where
    T: Default,
    S: Serializer<T>,
{
    /// Creates (truncating) a file and writes the placeholder header.
    pub fn create(id: &StorageId, buffer_capacity: u64, serializer: S) -> Result<Self> {
        let mut file = File::create(Path::new(id)).map_err(|err| {
            SortError::Io(io::Error::new(
                err.kind(),
                format!("cannot create output file '{}': {}", id, err),
            ))
        })?;
        file.write_u64::<LittleEndian>(0)?;
        log::debug!("opened output '{}'", id);

        return Ok(FileOutputStream {
            id: id.clone(),
            file,
            buffer: ElementBuffer::new(buffer_capacity),
            elements_written: 0,
            bytes_written: std::mem::size_of::<u64>() as u64,
            finalized: false,
            serializer,
        });
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = self.serializer.write_batch(self.buffer.data(), &mut self.file)?;
        self.bytes_written += bytes;
        self.buffer.clear();
        return Ok(());
    }
}

impl<T, S> OutputStream<T> for FileOutputStream<T, S>
where
    T: Default,
    S: Serializer<T>,
{
    fn write(&mut self, value: T) -> Result<()> {
        if self.finalized {
            return Err(SortError::InvalidState(format!("write to finalized stream '{}'", self.id)));
        }
        if self.buffer.push(value) {
            self.flush_buffer()?;
        }
        self.elements_written += 1;
        return Ok(());
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.flush_buffer()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_u64::<LittleEndian>(self.elements_written)?;
        self.finalized = true;
        log::debug!(
            "finalized '{}' with {} records, {} bytes total",
            self.id,
            self.elements_written,
            self.bytes_written
        );
        return Ok(());
    }

    fn elements_written(&self) -> u64 {
        self.elements_written
    }

    fn id(&self) -> &StorageId {
        &self.id
    }
}

impl<T: Default, S: Serializer<T>> Drop for FileOutputStream<T, S> {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(err) = self.finalize() {
                log::error!("finalize on drop failed for '{}': {}", self.id, err);
            }
        }
    }
}

/// Owns the scratch directory intermediate runs are written to.
///
/// A manager that created its directory removes it (and everything in it) on
/// drop; a manager pointed at a pre-existing directory leaves it in place.
pub struct TempFileManager {
    base_dir: PathBuf,
    counter: u64,
    owns_directory: bool,
}

impl TempFileManager {
    /// Creates the scratch directory if missing, adopting it otherwise.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let owns_directory = if base_dir.exists() {
            log::warn!("adopted existing temporary directory {}", base_dir.display());
            false
        } else {
            fs::create_dir_all(&base_dir)?;
            log::info!("created temporary directory {}", base_dir.display());
            true
        };

        return Ok(TempFileManager {
            base_dir,
            counter: 0,
            owns_directory,
        });
    }

    /// Mints a fresh unique file ID under the scratch directory.
    pub fn generate_id(&mut self, prefix: &str, extension: &str) -> StorageId {
        let path = self.base_dir.join(format!("{}{}{}", prefix, self.counter, extension));
        self.counter += 1;
        return path.to_string_lossy().into_owned();
    }

    /// Removes a single file. Missing files are not an error.
    pub fn cleanup(&self, id: &StorageId) {
        let path = Path::new(id);
        if path.exists() {
            if let Err(err) = fs::remove_file(path) {
                log::warn!("failed to remove '{}': {}", id, err);
            }
        }
    }

    /// The scratch directory path.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl Drop for TempFileManager {
    fn drop(&mut self) {
        if self.owns_directory && self.base_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&self.base_dir) {
                log::warn!(
                    "failed to remove temporary directory {}: {}",
                    self.base_dir.display(),
                    err
                );
            }
        }
    }
}

/// Stream factory backed by the file system.
pub struct FileStreamFactory<T, S> {
    temp: TempFileManager,
    serializer: S,
    record_type: PhantomData<T>,
}

impl<T, S> FileStreamFactory<T, S>
where
    T: Default + 'static,
    S: Serializer<T> + Clone + 'static,
{
    /// Creates a factory minting temp files under `base_temp_dir`.
    pub fn new(base_temp_dir: impl Into<PathBuf>, serializer: S) -> Result<Self> {
        return Ok(FileStreamFactory {
            temp: TempFileManager::new(base_temp_dir)?,
            serializer,
            record_type: PhantomData,
        });
    }
}

impl<T, S> StreamFactory<T> for FileStreamFactory<T, S>
where
    T: Default + 'static,
    S: Serializer<T> + Clone + 'static,
{
    fn create_input(&mut self, id: &StorageId, buffer_capacity: u64) -> Result<Box<dyn InputStream<T>>> {
        return Ok(Box::new(FileInputStream::open(id, buffer_capacity, self.serializer.clone())?));
    }

    fn create_output(&mut self, id: &StorageId, buffer_capacity: u64) -> Result<Box<dyn OutputStream<T>>> {
        return Ok(Box::new(FileOutputStream::create(id, buffer_capacity, self.serializer.clone())?));
    }

    fn create_temp_output(&mut self, buffer_capacity: u64) -> Result<(StorageId, Box<dyn OutputStream<T>>)> {
        let id = self.temp.generate_id("r", ".b");
        let stream = FileOutputStream::create(&id, buffer_capacity, self.serializer.clone())?;
        return Ok((id, Box::new(stream)));
    }

    fn delete(&mut self, id: &StorageId) -> Result<()> {
        self.temp.cleanup(id);
        return Ok(());
    }

    fn make_permanent(&mut self, temp_id: &StorageId, final_id: &StorageId) -> Result<()> {
        if temp_id == final_id {
            return Ok(());
        }
        if Path::new(final_id).exists() {
            fs::remove_file(Path::new(final_id))?;
        }
        match fs::rename(Path::new(temp_id), Path::new(final_id)) {
            Ok(()) => return Ok(()),
            Err(err) => {
                // rename fails across file systems; fall back to a record copy
                log::warn!("rename '{}' -> '{}' failed ({}), copying instead", temp_id, final_id, err);
                {
                    let mut source = FileInputStream::open(temp_id, 1024, self.serializer.clone())?;
                    let mut destination = FileOutputStream::create(final_id, 1024, self.serializer.clone())?;
                    while !source.is_exhausted() {
                        destination.write(source.take_value()?)?;
                        source.advance()?;
                    }
                    destination.finalize()?;
                }
                self.temp.cleanup(temp_id);
                return Ok(());
            }
        }
    }

    fn exists(&self, id: &StorageId) -> bool {
        Path::new(id).exists()
    }

    fn temp_namespace_id(&self) -> StorageId {
        self.temp.base_dir().to_string_lossy().into_owned()
    }
}
