//! In-memory streams and factory.
//!
//! Storages are shared vectors plus an independently shared "declared size"
//! that plays the role of the file header: readers trust it over the vector
//! length, and an output stream commits it at finalize. Mainly used by tests
//! and by callers whose working sets fit in memory anyway.
//!
//! Everything here is single-threaded (`Rc`-based), matching the sorter's
//! concurrency contract.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use log;

use crate::error::{Result, SortError};
use crate::stream::{InputStream, OutputStream, StorageId, StreamFactory};

const TEMP_PREFIX: &str = "mem_run_";

struct SharedStorage<T> {
    data: Rc<RefCell<Vec<T>>>,
    declared_size: Rc<Cell<u64>>,
}

impl<T> Clone for SharedStorage<T> {
    fn clone(&self) -> Self {
        SharedStorage {
            data: Rc::clone(&self.data),
            declared_size: Rc::clone(&self.declared_size),
        }
    }
}

impl<T> SharedStorage<T> {
    fn new() -> Self {
        SharedStorage {
            data: Rc::new(RefCell::new(Vec::new())),
            declared_size: Rc::new(Cell::new(0)),
        }
    }
}

/// Writes records into a shared vector; finalize commits the declared size.
pub struct InMemoryOutputStream<T> {
    id: StorageId,
    data: Rc<RefCell<Vec<T>>>,
    declared_size: Rc<Cell<u64>>,
    elements_written: u64,
    finalized: bool,
}

impl<T> OutputStream<T> for InMemoryOutputStream<T> {
    fn write(&mut self, value: T) -> Result<()> {
        if self.finalized {
            return Err(SortError::InvalidState(format!("write to finalized stream '{}'", self.id)));
        }
        self.data.borrow_mut().push(value);
        self.elements_written += 1;
        return Ok(());
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.declared_size.set(self.elements_written);
        self.finalized = true;
        log::debug!("finalized '{}' with {} records", self.id, self.elements_written);
        return Ok(());
    }

    fn elements_written(&self) -> u64 {
        self.elements_written
    }

    fn id(&self) -> &StorageId {
        &self.id
    }
}

impl<T> Drop for InMemoryOutputStream<T> {
    fn drop(&mut self) {
        if !self.finalized {
            self.declared_size.set(self.elements_written);
            self.finalized = true;
        }
    }
}

/// Reads records out of a shared vector, one record ahead.
pub struct InMemoryInputStream<T> {
    id: StorageId,
    data: Rc<RefCell<Vec<T>>>,
    total_in_storage: u64,
    cursor: u64,
    current: Option<T>,
    exhausted: bool,
}

impl<T: Clone> InMemoryInputStream<T> {
    fn open(id: StorageId, data: Rc<RefCell<Vec<T>>>, declared_size: u64) -> Result<Self> {
        let actual = data.borrow().len() as u64;
        let total_in_storage = if declared_size > actual {
            log::warn!(
                "storage '{}' declares {} records but holds {}, clamping",
                id,
                declared_size,
                actual
            );
            actual
        } else {
            declared_size
        };

        let mut stream = InMemoryInputStream {
            id,
            data,
            total_in_storage,
            cursor: 0,
            current: None,
            exhausted: total_in_storage == 0,
        };
        if stream.total_in_storage > 0 {
            stream.advance()?;
        }
        return Ok(stream);
    }
}

impl<T: Clone> InputStream<T> for InMemoryInputStream<T> {
    fn advance(&mut self) -> Result<()> {
        if self.exhausted || self.cursor >= self.total_in_storage {
            self.current = None;
            self.exhausted = true;
            return Ok(());
        }
        self.current = Some(self.data.borrow()[self.cursor as usize].clone());
        self.cursor += 1;
        if self.cursor >= self.total_in_storage {
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
        self.total_in_storage == 0
    }
}

/// Stream factory keeping every storage in memory.
pub struct InMemoryStreamFactory<T> {
    storages: HashMap<StorageId, SharedStorage<T>>,
    temp_counter: u64,
}

impl<T> InMemoryStreamFactory<T> {
    /// Creates an empty factory.
    pub fn new() -> Self {
        InMemoryStreamFactory {
            storages: HashMap::new(),
            temp_counter: 0,
        }
    }

    /// Snapshot of a storage's records, header disregarded. Test helper.
    pub fn storage_data(&self, id: &StorageId) -> Option<Vec<T>>
    where
        T: Clone,
    {
        self.storages.get(id).map(|storage| storage.data.borrow().clone())
    }

    /// A storage's declared record count. Test helper.
    pub fn declared_size(&self, id: &StorageId) -> Option<u64> {
        self.storages.get(id).map(|storage| storage.declared_size.get())
    }
}

impl<T> Default for InMemoryStreamFactory<T> {
    fn default() -> Self {
        InMemoryStreamFactory::new()
    }
}

impl<T> StreamFactory<T> for InMemoryStreamFactory<T>
where
    T: Clone + 'static,
{
    fn create_input(&mut self, id: &StorageId, _buffer_capacity: u64) -> Result<Box<dyn InputStream<T>>> {
        let storage = self.storages.get(id).ok_or_else(|| {
            SortError::InvalidState(format!("storage '{}' not found", id))
        })?;
        let stream = InMemoryInputStream::open(
            id.clone(),
            Rc::clone(&storage.data),
            storage.declared_size.get(),
        )?;
        return Ok(Box::new(stream));
    }

    fn create_output(&mut self, id: &StorageId, _buffer_capacity: u64) -> Result<Box<dyn OutputStream<T>>> {
        let storage = SharedStorage::new();
        self.storages.insert(id.clone(), storage.clone());
        return Ok(Box::new(InMemoryOutputStream {
            id: id.clone(),
            data: storage.data,
            declared_size: storage.declared_size,
            elements_written: 0,
            finalized: false,
        }));
    }

    fn create_temp_output(&mut self, buffer_capacity: u64) -> Result<(StorageId, Box<dyn OutputStream<T>>)> {
        let id = format!("{}{}", TEMP_PREFIX, self.temp_counter);
        self.temp_counter += 1;
        let stream = self.create_output(&id, buffer_capacity)?;
        return Ok((id, stream));
    }

    fn delete(&mut self, id: &StorageId) -> Result<()> {
        self.storages.remove(id);
        return Ok(());
    }

    fn make_permanent(&mut self, temp_id: &StorageId, final_id: &StorageId) -> Result<()> {
        if temp_id == final_id {
            return Ok(());
        }
        let storage = self.storages.remove(temp_id).ok_or_else(|| {
            SortError::InvalidState(format!("temporary storage '{}' not found", temp_id))
        })?;
        self.storages.insert(final_id.clone(), storage);
        return Ok(());
    }

    fn exists(&self, id: &StorageId) -> bool {
        self.storages.contains_key(id)
    }

    fn temp_namespace_id(&self) -> StorageId {
        TEMP_PREFIX.to_string()
    }
}
