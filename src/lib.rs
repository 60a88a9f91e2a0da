//! `kwaymerge` is a k-way external merge sort implementation.
//!
//! External sorting is required when the data being sorted does not fit into
//! the main memory (RAM) of a computer. Sorting happens in two phases: the
//! input is first partitioned into memory-budget-sized sorted runs spilled to
//! temporary storage, then runs are repeatedly merged `k` at a time until a
//! single sorted sequence remains. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Storage agnostic:**
//!   the sorter works through [`StreamFactory`], [`InputStream`] and
//!   [`OutputStream`] and ships with a file backend and an in-memory backend.
//!   Stored sequences carry an 8-byte little-endian record count followed by
//!   the encoded records.
//! * **Serialization strategy selection:**
//!   plain-old-data records are blitted directly ([`PodSerializer`]), records
//!   can encode themselves ([`Record`] / [`RecordSerializer`]), encoding can
//!   be supplied as free functions ([`FnSerializer`]), and `serde` types can
//!   use MessagePack ([`RmpSerializer`]). `String` and `Vec<T>` come with
//!   built-in encodings.
//! * **Memory limit support:**
//!   run creation is budgeted in bytes against each record's estimated
//!   footprint, so heavy variable-size payloads do not blow past the limit.
//! * **Move-aware transfer:**
//!   records move from streams into run buffers and onward into outputs;
//!   payload-bearing records are never copied on the hot path.
//!
//! # Example
//!
//! ```no_run
//! use kwaymerge::{FileStreamFactory, KWayMergeSorterBuilder, PodSerializer};
//!
//! fn main() -> kwaymerge::Result<()> {
//!     let mut factory: FileStreamFactory<u64, _> =
//!         FileStreamFactory::new("temp_sorting", PodSerializer::default())?;
//!
//!     let sorter = KWayMergeSorterBuilder::<u64, PodSerializer<u64>>::new()
//!         .with_memory_limit(64 * 1024 * 1024)
//!         .with_fan_out(16)
//!         .with_io_buffer_elements(1024)
//!         .build(&mut factory, "input.bin", "output.bin")?;
//!
//!     sorter.sort()
//! }
//! ```

pub mod buffer;
pub mod error;
pub mod file;
pub mod memory;
pub mod serial;
pub mod sorter;
pub mod stream;

pub use buffer::ElementBuffer;
pub use error::{Result, SortError};
pub use file::{FileInputStream, FileOutputStream, FileStreamFactory, TempFileManager};
pub use memory::{InMemoryInputStream, InMemoryOutputStream, InMemoryStreamFactory};
pub use serial::{CountingWriter, FnSerializer, PodSerializer, Record, RecordSerializer, RmpSerializer, Serializer};
pub use sorter::{KWayMergeSorter, KWayMergeSorterBuilder};
pub use stream::{InputStream, OutputStream, StorageId, StreamFactory};
