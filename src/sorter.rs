//! K-way external merge sorter.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use bytesize::ByteSize;
use log;

use crate::error::{Result, SortError};
use crate::serial::Serializer;
use crate::stream::{InputStream, OutputStream, StorageId, StreamFactory};

const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_FAN_OUT: u64 = 16;
const DEFAULT_IO_BUFFER_ELEMENTS: u64 = 1024;

/// One active input run during a k-way merge: the run's current head plus the
/// index of its stream in the side vector.
///
/// Ordering is inverted for ascending sorts so that popping the binary
/// max-heap yields the smallest head. Ties break on the source index, which
/// keeps repeated sorts of the same input byte-identical.
struct MergeSource<T> {
    value: T,
    source: usize,
    ascending: bool,
}

impl<T: Ord> Ord for MergeSource<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_value = if self.ascending {
            other.value.cmp(&self.value)
        } else {
            self.value.cmp(&other.value)
        };
        by_value.then_with(|| other.source.cmp(&self.source))
    }
}

impl<T: Ord> PartialOrd for MergeSource<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> PartialEq for MergeSource<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for MergeSource<T> {}

/// K-way merge sorter builder. Provides methods for [`KWayMergeSorter`]
/// initialization.
pub struct KWayMergeSorterBuilder<T, S> {
    /// Memory budget for phase-1 run buffers, in bytes.
    memory_limit_bytes: u64,
    /// Number of runs merged per group in a single pass.
    fan_out: u64,
    /// Per-stream buffer capacity in records.
    io_buffer_elements: u64,
    /// Sort direction.
    ascending: bool,
    /// Serialization strategy, shared with the factory's streams.
    serializer: S,

    /// Record type.
    record_type: PhantomData<T>,
}

impl<T, S: Default> KWayMergeSorterBuilder<T, S> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        KWayMergeSorterBuilder::default()
    }
}

impl<T, S: Default> Default for KWayMergeSorterBuilder<T, S> {
    fn default() -> Self {
        KWayMergeSorterBuilder {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            fan_out: DEFAULT_FAN_OUT,
            io_buffer_elements: DEFAULT_IO_BUFFER_ELEMENTS,
            ascending: true,
            serializer: S::default(),
            record_type: PhantomData,
        }
    }
}

impl<T, S> KWayMergeSorterBuilder<T, S> {
    /// Sets the memory budget for phase-1 run buffers.
    pub fn with_memory_limit(mut self, bytes: u64) -> KWayMergeSorterBuilder<T, S> {
        self.memory_limit_bytes = bytes;
        return self;
    }

    /// Sets the merge fan-out (must be at least 2).
    pub fn with_fan_out(mut self, fan_out: u64) -> KWayMergeSorterBuilder<T, S> {
        self.fan_out = fan_out;
        return self;
    }

    /// Sets the per-stream buffer capacity in records.
    pub fn with_io_buffer_elements(mut self, elements: u64) -> KWayMergeSorterBuilder<T, S> {
        self.io_buffer_elements = elements;
        return self;
    }

    /// Sets the sort direction.
    pub fn ascending(mut self, ascending: bool) -> KWayMergeSorterBuilder<T, S> {
        self.ascending = ascending;
        return self;
    }

    /// Replaces the serialization strategy.
    pub fn with_serializer<S2>(self, serializer: S2) -> KWayMergeSorterBuilder<T, S2> {
        KWayMergeSorterBuilder {
            memory_limit_bytes: self.memory_limit_bytes,
            fan_out: self.fan_out,
            io_buffer_elements: self.io_buffer_elements,
            ascending: self.ascending,
            serializer,
            record_type: PhantomData,
        }
    }

    /// Builds a [`KWayMergeSorter`] over the given factory and storage IDs.
    ///
    /// Validates the configuration before any I/O: the fan-out must be at
    /// least 2, the buffer capacity positive, and the output ID must not lie
    /// inside the factory's temporary namespace (a sort would delete it as a
    /// consumed run).
    pub fn build<'f>(
        self,
        factory: &'f mut dyn StreamFactory<T>,
        input_id: impl Into<StorageId>,
        output_id: impl Into<StorageId>,
    ) -> Result<KWayMergeSorter<'f, T, S>>
    where
        T: 'static,
    {
        if self.fan_out < 2 {
            return Err(SortError::InvalidArgument(format!(
                "merge fan-out must be at least 2, got {}",
                self.fan_out
            )));
        }
        if self.io_buffer_elements == 0 {
            return Err(SortError::InvalidArgument(
                "I/O buffer capacity must be at least 1 record".to_string(),
            ));
        }

        let output_id = output_id.into();
        let temp_namespace = factory.temp_namespace_id();
        if !temp_namespace.is_empty()
            && output_id.starts_with(&temp_namespace)
            && output_id.len() > temp_namespace.len()
        {
            return Err(SortError::OutputInTempDir {
                output: output_id,
                temp_dir: temp_namespace,
            });
        }

        return Ok(KWayMergeSorter {
            factory,
            input_id: input_id.into(),
            output_id,
            memory_limit_bytes: self.memory_limit_bytes,
            fan_out: self.fan_out,
            io_buffer_elements: self.io_buffer_elements,
            ascending: self.ascending,
            serializer: self.serializer,
        });
    }
}

/// K-way external merge sorter.
///
/// Sorts the sequence stored under an input ID into an output ID, spilling
/// memory-budget-sized sorted runs into the factory's temporary namespace and
/// collapsing them `fan_out` at a time until one remains. Works identically
/// over the file and in-memory backends; the serializer must match the one
/// the factory writes and reads records with.
pub struct KWayMergeSorter<'f, T: 'static, S> {
    factory: &'f mut dyn StreamFactory<T>,
    input_id: StorageId,
    output_id: StorageId,
    memory_limit_bytes: u64,
    fan_out: u64,
    io_buffer_elements: u64,
    ascending: bool,
    serializer: S,
}

impl<'f, T, S> KWayMergeSorter<'f, T, S>
where
    T: Ord + 'static,
    S: Serializer<T>,
{
    /// Runs the sort. Blocks until the output is finalized or an error
    /// surfaces; temp runs created before a failure are removed when the
    /// owning factory drops.
    pub fn sort(mut self) -> Result<()> {
        let mut current_runs = self.create_initial_runs()?;

        if current_runs.is_empty() {
            log::info!("no initial runs, creating empty output '{}'", self.output_id);
            let mut empty = self.factory.create_output(&self.output_id, self.io_buffer_elements)?;
            empty.finalize()?;
            return Ok(());
        }

        while current_runs.len() > 1 {
            log::info!("merge pass over {} runs", current_runs.len());
            let mut next_runs = Vec::new();
            let mut consumed = Vec::new();
            let run_count = current_runs.len();

            for (group_index, group) in current_runs.chunks(self.fan_out as usize).enumerate() {
                let is_final_merge = run_count <= self.fan_out as usize && group_index == 0;
                let merged_id = if is_final_merge {
                    log::debug!("routing final merge to output '{}'", self.output_id);
                    self.output_id.clone()
                } else {
                    let (id, mut stream) = self.factory.create_temp_output(self.io_buffer_elements)?;
                    stream.finalize()?;
                    id
                };

                self.merge_group(group, &merged_id)?;
                next_runs.push(merged_id);
                consumed.extend_from_slice(group);
            }

            for run_id in &consumed {
                if *run_id != self.output_id {
                    self.factory.delete(run_id)?;
                }
            }
            current_runs = next_runs;
        }

        if current_runs.len() == 1 {
            if current_runs[0] != self.output_id {
                log::info!("renaming surviving run '{}' to '{}'", current_runs[0], self.output_id);
                self.factory.make_permanent(&current_runs[0], &self.output_id)?;
            }
        } else if current_runs.is_empty() && !self.factory.exists(&self.output_id) {
            // phase 1 produced runs, so this should be unreachable
            let mut empty = self.factory.create_output(&self.output_id, self.io_buffer_elements)?;
            empty.finalize()?;
        } else if !current_runs.is_empty() {
            return Err(SortError::Internal(format!(
                "{} runs left after merge passes",
                current_runs.len()
            )));
        }

        return Ok(());
    }

    /// Drains the input into memory-budget-sized sorted runs.
    fn create_initial_runs(&mut self) -> Result<Vec<StorageId>> {
        log::info!(
            "creating initial runs from '{}' (budget: {})",
            self.input_id,
            ByteSize(self.memory_limit_bytes)
        );

        let mut input = self.factory.create_input(&self.input_id, self.io_buffer_elements)?;
        if input.is_empty_original_storage() {
            log::info!("input storage is empty, no runs created");
            return Ok(Vec::new());
        }

        let mut run_ids = Vec::new();
        while !input.is_exhausted() {
            let mut run_buffer: Vec<T> = Vec::new();
            let mut run_mem_usage: u64 = 0;

            while !input.is_exhausted() {
                let footprint = self.serializer.memory_footprint(input.value()?)?;
                if run_buffer.is_empty() {
                    if footprint > self.memory_limit_bytes {
                        return Err(SortError::MemoryLimit {
                            footprint,
                            limit: self.memory_limit_bytes,
                        });
                    }
                } else if run_mem_usage + footprint > self.memory_limit_bytes {
                    break;
                }
                run_mem_usage += footprint;
                run_buffer.push(input.take_value()?);
                input.advance()?;
            }

            if !run_buffer.is_empty() {
                if self.ascending {
                    run_buffer.sort_unstable();
                } else {
                    run_buffer.sort_unstable_by(|a, b| b.cmp(a));
                }

                let (run_id, mut run_stream) = self.factory.create_temp_output(self.io_buffer_elements)?;
                for value in run_buffer {
                    run_stream.write(value)?;
                }
                run_stream.finalize()?;
                log::debug!(
                    "run '{}' created with {} records, estimated {} in memory",
                    run_id,
                    run_stream.elements_written(),
                    ByteSize(run_mem_usage)
                );
                run_ids.push(run_id);
            }
        }

        return Ok(run_ids);
    }

    /// Merges one group of sorted runs into `output_id`.
    fn merge_group(&mut self, group: &[StorageId], output_id: &StorageId) -> Result<()> {
        log::debug!("merging {} runs into '{}'", group.len(), output_id);

        let mut streams = Vec::with_capacity(group.len());
        let mut heap = BinaryHeap::with_capacity(group.len());
        for run_id in group {
            let mut stream = self.factory.create_input(run_id, self.io_buffer_elements)?;
            if !stream.is_exhausted() {
                heap.push(MergeSource {
                    value: stream.take_value()?,
                    source: streams.len(),
                    ascending: self.ascending,
                });
            }
            streams.push(stream);
        }

        let mut output = self.factory.create_output(output_id, self.io_buffer_elements)?;
        while let Some(MergeSource { value, source, .. }) = heap.pop() {
            output.write(value)?;
            let stream = &mut streams[source];
            stream.advance()?;
            if !stream.is_exhausted() {
                heap.push(MergeSource {
                    value: stream.take_value()?,
                    source,
                    ascending: self.ascending,
                });
            }
        }
        output.finalize()?;

        log::debug!("merged group into '{}' with {} records", output_id, output.elements_written());
        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::*;
    use crate::memory::InMemoryStreamFactory;
    use crate::serial::{PodSerializer, RecordSerializer};

    fn populate<T: Clone + 'static>(factory: &mut InMemoryStreamFactory<T>, id: &str, values: &[T]) {
        let mut output = factory.create_output(&id.to_string(), 16).unwrap();
        for value in values {
            output.write(value.clone()).unwrap();
        }
        output.finalize().unwrap();
    }

    fn read_back(factory: &InMemoryStreamFactory<i32>, id: &str) -> Vec<i32> {
        factory.storage_data(&id.to_string()).unwrap()
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_small_array_sort(#[case] ascending: bool) {
        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &[5, 2, 8, 1, 9, 3]);

        // budget of three records forces multiple runs
        let sorter = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .with_memory_limit(3 * std::mem::size_of::<i32>() as u64)
            .with_fan_out(2)
            .with_io_buffer_elements(10)
            .ascending(ascending)
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        let mut expected = vec![5, 2, 8, 1, 9, 3];
        if ascending {
            expected.sort();
        } else {
            expected.sort_by(|a, b| b.cmp(a));
        }
        assert_eq!(read_back(&factory, "output"), expected);
        assert_eq!(factory.declared_size(&"output".to_string()), Some(6));
    }

    #[test]
    fn test_large_shuffled_input_multiple_passes() {
        let mut input: Vec<i32> = (0..500).collect();
        input.shuffle(&mut rand::thread_rng());

        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &input);

        // small budget and fan-out force several merge passes
        let sorter = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .with_memory_limit(200)
            .with_fan_out(2)
            .with_io_buffer_elements(8)
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        let expected: Vec<i32> = (0..500).collect();
        assert_eq!(read_back(&factory, "output"), expected);
    }

    #[test]
    fn test_duplicates_preserved() {
        let input = vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5];
        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &input);

        let sorter = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .with_memory_limit(4 * std::mem::size_of::<i32>() as u64)
            .with_fan_out(3)
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        let mut expected = input;
        expected.sort();
        assert_eq!(read_back(&factory, "output"), expected);
    }

    #[test]
    fn test_empty_input_creates_empty_output() {
        let mut factory = InMemoryStreamFactory::new();
        populate::<i32>(&mut factory, "input", &[]);

        let sorter = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        assert!(factory.exists(&"output".to_string()));
        assert_eq!(factory.declared_size(&"output".to_string()), Some(0));
        assert_eq!(read_back(&factory, "output"), Vec::<i32>::new());
    }

    #[test]
    fn test_single_run_renamed_to_output() {
        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &[2, 1]);

        let sorter = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        assert_eq!(read_back(&factory, "output"), vec![1, 2]);
        // the lone run was renamed, not copied: no temp storages remain
        assert!(!factory.exists(&"mem_run_0".to_string()));
    }

    #[test]
    fn test_no_temp_storages_after_sort() {
        let mut input: Vec<i32> = (0..100).collect();
        input.shuffle(&mut rand::thread_rng());

        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &input);

        let sorter = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .with_memory_limit(64)
            .with_fan_out(2)
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        for counter in 0..200 {
            assert!(!factory.exists(&format!("mem_run_{}", counter)));
        }
    }

    #[test]
    fn test_fan_out_below_two_rejected() {
        let mut factory: InMemoryStreamFactory<i32> = InMemoryStreamFactory::new();

        let result = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .with_fan_out(1)
            .build(&mut factory, "input", "output");
        assert!(matches!(result, Err(SortError::InvalidArgument(_))));
    }

    #[test]
    fn test_zero_io_buffer_rejected() {
        let mut factory: InMemoryStreamFactory<i32> = InMemoryStreamFactory::new();

        let result = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .with_io_buffer_elements(0)
            .build(&mut factory, "input", "output");
        assert!(matches!(result, Err(SortError::InvalidArgument(_))));
    }

    #[test]
    fn test_output_under_temp_namespace_rejected() {
        let mut factory: InMemoryStreamFactory<i32> = InMemoryStreamFactory::new();

        let result = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .build(&mut factory, "input", "mem_run_extra");
        assert!(matches!(result, Err(SortError::OutputInTempDir { .. })));
        drop(result);

        // the namespace ID itself is not "under" the namespace
        let result = KWayMergeSorterBuilder::<i32, PodSerializer<i32>>::new()
            .build(&mut factory, "input", "mem_run_");
        assert!(result.is_ok());
    }

    #[test]
    fn test_budget_smaller_than_one_record() {
        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &["0123456789".to_string()]);

        let sorter = KWayMergeSorterBuilder::<String, RecordSerializer<String>>::new()
            .with_memory_limit(4)
            .build(&mut factory, "input", "output")
            .unwrap();
        let result = sorter.sort();
        assert!(matches!(result, Err(SortError::MemoryLimit { .. })));
        // no partially sorted output left behind
        assert!(!factory.exists(&"output".to_string()));
    }

    #[test]
    fn test_run_footprints_stay_within_budget() {
        let payloads: Vec<String> = (0..40)
            .map(|index| format!("payload-{:04}", index))
            .collect();
        let mut shuffled = payloads.clone();
        shuffled.shuffle(&mut rand::thread_rng());

        let mut factory = InMemoryStreamFactory::new();
        populate(&mut factory, "input", &shuffled);

        let budget = 200u64;
        let serializer = RecordSerializer::<String>::default();
        let mut sorter = KWayMergeSorterBuilder::<String, RecordSerializer<String>>::new()
            .with_memory_limit(budget)
            .with_fan_out(4)
            .build(&mut factory, "input", "output")
            .unwrap();
        let run_ids = sorter.create_initial_runs().unwrap();
        drop(sorter);

        assert!(run_ids.len() > 1);
        for run_id in &run_ids {
            let records = factory.storage_data(run_id).unwrap();
            let mut run_footprint = 0;
            for record in &records {
                run_footprint += serializer.memory_footprint(record).unwrap();
            }
            assert!(
                run_footprint <= budget,
                "run '{}' footprint {} exceeds budget {}",
                run_id,
                run_footprint,
                budget
            );
            // each run is itself sorted
            let mut sorted = records.clone();
            sorted.sort();
            assert_eq!(records, sorted);
        }
    }

    #[test]
    fn test_string_sort() {
        let input = vec!["zebra", "apple", "banana", "cherry", "date"];
        let mut factory = InMemoryStreamFactory::new();
        populate(
            &mut factory,
            "input",
            &input.iter().map(|word| word.to_string()).collect::<Vec<_>>(),
        );

        let sorter = KWayMergeSorterBuilder::<String, RecordSerializer<String>>::new()
            .with_memory_limit(1024)
            .with_fan_out(2)
            .with_io_buffer_elements(10)
            .build(&mut factory, "input", "output")
            .unwrap();
        sorter.sort().unwrap();

        assert_eq!(
            factory.storage_data(&"output".to_string()).unwrap(),
            vec!["apple", "banana", "cherry", "date", "zebra"]
        );
    }
}
