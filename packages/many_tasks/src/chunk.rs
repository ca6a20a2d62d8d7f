use std::ops::Range;

use crate::PoolError;

/// A contiguous, ordered group of tasks that is dispatched to a worker as one unit.
///
/// Chunking amortizes the fixed per-dispatch cost of handing work to a worker. Larger chunks
/// mean fewer dispatch events but coarser load balancing: once a worker has claimed a chunk,
/// no other worker can help with it.
#[derive(Debug)]
pub struct Chunk<T> {
    index: usize,
    first_task: usize,
    tasks: Vec<T>,
}

impl<T> Chunk<T> {
    /// The position of this chunk in the sequence of chunks.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The sequence indexes of the tasks in this chunk.
    #[must_use]
    pub fn task_indexes(&self) -> Range<usize> {
        // Cannot overflow: the indexes were assigned from a Vec of this length.
        self.first_task..self.first_task.wrapping_add(self.tasks.len())
    }

    /// The number of tasks in this chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the chunk contains no tasks. Chunks produced by [`chunk_tasks()`] never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The tasks in this chunk, in submission order.
    #[must_use]
    pub fn tasks(&self) -> &[T] {
        &self.tasks
    }

    /// Iterates over the tasks together with their sequence index in the batch.
    pub fn indexed_tasks(&self) -> impl Iterator<Item = (usize, &T)> {
        self.task_indexes().zip(&self.tasks)
    }

    /// Consumes the chunk, returning its tasks.
    #[must_use]
    pub fn into_tasks(self) -> Vec<T> {
        self.tasks
    }
}

/// Calculates how many chunks `task_count` tasks split into, rounding up.
///
/// # Errors
///
/// Returns [`PoolError::InvalidConfiguration`] if `chunk_size` is zero.
pub fn chunk_count(task_count: usize, chunk_size: usize) -> Result<usize, PoolError> {
    if chunk_size == 0 {
        return Err(PoolError::invalid_configuration(
            "chunk size must be at least 1",
        ));
    }

    Ok(task_count.div_ceil(chunk_size))
}

/// Splits an ordered sequence of tasks into chunks of `chunk_size` tasks.
///
/// Every chunk has exactly `chunk_size` tasks except possibly the last one, which holds the
/// remainder. Concatenating the chunks in order reproduces the input exactly. An empty input
/// produces no chunks.
///
/// # Errors
///
/// Returns [`PoolError::InvalidConfiguration`] if `chunk_size` is zero.
///
/// # Example
///
/// ```
/// use many_tasks::chunk_tasks;
///
/// let chunks = chunk_tasks((0..7).collect(), 3).unwrap();
///
/// assert_eq!(chunks.len(), 3);
/// assert_eq!(chunks[2].tasks(), &[6]);
/// assert_eq!(chunks[1].task_indexes(), 3..6);
/// ```
pub fn chunk_tasks<T>(tasks: Vec<T>, chunk_size: usize) -> Result<Vec<Chunk<T>>, PoolError> {
    let count = chunk_count(tasks.len(), chunk_size)?;

    let mut remaining = tasks.into_iter();
    let mut chunks = Vec::with_capacity(count);
    let mut first_task = 0_usize;

    for index in 0..count {
        let tasks = remaining.by_ref().take(chunk_size).collect::<Vec<_>>();
        let len = tasks.len();

        chunks.push(Chunk {
            index,
            first_task,
            tasks,
        });

        // Cannot overflow: bounded by the length of the input Vec.
        first_task = first_task.wrapping_add(len);
    }

    Ok(chunks)
}
