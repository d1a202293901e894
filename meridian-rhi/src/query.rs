//! Fixed-size query pools, the slot allocator shared by every context, and the `Query` object.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use ash::vk;
use parking_lot::Mutex;
use crate::backend::{CommandRecorder, GpuBackend};
use crate::config::QueryPoolSizes;
use crate::error::{verify, RhiError};

/// Returned by [`QueryManager::allocate`] when the pool is exhausted.
pub const INVALID_INDEX: u32 = u32::MAX;

/// End stamp of a query whose end has not been submitted yet. No timeline value reaches it.
pub(crate) const PENDING_FENCE_VALUE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    Occlusion,
    BinaryOcclusion,
    Timestamp,
    PipelineStatistics,
    /// Two timestamps bracketing a span of commands.
    Duration,
}

impl QueryType {
    pub const ALL: [QueryType; 5] = [
        QueryType::Occlusion,
        QueryType::BinaryOcclusion,
        QueryType::Timestamp,
        QueryType::PipelineStatistics,
        QueryType::Duration,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Bit used in the command buffer's active-query masks.
    #[inline]
    pub(crate) fn bit(self) -> u32 {
        1 << self.index()
    }

    /// Native slots one query of this type occupies.
    pub fn slots_per_query(self) -> u32 {
        match self {
            QueryType::Duration => 2,
            _ => 1,
        }
    }

    pub fn native_type(self) -> vk::QueryType {
        match self {
            QueryType::Occlusion | QueryType::BinaryOcclusion => vk::QueryType::OCCLUSION,
            QueryType::Timestamp | QueryType::Duration => vk::QueryType::TIMESTAMP,
            QueryType::PipelineStatistics => vk::QueryType::PIPELINE_STATISTICS,
        }
    }

    /// Whether the query is bracketed by begin/end rather than written as timestamps.
    pub(crate) fn is_scoped(self) -> bool {
        matches!(
            self,
            QueryType::Occlusion | QueryType::BinaryOcclusion | QueryType::PipelineStatistics
        )
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryType::Occlusion => "occlusion",
            QueryType::BinaryOcclusion => "binary occlusion",
            QueryType::Timestamp => "timestamp",
            QueryType::PipelineStatistics => "pipeline statistics",
            QueryType::Duration => "duration",
        };
        f.write_str(name)
    }
}

/// Where slots that went through a reset rejoin the free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StaleQueryReuse {
    /// Reset slots are handed out only after every slot that was already free.
    #[default]
    Front,
    /// Reset slots are handed out first.
    Back,
}

/// Statistics collected by pipeline statistics queries, in native bit order.
pub const PIPELINE_STATISTICS_FLAGS: vk::QueryPipelineStatisticFlags = vk::QueryPipelineStatisticFlags::from_raw(
    vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES.as_raw()
        | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES.as_raw()
        | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES.as_raw()
        | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS.as_raw(),
);
const PIPELINE_STATISTICS_COUNT: u32 = 7;

struct QueryPoolInfo {
    ty: QueryType,
    pool: vk::QueryPool,
    capacity: u32,
    free: VecDeque<u32>,
    stale: Vec<u32>,
    max_allocated: u32,
}

impl QueryPoolInfo {
    fn outstanding(&self) -> u32 {
        self.capacity - (self.free.len() + self.stale.len()) as u32
    }
}

/// Device-wide allocator of query slots, one native pool per query type.
///
/// Slots come off the back of the free list. A discarded slot goes to the stale list and
/// only returns to the free list after [`QueryManager::reset_stale_queries`] recorded a reset for it.
pub struct QueryManager {
    backend: Arc<dyn GpuBackend>,
    reuse: StaleQueryReuse,
    pools: Mutex<Vec<QueryPoolInfo>>,
    counter_frequency: u64,
}

impl QueryManager {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        sizes: &QueryPoolSizes,
        reuse: StaleQueryReuse,
    ) -> Result<Self, RhiError> {
        let mut recorder = backend.begin_commands("query pool reset")?;
        let mut pools = Vec::with_capacity(QueryType::ALL.len());

        for ty in QueryType::ALL {
            let capacity = sizes.get(ty) * ty.slots_per_query();
            let pool = if capacity > 0 {
                let pool = backend.create_query_pool(ty, capacity)?;
                // Every query must be reset once before its first use.
                recorder.reset_query_pool(pool, 0, capacity);
                log::debug!("Created {} query pool with {} slots", ty, capacity);
                pool
            } else {
                vk::QueryPool::null()
            };

            pools.push(QueryPoolInfo {
                ty,
                pool,
                capacity,
                free: (0..capacity).collect(),
                stale: Vec::new(),
                max_allocated: 0,
            });
        }

        recorder.end()?;
        backend.submit(vec![recorder])?;

        let period = backend.timestamp_period();
        let counter_frequency = if period > 0.0 { (1.0e9 / period as f64) as u64 } else { 0 };

        Ok(Self {
            backend,
            reuse,
            pools: Mutex::new(pools),
            counter_frequency,
        })
    }

    /// Take a free slot, or [`INVALID_INDEX`] when none is left.
    pub fn allocate(&self, ty: QueryType) -> u32 {
        let mut pools = self.pools.lock();
        let info = &mut pools[ty.index()];
        match info.free.pop_back() {
            Some(index) => {
                let allocated = info.capacity - info.free.len() as u32;
                info.max_allocated = info.max_allocated.max(allocated);
                index
            }
            None => INVALID_INDEX,
        }
    }

    /// Return a slot. It becomes allocatable again after the next reset.
    pub fn discard(&self, ty: QueryType, index: u32) {
        let mut pools = self.pools.lock();
        let info = &mut pools[ty.index()];
        verify!(index < info.capacity, "Query index {} is out of range", index);
        verify!(
            !info.free.contains(&index),
            "Query index {} is already in the free list",
            index
        );
        verify!(
            !info.stale.contains(&index),
            "Query index {} is already in the stale list",
            index
        );
        info.stale.push(index);
    }

    /// Record a reset for every stale slot and move it to the free list. Returns the number of resets.
    pub fn reset_stale_queries(&self, recorder: &mut dyn CommandRecorder) -> u32 {
        let mut pools = self.pools.lock();
        let mut reset = 0;
        for info in pools.iter_mut() {
            for index in info.stale.drain(..) {
                recorder.reset_query_pool(info.pool, index, 1);
                match self.reuse {
                    StaleQueryReuse::Front => info.free.push_front(index),
                    StaleQueryReuse::Back => info.free.push_back(index),
                }
                reset += 1;
            }
        }
        reset
    }

    pub fn has_stale_queries(&self) -> bool {
        self.pools.lock().iter().any(|info| !info.stale.is_empty())
    }

    pub fn pool(&self, ty: QueryType) -> vk::QueryPool {
        self.pools.lock()[ty.index()].pool
    }

    pub fn capacity(&self, ty: QueryType) -> u32 {
        self.pools.lock()[ty.index()].capacity
    }

    /// Snapshot of the free list, front to back.
    pub fn free_slots(&self, ty: QueryType) -> Vec<u32> {
        self.pools.lock()[ty.index()].free.iter().copied().collect()
    }

    pub fn stale_slots(&self, ty: QueryType) -> Vec<u32> {
        self.pools.lock()[ty.index()].stale.clone()
    }

    pub fn reuse_order(&self) -> StaleQueryReuse {
        self.reuse
    }

    /// Timestamp ticks per second.
    pub fn counter_frequency(&self) -> u64 {
        self.counter_frequency
    }

    pub(crate) fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }
}

impl Drop for QueryManager {
    fn drop(&mut self) {
        let pools = self.pools.get_mut();
        let mut usage = String::from("Query manager peak usage:");
        for info in pools.iter() {
            match info.outstanding() {
                0 => {}
                1 => log::error!("One {} query has not been returned to the query manager", info.ty),
                n => log::error!("{} {} queries have not been returned to the query manager", n, info.ty),
            }
            usage.push_str(&format!("\n{:<22}: {:>4}/{:>4}", info.ty.to_string(), info.max_allocated, info.capacity));
            if info.pool != vk::QueryPool::null() {
                self.backend.destroy_query_pool(info.pool);
            }
        }
        log::info!("{}", usage);
    }
}

/// Pipeline statistics in the order the pool collects them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub input_vertices: u64,
    pub input_primitives: u64,
    pub vs_invocations: u64,
    pub clipping_invocations: u64,
    pub clipping_primitives: u64,
    pub ps_invocations: u64,
    pub cs_invocations: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryData {
    Occlusion { num_samples: u64 },
    BinaryOcclusion { any_sample_passed: bool },
    Timestamp { counter: u64, frequency: u64 },
    PipelineStatistics(PipelineStatistics),
    Duration { duration: u64, frequency: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueryPhase {
    Inactive,
    Querying,
    Ended,
}

/// A query object. Native slots are taken lazily when the query begins (or ends, for timestamps)
/// and returned to the manager when it is re-begun or dropped.
pub struct Query {
    name: String,
    ty: QueryType,
    manager: Arc<QueryManager>,
    slots: [u32; 2],
    pub(crate) phase: QueryPhase,
    /// Timeline value of the submission that carries the end.
    pub(crate) end_fence_value: Arc<AtomicU64>,
}

impl Query {
    pub(crate) fn new(name: impl Into<String>, ty: QueryType, manager: Arc<QueryManager>) -> Self {
        Self {
            name: name.into(),
            ty,
            manager,
            slots: [INVALID_INDEX; 2],
            phase: QueryPhase::Inactive,
            end_fence_value: Arc::new(AtomicU64::new(PENDING_FENCE_VALUE)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query_type(&self) -> QueryType {
        self.ty
    }

    /// Native slot `n` (the start or end timestamp for durations).
    pub fn slot(&self, n: usize) -> u32 {
        self.slots[n]
    }

    fn discard_slots(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot != INVALID_INDEX {
                self.manager.discard(self.ty, *slot);
                *slot = INVALID_INDEX;
            }
        }
    }

    /// Take fresh slots, returning any held ones first.
    pub(crate) fn allocate_slots(&mut self) -> bool {
        self.discard_slots();
        for n in 0..self.ty.slots_per_query() as usize {
            let slot = self.manager.allocate(self.ty);
            if slot == INVALID_INDEX {
                log::error!(
                    "Failed to allocate a {} query for '{}'. Increase the query pool size in the device config.",
                    self.ty,
                    self.name
                );
                self.discard_slots();
                return false;
            }
            self.slots[n] = slot;
        }
        true
    }

    pub(crate) fn has_slots(&self) -> bool {
        (0..self.ty.slots_per_query() as usize).all(|n| self.slots[n] != INVALID_INDEX)
    }

    pub(crate) fn pool(&self) -> vk::QueryPool {
        self.manager.pool(self.ty)
    }

    /// Results of the last completed begin/end pair, or `None` while the GPU has not produced them.
    pub fn data(&self) -> Option<QueryData> {
        if self.phase != QueryPhase::Ended || !self.has_slots() {
            return None;
        }
        let backend = self.manager.backend();
        if backend.completed_fence_value() < self.end_fence_value.load(Ordering::Acquire) {
            return None;
        }

        let pool = self.pool();
        let frequency = self.manager.counter_frequency();
        let data = match self.ty {
            QueryType::Occlusion => {
                let values = backend.query_results(pool, self.slots[0], 1, 1)?;
                QueryData::Occlusion { num_samples: values[0] }
            }
            QueryType::BinaryOcclusion => {
                let values = backend.query_results(pool, self.slots[0], 1, 1)?;
                QueryData::BinaryOcclusion { any_sample_passed: values[0] != 0 }
            }
            QueryType::Timestamp => {
                let values = backend.query_results(pool, self.slots[0], 1, 1)?;
                QueryData::Timestamp { counter: values[0], frequency }
            }
            QueryType::PipelineStatistics => {
                let v = backend.query_results(pool, self.slots[0], 1, PIPELINE_STATISTICS_COUNT)?;
                QueryData::PipelineStatistics(PipelineStatistics {
                    input_vertices: v[0],
                    input_primitives: v[1],
                    vs_invocations: v[2],
                    clipping_invocations: v[3],
                    clipping_primitives: v[4],
                    ps_invocations: v[5],
                    cs_invocations: v[6],
                })
            }
            QueryType::Duration => {
                let start = backend.query_results(pool, self.slots[0], 1, 1)?;
                let end = backend.query_results(pool, self.slots[1], 1, 1)?;
                QueryData::Duration {
                    duration: end[0].saturating_sub(start[0]),
                    frequency,
                }
            }
        };
        Some(data)
    }

    /// Forget the last results and return the slots.
    pub fn invalidate(&mut self) {
        self.discard_slots();
        self.phase = QueryPhase::Inactive;
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.discard_slots();
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("slots", &self.slots)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::capture::{CaptureBackend, Command};

    fn manager(count: u32, reuse: StaleQueryReuse) -> (CaptureBackend, QueryManager) {
        let capture = CaptureBackend::new();
        let manager = QueryManager::new(Arc::new(capture.clone()), &QueryPoolSizes::uniform(count), reuse).unwrap();
        (capture, manager)
    }

    fn reset(capture: &CaptureBackend, manager: &QueryManager) -> u32 {
        let mut recorder = capture.begin_commands("reset").unwrap();
        let n = manager.reset_stale_queries(recorder.as_mut());
        recorder.end().unwrap();
        capture.submit(vec![recorder]).unwrap();
        n
    }

    #[test]
    fn pools_are_reset_at_creation() {
        let (capture, manager) = manager(4, StaleQueryReuse::Front);
        let resets: Vec<_> = capture
            .submitted_commands()
            .into_iter()
            .filter(|c| matches!(c, Command::ResetQueryPool { .. }))
            .collect();
        assert_eq!(resets.len(), QueryType::ALL.len());
        assert_eq!(manager.capacity(QueryType::Duration), 8);
        assert!(resets.contains(&Command::ResetQueryPool {
            pool: manager.pool(QueryType::Duration),
            first: 0,
            count: 8,
        }));
    }

    #[test]
    fn exhausted_pool_returns_invalid_index() {
        let (capture, manager) = manager(3, StaleQueryReuse::Front);
        let slots: Vec<_> = (0..3).map(|_| manager.allocate(QueryType::Occlusion)).collect();
        assert!(slots.iter().all(|&s| s != INVALID_INDEX));
        assert_eq!(manager.allocate(QueryType::Occlusion), INVALID_INDEX);

        manager.discard(QueryType::Occlusion, slots[1]);
        // Not reusable until reset.
        assert_eq!(manager.allocate(QueryType::Occlusion), INVALID_INDEX);

        assert_eq!(reset(&capture, &manager), 1);
        assert_eq!(manager.allocate(QueryType::Occlusion), slots[1]);
        assert_eq!(manager.allocate(QueryType::Occlusion), INVALID_INDEX);

        for slot in [slots[0], slots[1], slots[2]] {
            manager.discard(QueryType::Occlusion, slot);
        }
    }

    #[test]
    fn reset_slots_join_the_front_by_default() {
        let (capture, manager) = manager(4, StaleQueryReuse::Front);
        let a = manager.allocate(QueryType::Timestamp);
        manager.discard(QueryType::Timestamp, a);
        reset(&capture, &manager);

        // The untouched slots are handed out before the recycled one.
        let order: Vec<_> = (0..4).map(|_| manager.allocate(QueryType::Timestamp)).collect();
        assert_eq!(order.last(), Some(&a));
        for slot in order {
            manager.discard(QueryType::Timestamp, slot);
        }
    }

    #[test]
    fn back_reuse_hands_out_reset_slots_first() {
        let (capture, manager) = manager(4, StaleQueryReuse::Back);
        let a = manager.allocate(QueryType::Timestamp);
        manager.discard(QueryType::Timestamp, a);
        reset(&capture, &manager);

        assert_eq!(manager.allocate(QueryType::Timestamp), a);
        manager.discard(QueryType::Timestamp, a);
    }

    #[test]
    fn reset_records_one_command_per_slot() {
        let (capture, manager) = manager(4, StaleQueryReuse::Front);
        let a = manager.allocate(QueryType::Occlusion);
        let b = manager.allocate(QueryType::PipelineStatistics);
        manager.discard(QueryType::Occlusion, a);
        manager.discard(QueryType::PipelineStatistics, b);
        assert!(manager.has_stale_queries());

        let before = capture.submitted_commands().len();
        assert_eq!(reset(&capture, &manager), 2);
        let commands = capture.submitted_commands();
        assert_eq!(commands.len() - before, 2);
        assert!(commands.contains(&Command::ResetQueryPool {
            pool: manager.pool(QueryType::Occlusion),
            first: a,
            count: 1,
        }));
        assert!(!manager.has_stale_queries());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already in the stale list")]
    fn double_discard_is_caught() {
        let (_capture, manager) = manager(2, StaleQueryReuse::Front);
        let a = manager.allocate(QueryType::Occlusion);
        manager.discard(QueryType::Occlusion, a);
        manager.discard(QueryType::Occlusion, a);
    }

    #[test]
    fn duration_query_takes_two_slots() {
        let (_capture, manager) = manager(2, StaleQueryReuse::Front);
        let manager = Arc::new(manager);
        let mut query = Query::new("frame", QueryType::Duration, manager.clone());
        assert!(query.allocate_slots());
        assert_ne!(query.slot(0), query.slot(1));
        assert_eq!(manager.free_slots(QueryType::Duration).len(), 2);
        drop(query);
        assert_eq!(manager.stale_slots(QueryType::Duration).len(), 2);
    }

    #[test]
    fn failed_allocation_leaves_no_slots_behind() {
        let (_capture, manager) = manager(1, StaleQueryReuse::Front);
        let manager = Arc::new(manager);
        // One free slot is not enough for a duration query.
        let hog = manager.allocate(QueryType::Duration);
        let mut query = Query::new("late", QueryType::Duration, manager.clone());
        assert!(!query.allocate_slots());
        assert!(!query.has_slots());
        assert_eq!(manager.stale_slots(QueryType::Duration).len(), 1);
        manager.discard(QueryType::Duration, hog);
    }
}
