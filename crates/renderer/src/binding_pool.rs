//! The resource binding pool.
//!
//! [`BindingPool`] serves [`BindingSet`]s out of one descriptor pool sized
//! to the demand of every live set plus outstanding reservations, times the
//! swap image count.
//!
//! # Capacity
//!
//! Demand is tracked per [`PoolResource`]: one counter for the number of
//! sets and one per [`BindingKind`]. Each counter has `allocated`, `live`
//! and `reserved` units. A layout fits when for every counter it uses
//! `live + max(reserved, need) <= allocated`.
//!
//! When a layout does not fit, the pool answers [`Allocation::GrowNeeded`]
//! and the whole descriptor pool is recreated larger, with every live set
//! rebuilt against it. Growth is bounded by `max_recreate_attempts`.
//!
//! # Reclamation
//!
//! Sets are reference counted by their external owners. A set whose count
//! dropped to zero is destroyed by the sweep at the start of the next
//! [`BindingPool::get_binding_set`], and only once the last frame that bound
//! it has retired. Replaced descriptor pools and surplus uniform duplicates
//! wait in a retirement queue until the newest frame submitted before their
//! replacement retires.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, trace, warn};

use vkframe_rhi::backend::GpuBackend;
use vkframe_rhi::binding::{BindingKind, BindingLayout};
use vkframe_rhi::buffer::GpuBuffer;
use vkframe_rhi::{RhiError, RhiResult};

use crate::arena::Arena;
use crate::binding_set::{BindingSet, BindingSetId, BindingWrite, validate_writes};
use crate::config::BindingPoolConfig;
use crate::frame_manager::FrameClock;

/// A countable pool resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolResource {
    /// Descriptor sets.
    Sets,
    /// Descriptors of one kind.
    Descriptors(BindingKind),
}

/// Per-set demand of `layout`: one set plus its descriptors per kind.
pub fn layout_demand(layout: &BindingLayout) -> Vec<(PoolResource, u32)> {
    std::iter::once((PoolResource::Sets, 1))
        .chain(
            layout
                .demand()
                .into_iter()
                .map(|(kind, count)| (PoolResource::Descriptors(kind), count)),
        )
        .collect()
}

/// Units of one resource, counted per set (not per swap image). Counters
/// saturate at `u32::MAX`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapacityCounter {
    pub allocated: u32,
    pub live: u32,
    pub reserved: u32,
}

impl CapacityCounter {
    #[inline]
    pub fn fits(&self, need: u32) -> bool {
        self.live.saturating_add(self.reserved.max(need)) <= self.allocated
    }

    #[inline]
    pub fn demand(&self) -> u32 {
        self.live.saturating_add(self.reserved)
    }
}

/// Capacity targets per resource.
pub type CapacityTarget = BTreeMap<PoolResource, u32>;

/// Capacity bookkeeping of a [`BindingPool`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolCapacity {
    counters: BTreeMap<PoolResource, CapacityCounter>,
}

impl PoolCapacity {
    pub fn counter(&self, resource: PoolResource) -> CapacityCounter {
        self.counters.get(&resource).copied().unwrap_or_default()
    }

    #[inline]
    pub fn allocated(&self, resource: PoolResource) -> u32 {
        self.counter(resource).allocated
    }

    /// Whether one more set with `demand` fits without recreation.
    pub fn fits(&self, demand: &[(PoolResource, u32)]) -> bool {
        demand
            .iter()
            .all(|&(resource, need)| self.counter(resource).fits(need))
    }

    /// Counts a new live set, consuming reservations first.
    pub(crate) fn consume(&mut self, demand: &[(PoolResource, u32)]) {
        for &(resource, need) in demand {
            let counter = self.counters.entry(resource).or_default();
            counter.live = counter.live.saturating_add(need);
            counter.reserved -= counter.reserved.min(need);
        }
    }

    pub(crate) fn release(&mut self, demand: &[(PoolResource, u32)]) {
        for &(resource, need) in demand {
            let counter = self.counters.entry(resource).or_default();
            counter.live = counter.live.saturating_sub(need);
        }
    }

    pub(crate) fn reserve(&mut self, demand: &[(PoolResource, u32)], count: u32) {
        for &(resource, need) in demand {
            let counter = self.counters.entry(resource).or_default();
            counter.reserved = counter.reserved.saturating_add(need.saturating_mul(count));
        }
    }

    /// Exactly the current demand, never below what is allocated.
    pub(crate) fn current_target(&self) -> CapacityTarget {
        self.counters
            .iter()
            .map(|(&resource, counter)| (resource, counter.allocated.max(counter.demand())))
            .collect()
    }

    /// Room for one more set with `demand`, grown by `growth_factor`.
    pub(crate) fn grown_target(
        &self,
        demand: &[(PoolResource, u32)],
        growth_factor: f32,
    ) -> CapacityTarget {
        let mut target = self.current_target();
        for &(resource, need) in demand {
            let counter = self.counter(resource);
            let grown = scale(counter.allocated, growth_factor);
            let value = counter.demand().saturating_add(need).max(grown).max(counter.allocated);
            target.insert(resource, value);
        }
        target
    }

    pub(crate) fn commit(&mut self, target: &CapacityTarget) {
        for (&resource, &value) in target {
            let counter = self.counters.entry(resource).or_default();
            counter.allocated = counter.allocated.max(value);
        }
    }
}

fn scale(value: u32, factor: f32) -> u32 {
    (value as f64 * factor as f64).ceil().min(u32::MAX as f64) as u32
}

/// Grows every non-zero entry of `target` once more.
pub(crate) fn bump(target: &CapacityTarget, growth_factor: f32) -> CapacityTarget {
    target
        .iter()
        .map(|(&resource, &value)| {
            let bumped = if value == 0 {
                0
            } else {
                scale(value, growth_factor).max(value.saturating_add(1))
            };
            (resource, bumped)
        })
        .collect()
}

/// Device-side pool sizes for `target`, scaled by the swap image count.
pub(crate) fn backend_sizes(
    target: &CapacityTarget,
    image_count: u32,
) -> (u32, Vec<(BindingKind, u32)>) {
    let mut max_sets = 0;
    let mut sizes = Vec::new();
    for (&resource, &value) in target {
        let value = value.saturating_mul(image_count);
        match resource {
            PoolResource::Sets => max_sets = value,
            PoolResource::Descriptors(kind) => {
                if value > 0 {
                    sizes.push((kind, value));
                }
            }
        }
    }
    (max_sets, sizes)
}

/// Answer of an allocation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// One descriptor set per swap image.
    Ready(Vec<vk::DescriptorSet>),
    /// The pool must be recreated larger first.
    GrowNeeded,
}

enum Retired<B: GpuBackend> {
    Pool(vk::DescriptorPool),
    Buffers(Vec<GpuBuffer<B>>),
}

struct RetiredEntry<B: GpuBackend> {
    after_frame: u64,
    resource: Retired<B>,
}

/// Serves binding sets; see the module docs.
pub struct BindingPool<B: GpuBackend> {
    backend: Arc<B>,
    config: BindingPoolConfig,
    image_count: u32,
    pool: vk::DescriptorPool,
    capacity: PoolCapacity,
    sets: Arena<BindingSetId, BindingSet<B>>,
    set_layouts: HashMap<BindingLayout, vk::DescriptorSetLayout>,
    retired: VecDeque<RetiredEntry<B>>,
    recreation_count: u64,
}

impl<B: GpuBackend> BindingPool<B> {
    /// Creates an empty pool; the first request allocates. At least one
    /// recreation is always allowed.
    pub fn new(backend: Arc<B>, image_count: u32, config: BindingPoolConfig) -> Self {
        debug!("Binding pool created for {} swap images", image_count);
        let config = BindingPoolConfig {
            max_recreate_attempts: config.max_recreate_attempts.max(1),
            ..config
        };
        Self {
            backend,
            config,
            image_count,
            pool: vk::DescriptorPool::null(),
            capacity: PoolCapacity::default(),
            sets: Arena::new(),
            set_layouts: HashMap::new(),
            retired: VecDeque::new(),
            recreation_count: 0,
        }
    }

    /// The descriptor set layout for `layout`, created on first use.
    pub fn set_layout(&mut self, layout: &BindingLayout) -> RhiResult<vk::DescriptorSetLayout> {
        if let Some(&set_layout) = self.set_layouts.get(layout) {
            return Ok(set_layout);
        }
        let set_layout = self.backend.create_binding_layout(layout.entries())?;
        debug!(
            "Created set layout {:?} with {} bindings",
            set_layout,
            layout.len()
        );
        self.set_layouts.insert(layout.clone(), set_layout);
        Ok(set_layout)
    }

    /// Declares demand for `count` future sets of `layout` and resizes the
    /// pool to fit it.
    pub fn reserve_space(
        &mut self,
        count: u32,
        layout: &BindingLayout,
        clock: &FrameClock,
    ) -> RhiResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.set_layout(layout)?;
        self.capacity.reserve(&layout_demand(layout), count);
        debug!("Reserved space for {} sets", count);
        let target = self.capacity.current_target();
        self.recreate(target, clock)
    }

    /// Creates a set for `layout` filled with `writes`, held once by the
    /// caller.
    ///
    /// # Errors
    ///
    /// [`RhiError::LayoutMismatch`] for writes not matching `layout`,
    /// [`RhiError::PoolExhausted`] when growth keeps failing.
    pub fn get_binding_set(
        &mut self,
        layout: &BindingLayout,
        writes: Vec<BindingWrite>,
        clock: &FrameClock,
    ) -> RhiResult<BindingSetId> {
        validate_writes(layout, &writes)?;
        self.collect_garbage(clock)?;

        let set_layout = self.set_layout(layout)?;
        let mut record =
            BindingSet::new(&self.backend, layout, set_layout, writes, self.image_count)?;

        let mut recreations = 0;
        loop {
            match self.try_allocate(&record)? {
                Allocation::Ready(sets) => {
                    record.descriptor_sets = sets;
                    break;
                }
                Allocation::GrowNeeded => {
                    if recreations == self.config.max_recreate_attempts {
                        return Err(RhiError::PoolExhausted {
                            attempts: recreations,
                        });
                    }
                    recreations += 1;
                    let target = self
                        .capacity
                        .grown_target(&record.demand, self.config.growth_factor);
                    self.recreate(target, clock)?;
                }
            }
        }

        self.capacity.consume(&record.demand);
        let id = self.sets.insert(record);
        trace!("Binding set {:?} allocated", id);
        Ok(id)
    }

    /// The explicit pre-check, then the device allocation.
    fn try_allocate(&self, record: &BindingSet<B>) -> RhiResult<Allocation> {
        if self.pool == vk::DescriptorPool::null() || !self.capacity.fits(&record.demand) {
            return Ok(Allocation::GrowNeeded);
        }
        match self.allocate_sets(self.pool, record) {
            Ok(sets) => Ok(Allocation::Ready(sets)),
            Err(RhiError::OutOfPoolMemory) => {
                warn!("Descriptor pool out of memory despite capacity check; growing");
                Ok(Allocation::GrowNeeded)
            }
            Err(err) => Err(err),
        }
    }

    fn allocate_sets(
        &self,
        pool: vk::DescriptorPool,
        record: &BindingSet<B>,
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let mut sets = Vec::with_capacity(self.image_count as usize);
        for image in 0..self.image_count {
            match self.backend.allocate_descriptor_set(pool, record.set_layout()) {
                Ok(set) => {
                    self.backend
                        .update_descriptor_set(set, &record.descriptor_writes(image));
                    sets.push(set);
                }
                Err(err) => {
                    if !sets.is_empty()
                        && let Err(free_err) = self.backend.free_descriptor_sets(pool, &sets)
                    {
                        warn!("Failed to return partial allocation: {}", free_err);
                    }
                    return Err(err);
                }
            }
        }
        Ok(sets)
    }

    /// Replaces the descriptor pool with one sized for `target` and
    /// rebuilds every live set, bumping the target while the device still
    /// runs out of room.
    fn recreate(&mut self, target: CapacityTarget, clock: &FrameClock) -> RhiResult<()> {
        let attempts = self.config.max_recreate_attempts;
        let mut target = target;
        for attempt in 1..=attempts {
            match self.build_pool(&target) {
                Ok((pool, rebuilt)) => {
                    self.install(pool, rebuilt, &target, clock);
                    return Ok(());
                }
                Err(RhiError::OutOfPoolMemory) => {
                    warn!(
                        "Rebuilding binding sets ran out of room (attempt {}/{}); growing further",
                        attempt, attempts
                    );
                    target = bump(&target, self.config.growth_factor);
                }
                Err(err) => return Err(err),
            }
        }
        Err(RhiError::PoolExhausted { attempts })
    }

    #[allow(clippy::type_complexity)]
    fn build_pool(
        &self,
        target: &CapacityTarget,
    ) -> RhiResult<(vk::DescriptorPool, Vec<(BindingSetId, Vec<vk::DescriptorSet>)>)> {
        let (max_sets, sizes) = backend_sizes(target, self.image_count);
        if max_sets == 0 {
            return Ok((vk::DescriptorPool::null(), Vec::new()));
        }
        let pool = self.backend.create_descriptor_pool(max_sets, &sizes)?;
        let mut rebuilt = Vec::with_capacity(self.sets.len());
        for (id, record) in self.sets.iter() {
            match self.allocate_sets(pool, record) {
                Ok(sets) => rebuilt.push((id, sets)),
                Err(err) => {
                    self.backend.destroy_descriptor_pool(pool);
                    return Err(err);
                }
            }
        }
        Ok((pool, rebuilt))
    }

    fn install(
        &mut self,
        pool: vk::DescriptorPool,
        rebuilt: Vec<(BindingSetId, Vec<vk::DescriptorSet>)>,
        target: &CapacityTarget,
        clock: &FrameClock,
    ) {
        let old = std::mem::replace(&mut self.pool, pool);
        for (id, sets) in rebuilt {
            if let Some(record) = self.sets.get_mut(id) {
                record.descriptor_sets = sets;
            }
        }
        if old != vk::DescriptorPool::null() {
            self.retire(Retired::Pool(old), clock);
        }
        self.capacity.commit(target);
        self.recreation_count += 1;
        info!(
            "Binding pool recreated: {} sets x {} images, {} live",
            self.capacity.allocated(PoolResource::Sets),
            self.image_count,
            self.sets.len()
        );
    }

    fn retire(&mut self, resource: Retired<B>, clock: &FrameClock) {
        self.retired.push_back(RetiredEntry {
            after_frame: clock.submitted(),
            resource,
        });
    }

    /// Destroys retired pools and buffers whose frames have retired.
    pub fn release_retired(&mut self, completed: u64) {
        while let Some(entry) = self.retired.front() {
            if entry.after_frame > completed {
                break;
            }
            if let Some(entry) = self.retired.pop_front() {
                self.destroy_retired(entry.resource);
            }
        }
    }

    fn destroy_retired(&self, resource: Retired<B>) {
        match resource {
            Retired::Pool(pool) => {
                self.backend.destroy_descriptor_pool(pool);
                debug!("Destroyed retired descriptor pool {:?}", pool);
            }
            Retired::Buffers(buffers) => drop(buffers),
        }
    }

    /// The sweep: destroys released sets no in-flight frame still binds.
    pub fn collect_garbage(&mut self, clock: &FrameClock) -> RhiResult<usize> {
        self.release_retired(clock.completed());

        let reclaimable: Vec<BindingSetId> = self
            .sets
            .iter()
            .filter(|(_, record)| record.is_reclaimable(clock.completed()))
            .map(|(id, _)| id)
            .collect();

        // A set whose free fails stays live for the next sweep.
        let mut reclaimed = 0;
        let mut first_error = None;
        for &id in &reclaimable {
            let Some(record) = self.sets.get(id) else {
                continue;
            };
            if self.pool != vk::DescriptorPool::null()
                && !record.descriptor_sets.is_empty()
                && let Err(err) = self
                    .backend
                    .free_descriptor_sets(self.pool, &record.descriptor_sets)
            {
                warn!("Freeing binding set {:?} failed: {}", id, err);
                first_error.get_or_insert(err);
                continue;
            }
            if let Some(record) = self.sets.remove(id) {
                self.capacity.release(&record.demand);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!("Reclaimed {} binding sets", reclaimed);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reclaimed),
        }
    }

    /// Matches uniform duplicates and descriptor sets to a new swap image
    /// count.
    pub fn set_image_count(&mut self, image_count: u32, clock: &FrameClock) -> RhiResult<()> {
        if image_count == self.image_count {
            return Ok(());
        }
        info!(
            "Binding pool image count {} -> {}",
            self.image_count, image_count
        );

        let mut surplus = Vec::new();
        for (_, record) in self.sets.iter_mut() {
            surplus.extend(record.resize_duplicates(&self.backend, image_count)?);
        }
        if !surplus.is_empty() {
            self.retire(Retired::Buffers(surplus), clock);
        }

        self.image_count = image_count;
        let target = self.capacity.current_target();
        self.recreate(target, clock)
    }

    pub fn retain(&mut self, id: BindingSetId) -> RhiResult<()> {
        let record = self.record_mut(id)?;
        record.external_refs += 1;
        Ok(())
    }

    /// Drops one external reference; the sweep reclaims the set later.
    pub fn release(&mut self, id: BindingSetId) -> RhiResult<()> {
        let record = self.record_mut(id)?;
        if record.external_refs == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "binding set {id:?} was already released"
            )));
        }
        record.external_refs -= 1;
        Ok(())
    }

    pub(crate) fn mark_used(&mut self, id: BindingSetId, frame: u64) -> RhiResult<()> {
        let record = self.record_mut(id)?;
        record.last_used = Some(record.last_used.map_or(frame, |last| last.max(frame)));
        Ok(())
    }

    pub fn write_uniform(
        &self,
        id: BindingSetId,
        binding: u32,
        image: u32,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> RhiResult<()> {
        self.record(id)?.write_uniform(binding, image, offset, bytes)
    }

    pub fn read_uniform(
        &self,
        id: BindingSetId,
        binding: u32,
        image: u32,
        offset: vk::DeviceSize,
        len: usize,
    ) -> RhiResult<Vec<u8>> {
        self.record(id)?.read_uniform(binding, image, offset, len)
    }

    pub fn get(&self, id: BindingSetId) -> Option<&BindingSet<B>> {
        self.sets.get(id)
    }

    fn record(&self, id: BindingSetId) -> RhiResult<&BindingSet<B>> {
        self.sets
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("stale binding set {id:?}")))
    }

    fn record_mut(&mut self, id: BindingSetId) -> RhiResult<&mut BindingSet<B>> {
        self.sets
            .get_mut(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("stale binding set {id:?}")))
    }

    /// Sets still registered, including released ones awaiting the sweep.
    #[inline]
    pub fn live_sets(&self) -> usize {
        self.sets.len()
    }

    #[inline]
    pub fn capacity(&self) -> &PoolCapacity {
        &self.capacity
    }

    #[inline]
    pub fn recreation_count(&self) -> u64 {
        self.recreation_count
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    /// Retired pools and buffer batches not yet destroyed.
    #[inline]
    pub fn pending_retirements(&self) -> usize {
        self.retired.len()
    }
}

impl<B: GpuBackend> Drop for BindingPool<B> {
    /// The owner drains the device first.
    fn drop(&mut self) {
        while let Some(entry) = self.retired.pop_front() {
            self.destroy_retired(entry.resource);
        }
        // Buffers go with the records; sets go with the pool.
        self.sets = Arena::new();
        if self.pool != vk::DescriptorPool::null() {
            self.backend.destroy_descriptor_pool(self.pool);
        }
        for (_, set_layout) in self.set_layouts.drain() {
            self.backend.destroy_binding_layout(set_layout);
        }
        debug!("Binding pool destroyed");
    }
}
