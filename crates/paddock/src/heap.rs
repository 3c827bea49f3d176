//! Per-thread arena of reference-counted values.
//!
//! Every entry carries two counts: `external` for references held outside the heap graph (stack
//! slots, globals, the VM's own temporaries) and `heap` for references held by other heap entries.
//! An entry stays live while either count is positive and is reclaimed as soon as both reach zero,
//! releasing the heap references it held on its children in turn.
//!
//! There is no cycle collection: two entries referring to each other keep both heap counts
//! positive forever and leak until the whole heap is dropped with its thread.

use std::{collections::BTreeMap, fmt, mem};

use indexmap::{IndexMap, IndexSet};

use crate::{
    intern::{ClassId, FuncId},
    resource::{ResourceError, ResourceTracker},
    value::{MapKey, Value},
};

/// Index of a heap entry. Only meaningful for the heap that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HeapId(u32);

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type ValueMap = IndexMap<MapKey, Value, ahash::RandomState>;
pub(crate) type ValueSet = IndexSet<MapKey, ahash::RandomState>;

#[derive(Debug)]
pub(crate) enum HeapData {
    List(Vec<Value>),
    Map(ValueMap),
    /// Members in insertion order. Members are hashable immediates, so a set holds no references.
    Set(ValueSet),
    /// Numeric vector with float components.
    Vector(Vec<f64>),
    Instance { class: ClassId, attrs: Vec<Value> },
    BoundMethod { func: FuncId, receiver: Value },
    /// Cursor over a list, map (its keys) or string.
    Iterator { source: Value, position: usize },
}

impl HeapData {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Vector(_) => "vector",
            Self::Instance { .. } => "instance",
            Self::BoundMethod { .. } => "func",
            Self::Iterator { .. } => "iterator",
        }
    }

    /// Rough footprint in bytes, reported to the resource tracker.
    fn estimate_size(&self) -> usize {
        let value = mem::size_of::<Value>();
        mem::size_of::<Self>()
            + match self {
                Self::List(items) => items.capacity() * value,
                Self::Map(map) => map.capacity() * (value + mem::size_of::<MapKey>()),
                Self::Set(set) => set.capacity() * mem::size_of::<MapKey>(),
                Self::Vector(components) => components.capacity() * mem::size_of::<f64>(),
                Self::Instance { attrs, .. } => attrs.capacity() * value,
                Self::BoundMethod { .. } | Self::Iterator { .. } => 0,
            }
    }

    fn for_each_ref(&self, mut f: impl FnMut(HeapId)) {
        let mut visit = |value: &Value| {
            if let Value::Ref(id) = value {
                f(*id);
            }
        };
        match self {
            Self::List(items) | Self::Instance { attrs: items, .. } => items.iter().for_each(&mut visit),
            Self::Map(map) => map.values().for_each(&mut visit),
            Self::Set(_) | Self::Vector(_) => {}
            Self::BoundMethod { receiver, .. } => visit(receiver),
            Self::Iterator { source, .. } => visit(source),
        }
    }
}

#[derive(Debug)]
struct HeapEntry {
    external: usize,
    heap: usize,
    data: HeapData,
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    /// Live objects by type name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
}

#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<HeapId>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates an entry with both counts at zero.
    ///
    /// The new entry takes a heap reference on every value it contains. The caller is expected to
    /// store the returned id somewhere counted right away, or hand it to [`drop_temp`](Self::drop_temp).
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        data.for_each_ref(|child| self.add_heap_ref(child));
        let entry = HeapEntry {
            external: 0,
            heap: 0,
            data,
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(u32::try_from(self.entries.len()).expect("Heap::allocate: heap id space exhausted"));
            self.entries.push(Some(entry));
            id
        };
        Ok(id)
    }

    fn entry(&self, id: HeapId) -> &HeapEntry {
        self.entries
            .get(id.index())
            .expect("Heap::entry: slot missing")
            .as_ref()
            .expect("Heap::entry: object already freed")
    }

    fn entry_mut(&mut self, id: HeapId) -> &mut HeapEntry {
        self.entries
            .get_mut(id.index())
            .expect("Heap::entry_mut: slot missing")
            .as_mut()
            .expect("Heap::entry_mut: object already freed")
    }

    /// # Panics
    /// Panics if the entry was already freed.
    pub fn add_external(&mut self, id: HeapId) {
        self.entry_mut(id).external += 1;
    }

    /// Drops one external reference, reclaiming the entry if nothing else holds it.
    ///
    /// # Panics
    /// Panics if the entry was already freed or the external count would go negative.
    pub fn release_external(&mut self, id: HeapId) {
        let entry = self.entry_mut(id);
        entry.external = entry
            .external
            .checked_sub(1)
            .expect("Heap::release_external: external count underflow");
        if entry.external == 0 && entry.heap == 0 {
            self.reclaim(id);
        }
    }

    pub fn add_heap_ref(&mut self, id: HeapId) {
        self.entry_mut(id).heap += 1;
    }

    /// # Panics
    /// Panics if the entry was already freed or the heap count would go negative.
    pub fn release_heap_ref(&mut self, id: HeapId) {
        let entry = self.entry_mut(id);
        entry.heap = entry.heap.checked_sub(1).expect("Heap::release_heap_ref: heap count underflow");
        if entry.external == 0 && entry.heap == 0 {
            self.reclaim(id);
        }
    }

    /// Counts an external reference if `value` is a heap reference.
    #[inline]
    pub fn retain(&mut self, value: &Value) {
        if let Value::Ref(id) = value {
            self.add_external(*id);
        }
    }

    /// Releases an external reference if `value` is a heap reference.
    #[inline]
    pub fn release(&mut self, value: &Value) {
        if let Value::Ref(id) = value {
            self.release_external(*id);
        }
    }

    /// Reclaims a value that was allocated but never stored anywhere counted.
    pub fn drop_temp(&mut self, value: &Value) {
        if let Value::Ref(id) = *value
            && self.is_live(id)
        {
            let entry = self.entry(id);
            if entry.external == 0 && entry.heap == 0 {
                self.reclaim(id);
            }
        }
    }

    /// `(external, heap)` counts, or `None` once reclaimed.
    pub fn refcounts(&self, id: HeapId) -> Option<(usize, usize)> {
        self.entries
            .get(id.index())?
            .as_ref()
            .map(|entry| (entry.external, entry.heap))
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        matches!(self.entries.get(id.index()), Some(Some(_)))
    }

    /// # Panics
    /// Panics if the entry was already freed.
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entry(id).data
    }

    /// Mutable access for updates that do not change which values the entry holds.
    ///
    /// Use the container setters below for anything that stores or replaces a value.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entry_mut(id).data
    }

    pub fn list_push(&mut self, list: HeapId, value: Value) {
        if let Value::Ref(child) = value {
            self.add_heap_ref(child);
        }
        match self.get_mut(list) {
            HeapData::List(items) => items.push(value),
            other => panic!("Heap::list_push: {} is not a list", other.type_name()),
        }
    }

    /// Replaces element `index` of a list. Returns `false` if the index is out of range.
    pub fn set_list_item(&mut self, list: HeapId, index: usize, value: Value) -> bool {
        let in_range = matches!(self.get(list), HeapData::List(items) if index < items.len());
        if !in_range {
            return false;
        }
        let value = self.hold_child(value);
        let old = match self.get_mut(list) {
            HeapData::List(items) => mem::replace(&mut items[index], value),
            _ => unreachable!("checked above"),
        };
        self.release_child(&old);
        true
    }

    pub fn map_insert(&mut self, map: HeapId, key: MapKey, value: Value) {
        let value = self.hold_child(value);
        let old = match self.get_mut(map) {
            HeapData::Map(entries) => entries.insert(key, value),
            other => panic!("Heap::map_insert: {} is not a map", other.type_name()),
        };
        if let Some(old) = old {
            self.release_child(&old);
        }
    }

    /// Replaces variable attribute `index` of an instance. Returns `false` if out of range.
    pub fn set_instance_attr(&mut self, instance: HeapId, index: usize, value: Value) -> bool {
        let in_range = matches!(self.get(instance), HeapData::Instance { attrs, .. } if index < attrs.len());
        if !in_range {
            return false;
        }
        let value = self.hold_child(value);
        let old = match self.get_mut(instance) {
            HeapData::Instance { attrs, .. } => mem::replace(&mut attrs[index], value),
            _ => unreachable!("checked above"),
        };
        self.release_child(&old);
        true
    }

    fn hold_child(&mut self, value: Value) -> Value {
        if let Value::Ref(child) = value {
            self.add_heap_ref(child);
        }
        value
    }

    fn release_child(&mut self, value: &Value) {
        if let Value::Ref(child) = value {
            self.release_heap_ref(*child);
        }
    }

    /// Frees `id` and everything that only it kept alive.
    fn reclaim(&mut self, id: HeapId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(entry) = self.entries.get_mut(id.index()).and_then(Option::take) else {
                continue;
            };
            self.free_list.push(id);
            self.tracker.on_free(|| entry.data.estimate_size());
            let mut children = Vec::new();
            entry.data.for_each_ref(|child| children.push(child));
            for child in children {
                let child_entry = self.entry_mut(child);
                child_entry.heap = child_entry
                    .heap
                    .checked_sub(1)
                    .expect("Heap::reclaim: heap count underflow");
                if child_entry.heap == 0 && child_entry.external == 0 {
                    pending.push(child);
                }
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        for entry in self.entries.iter().flatten() {
            *objects_by_type.entry(entry.data.type_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects: self.entries.len() - self.free_list.len(),
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_type,
        }
    }
}
