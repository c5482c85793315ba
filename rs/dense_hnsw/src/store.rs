use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::{
    distance::Distance,
    error::IndexError,
    graph::{NodeId, Space},
    scalar::{B1x8, Decoded, Scalar, ScalarKind},
};

/// Largest number of slots a store can address.
pub const MAX_SLOTS: usize = NodeId::MAX as usize;

/// Smallest capacity an automatic growth step produces.
pub const MIN_GROWTH: usize = 64;

/// Fixed-size vector slots of one encoding, laid out back to back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slab<E> {
    #[serde(rename = "d")]
    dimensions: usize,

    #[serde(rename = "v")]
    data: Vec<E>,
}

impl<E: Scalar> Slab<E> {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of `E` values per slot.
    pub fn words(&self) -> usize {
        E::words(self.dimensions)
    }

    /// Number of written slots.
    pub fn slots(&self) -> usize {
        self.data.len() / self.words().max(1)
    }

    pub fn vector(&self, id: NodeId) -> Option<&[E]> {
        let words = self.words();
        let start = id as usize * words;
        self.data.get(start..start + words)
    }

    /// Encodes `src` into slot `id`. Writing one past the last slot appends.
    pub fn write(&mut self, id: NodeId, src: &Decoded) {
        let words = self.words();
        let mut encoded = E::encode(src, self.dimensions);
        encoded.resize(words, E::default());

        let start = id as usize * words;
        if start >= self.data.len() {
            self.data.resize(start, E::default());
            self.data.extend_from_slice(&encoded);
        } else {
            self.data[start..start + words].copy_from_slice(&encoded);
        }
    }

    pub fn read(&self, id: NodeId) -> Option<Decoded> {
        self.vector(id).map(E::decode)
    }

    /// Makes room for `slots` slots, failing instead of aborting when the
    /// allocation cannot be satisfied.
    pub fn reserve(&mut self, slots: usize) -> Result<(), IndexError> {
        let needed = slots.saturating_mul(self.words());
        self.data
            .try_reserve_exact(needed.saturating_sub(self.data.len()))
            .map_err(|_| IndexError::CapacityExceeded { capacity: slots })
    }

    pub fn memory_usage(&self) -> usize {
        self.data.capacity() * size_of::<E>()
    }

    /// Checks that the payload splits evenly into slots.
    fn validate(&self, dimensions: usize) -> Result<(), IndexError> {
        if self.dimensions != dimensions {
            return Err(IndexError::corrupt(format!(
                "vector slab has {} dimensions, options say {dimensions}",
                self.dimensions
            )));
        }
        if self.data.len() % self.words().max(1) != 0 {
            return Err(IndexError::corrupt(format!(
                "vector slab length {} is not a multiple of {}",
                self.data.len(),
                self.words()
            )));
        }
        Ok(())
    }
}

/// The vector slab in the encoding fixed at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Vectors {
    F64(Slab<f64>),
    F32(Slab<f32>),
    F16(Slab<f16>),
    BF16(Slab<bf16>),
    I8(Slab<i8>),
    B1(Slab<B1x8>),
}

/// Runs `$body` with `$slab` bound to the typed slab inside a [`Vectors`].
macro_rules! with_slab {
    ($vectors:expr, $slab:ident => $body:expr) => {
        match $vectors {
            $crate::store::Vectors::F64($slab) => $body,
            $crate::store::Vectors::F32($slab) => $body,
            $crate::store::Vectors::F16($slab) => $body,
            $crate::store::Vectors::BF16($slab) => $body,
            $crate::store::Vectors::I8($slab) => $body,
            $crate::store::Vectors::B1($slab) => $body,
        }
    };
}
pub(crate) use with_slab;

impl Vectors {
    pub fn new(kind: ScalarKind, dimensions: usize) -> Self {
        match kind {
            ScalarKind::F64 => Vectors::F64(Slab::new(dimensions)),
            ScalarKind::F32 => Vectors::F32(Slab::new(dimensions)),
            ScalarKind::F16 => Vectors::F16(Slab::new(dimensions)),
            ScalarKind::BF16 => Vectors::BF16(Slab::new(dimensions)),
            ScalarKind::I8 => Vectors::I8(Slab::new(dimensions)),
            ScalarKind::B1 => Vectors::B1(Slab::new(dimensions)),
        }
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            Vectors::F64(_) => ScalarKind::F64,
            Vectors::F32(_) => ScalarKind::F32,
            Vectors::F16(_) => ScalarKind::F16,
            Vectors::BF16(_) => ScalarKind::BF16,
            Vectors::I8(_) => ScalarKind::I8,
            Vectors::B1(_) => ScalarKind::B1,
        }
    }

    pub fn dimensions(&self) -> usize {
        with_slab!(self, slab => slab.dimensions())
    }

    pub fn slots(&self) -> usize {
        with_slab!(self, slab => slab.slots())
    }

    pub fn write(&mut self, id: NodeId, src: &Decoded) {
        with_slab!(self, slab => slab.write(id, src))
    }

    pub fn read(&self, id: NodeId) -> Option<Decoded> {
        with_slab!(self, slab => slab.read(id))
    }

    pub fn reserve(&mut self, slots: usize) -> Result<(), IndexError> {
        with_slab!(self, slab => slab.reserve(slots))
    }

    pub fn memory_usage(&self) -> usize {
        with_slab!(self, slab => slab.memory_usage())
    }
}

/// Slot arena of encoded vectors with a free list of reclaimed ids.
#[derive(Clone, Debug)]
pub struct VectorStore {
    capacity: usize,
    /// Reclaimed ids, reused last-in first-out.
    free: Vec<NodeId>,
    /// Per-slot flag mirroring membership in `free`.
    vacant: Vec<bool>,
    vectors: Vectors,
}

impl VectorStore {
    pub fn new(kind: ScalarKind, dimensions: usize) -> Self {
        Self {
            capacity: 0,
            free: Vec::new(),
            vacant: Vec::new(),
            vectors: Vectors::new(kind, dimensions),
        }
    }

    /// Rebuilds a store from persisted parts.
    pub fn from_parts(
        kind: ScalarKind,
        dimensions: usize,
        capacity: usize,
        free: Vec<NodeId>,
        vectors: Vectors,
    ) -> Result<Self, IndexError> {
        if vectors.kind() != kind {
            return Err(IndexError::corrupt(format!(
                "vector slab holds {}, options say {}",
                vectors.kind().name(),
                kind.name()
            )));
        }
        with_slab!(&vectors, slab => slab.validate(dimensions))?;

        let slots = vectors.slots();
        if capacity < slots || capacity > MAX_SLOTS {
            return Err(IndexError::corrupt(format!(
                "capacity {capacity} does not cover {slots} slots"
            )));
        }
        let mut vacant = vec![false; slots];
        for &id in &free {
            match vacant.get_mut(id as usize) {
                Some(flag) if !*flag => *flag = true,
                _ => return Err(IndexError::corrupt(format!("invalid free slot {id}"))),
            }
        }

        let mut store = Self {
            capacity: 0,
            free,
            vacant,
            vectors,
        };
        store.reserve(capacity).map_err(|err| {
            IndexError::corrupt(format!("cannot reserve {capacity} slots: {err}"))
        })?;
        Ok(store)
    }

    pub fn kind(&self) -> ScalarKind {
        self.vectors.kind()
    }

    pub fn dimensions(&self) -> usize {
        self.vectors.dimensions()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> &[NodeId] {
        &self.free
    }

    pub fn vectors(&self) -> &Vectors {
        &self.vectors
    }

    /// Whether slot `id` was written once and released since.
    pub fn is_vacant(&self, id: NodeId) -> bool {
        self.vacant.get(id as usize).copied().unwrap_or(false)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.vectors.slots() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the next allocation needs more capacity.
    pub fn is_full(&self) -> bool {
        self.free.is_empty() && self.vectors.slots() >= self.capacity
    }

    /// Capacity the next automatic growth step moves to.
    pub fn grown_capacity(&self) -> usize {
        (self.capacity * 2).clamp(MIN_GROWTH, MAX_SLOTS)
    }

    /// Picks the slot for a new vector, reusing released ids first.
    ///
    /// The slot stays unoccupied until [`VectorStore::store`] writes it.
    pub fn allocate(&mut self) -> Result<NodeId, IndexError> {
        if let Some(id) = self.free.pop() {
            self.vacant[id as usize] = false;
            return Ok(id);
        }
        let slots = self.vectors.slots();
        if slots >= self.capacity {
            return Err(IndexError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(slots as NodeId)
    }

    /// Encodes `vector` into slot `id`.
    pub fn store(&mut self, id: NodeId, vector: &Decoded) -> Result<(), IndexError> {
        let dimensions = self.dimensions();
        let expected = match vector {
            Decoded::Bits(_) => dimensions.div_ceil(8),
            _ => dimensions,
        };
        if vector.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        if id as usize > self.vectors.slots() || id as usize >= self.capacity {
            return Err(IndexError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.vectors.write(id, vector);
        if id as usize == self.vacant.len() {
            self.vacant.push(false);
        }
        Ok(())
    }

    /// Decodes the vector in slot `id`.
    pub fn fetch(&self, id: NodeId) -> Option<Decoded> {
        if self.is_vacant(id) {
            return None;
        }
        self.vectors.read(id)
    }

    /// Returns slot `id` to the free list.
    pub fn release(&mut self, id: NodeId) {
        if let Some(flag) = self.vacant.get_mut(id as usize).filter(|flag| !**flag) {
            *flag = true;
            self.free.push(id);
        }
    }

    /// Pre-allocates room for `capacity` slots. Smaller requests are no-ops.
    pub fn reserve(&mut self, capacity: usize) -> Result<(), IndexError> {
        if capacity > MAX_SLOTS {
            return Err(IndexError::CapacityExceeded {
                capacity: MAX_SLOTS,
            });
        }
        if capacity > self.capacity {
            self.vectors.reserve(capacity)?;
            self.capacity = capacity;
        }
        Ok(())
    }

    pub fn memory_usage(&self) -> usize {
        self.vectors.memory_usage()
            + self.free.capacity() * size_of::<NodeId>()
            + self.vacant.capacity()
    }
}

/// Distances from a query in slab encoding to the slab's vectors.
pub(crate) struct SlabSpace<'a, E> {
    pub slab: &'a Slab<E>,
    pub distance: Distance<'a, E>,
    pub query: &'a [E],
}

impl<E: Scalar> Space for SlabSpace<'_, E> {
    #[inline]
    fn distance_to(&self, id: NodeId) -> f32 {
        match self.slab.vector(id) {
            Some(v) => self.distance.compute(self.query, v),
            None => f32::MAX,
        }
    }

    #[inline]
    fn distance_between(&self, a: NodeId, b: NodeId) -> f32 {
        match (self.slab.vector(a), self.slab.vector(b)) {
            (Some(a), Some(b)) => self.distance.compute(a, b),
            _ => f32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{Metric, MetricKind};

    #[test]
    fn test_slab_write_read() {
        let mut slab: Slab<f32> = Slab::new(3);
        slab.write(0, &Decoded::Floats(vec![1.0, 2.0, 3.0]));
        slab.write(1, &Decoded::Int8(vec![127, 0, -127]));
        assert_eq!(slab.slots(), 2);
        assert_eq!(slab.vector(1), Some(&[1.0f32, 0.0, -1.0][..]));

        // 覆盖写入
        slab.write(0, &Decoded::Floats(vec![4.0, 5.0, 6.0]));
        assert_eq!(slab.read(0), Some(Decoded::Floats(vec![4.0, 5.0, 6.0])));
        assert_eq!(slab.vector(2), None);

        let mut bits: Slab<B1x8> = Slab::new(10);
        bits.write(0, &Decoded::Floats(vec![1.0; 10]));
        assert_eq!(bits.words(), 2);
        assert_eq!(bits.vector(0), Some(&[B1x8(0xFF), B1x8(0xC0)][..]));
    }

    #[test]
    fn test_allocate_and_release() {
        let mut store = VectorStore::new(ScalarKind::F32, 2);
        assert!(store.is_full());
        assert!(matches!(
            store.allocate(),
            Err(IndexError::CapacityExceeded { capacity: 0 })
        ));

        store.reserve(2).unwrap();
        assert_eq!(store.capacity(), 2);
        for i in 0..2 {
            let id = store.allocate().unwrap();
            assert_eq!(id, i);
            store.store(id, &Decoded::Floats(vec![i as f64; 2])).unwrap();
        }
        assert!(store.is_full());
        assert_eq!(store.len(), 2);

        store.release(0);
        store.release(0);
        store.release(5);
        assert_eq!(store.free(), &[0]);
        assert!(store.is_vacant(0));
        assert!(!store.is_vacant(1));
        assert_eq!(store.fetch(0), None);
        assert!(!store.is_full());

        let id = store.allocate().unwrap();
        assert_eq!(id, 0);
        assert!(!store.is_vacant(0));
        store.store(id, &Decoded::Floats(vec![9.0, 9.0])).unwrap();
        assert_eq!(store.fetch(0), Some(Decoded::Floats(vec![9.0, 9.0])));
        assert_eq!(store.fetch(1), Some(Decoded::Floats(vec![1.0, 1.0])));
    }

    #[test]
    fn test_store_dimension_mismatch() {
        let mut store = VectorStore::new(ScalarKind::I8, 4);
        store.reserve(1).unwrap();
        let id = store.allocate().unwrap();
        assert!(matches!(
            store.store(id, &Decoded::Floats(vec![1.0; 3])),
            Err(IndexError::DimensionMismatch {
                expected: 4,
                got: 3
            })
        ));
        store.store(id, &Decoded::Bits(vec![0xF0])).unwrap();
        assert_eq!(store.fetch(id), Some(Decoded::Int8(vec![127, 127, 127, 127])));
    }

    #[test]
    fn test_reserve_and_growth() {
        let mut store = VectorStore::new(ScalarKind::F16, 8);
        assert_eq!(store.grown_capacity(), MIN_GROWTH);
        store.reserve(100).unwrap();
        store.reserve(10).unwrap();
        assert_eq!(store.capacity(), 100);
        assert_eq!(store.grown_capacity(), 200);
        assert!(store.memory_usage() >= 100 * 8 * 2);
        assert!(store.reserve(MAX_SLOTS + 1).is_err());
    }

    #[test]
    fn test_reserve_unsatisfiable() {
        // 4 TiB of f32 slots cannot be allocated
        let mut store = VectorStore::new(ScalarKind::F32, 256);
        store.reserve(8).unwrap();
        assert!(matches!(
            store.reserve(MAX_SLOTS - 1),
            Err(IndexError::CapacityExceeded { .. })
        ));
        assert_eq!(store.capacity(), 8);

        let err = VectorStore::from_parts(
            ScalarKind::F32,
            256,
            MAX_SLOTS - 1,
            vec![],
            Vectors::new(ScalarKind::F32, 256),
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::CorruptState { .. }));
    }

    #[test]
    fn test_from_parts() {
        let mut store = VectorStore::new(ScalarKind::F32, 2);
        store.reserve(4).unwrap();
        for _ in 0..3 {
            let id = store.allocate().unwrap();
            store.store(id, &Decoded::Floats(vec![1.0, 2.0])).unwrap();
        }
        store.release(1);

        let restored = VectorStore::from_parts(
            ScalarKind::F32,
            2,
            store.capacity(),
            store.free().to_vec(),
            store.vectors().clone(),
        )
        .unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.capacity(), 4);
        assert!(restored.is_vacant(1));
        assert_eq!(restored.fetch(1), None);

        let vectors = store.vectors().clone();
        assert!(VectorStore::from_parts(ScalarKind::F64, 2, 4, vec![], vectors.clone()).is_err());
        assert!(VectorStore::from_parts(ScalarKind::F32, 3, 4, vec![], vectors.clone()).is_err());
        assert!(VectorStore::from_parts(ScalarKind::F32, 2, 2, vec![], vectors.clone()).is_err());
        assert!(VectorStore::from_parts(ScalarKind::F32, 2, 4, vec![3], vectors.clone()).is_err());
        assert!(VectorStore::from_parts(ScalarKind::F32, 2, 4, vec![1, 1], vectors).is_err());
    }

    #[test]
    fn test_slab_space() {
        let mut slab: Slab<f32> = Slab::new(2);
        slab.write(0, &Decoded::Floats(vec![0.0, 0.0]));
        slab.write(1, &Decoded::Floats(vec![3.0, 4.0]));
        let metric = Metric::builtin(MetricKind::L2sq).unwrap();
        let query = [0.0f32, 4.0];
        let space = SlabSpace {
            slab: &slab,
            distance: metric.resolve::<f32>().unwrap(),
            query: &query,
        };
        assert_eq!(space.distance_to(0), 16.0);
        assert_eq!(space.distance_to(1), 9.0);
        assert_eq!(space.distance_between(0, 1), 25.0);
        assert_eq!(space.distance_to(7), f32::MAX);
    }
}
