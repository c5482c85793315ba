use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    codec,
    distance::{Metric, MetricKind, hardware_acceleration},
    error::IndexError,
    graph::{Graph, NodeId},
    keys::KeyMap,
    scalar::{Decoded, Scalar, ScalarKind},
    store::{Slab, SlabSpace, VectorStore, with_slab},
};

/// Index configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Dimensionality of vectors in the index. Default is 256.
    pub dimensions: usize,

    /// Distance metric to use for similarity calculations. Default is L2sq.
    pub metric: MetricKind,

    /// Scalar encoding vectors are stored in. Default is f32.
    pub quantization: ScalarKind,

    /// Maximum number of connections per node in each layer above 0. Default is 16.
    pub connectivity: usize,

    /// Expansion factor during index construction. Default is 128.
    pub expansion_add: usize,

    /// Number of candidates to consider during search. Default is 64.
    pub expansion_search: usize,

    /// Whether one key may own several vectors. Default is false.
    pub multi: bool,

    /// Whether a full index grows on insertion instead of failing. Default is true.
    pub auto_grow: bool,

    /// Seed fixing the level generator. Default is a random seed.
    pub seed: Option<u64>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            dimensions: 256,
            metric: MetricKind::L2sq,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
            auto_grow: true,
            seed: None,
        }
    }
}

impl IndexOptions {
    /// Builds options from the native integer codes of metric and scalar kinds.
    pub fn from_raw(
        dimensions: usize,
        metric: i32,
        quantization: i32,
        connectivity: usize,
        expansion_add: usize,
        expansion_search: usize,
        multi: bool,
    ) -> Result<Self, IndexError> {
        let options = Self {
            dimensions,
            metric: MetricKind::try_from(metric)?,
            quantization: ScalarKind::try_from(quantization)?,
            connectivity,
            expansion_add,
            expansion_search,
            multi,
            ..Default::default()
        };
        options.validate()?;
        Ok(options)
    }

    /// Checks the options for internal consistency.
    pub fn validate(&self) -> Result<(), IndexError> {
        for (name, value) in [
            ("dimensions", self.dimensions),
            ("connectivity", self.connectivity),
            ("expansion_add", self.expansion_add),
            ("expansion_search", self.expansion_search),
        ] {
            if value == 0 {
                return Err(IndexError::invalid_options(format!(
                    "{name} must be positive"
                )));
            }
        }
        if !self.quantization.supports(self.metric) {
            return Err(IndexError::invalid_options(format!(
                "metric {:?} is not supported for scalar kind {}",
                self.metric,
                self.quantization.name()
            )));
        }
        if self.metric == MetricKind::Haversine && self.dimensions != 2 {
            return Err(IndexError::invalid_options(format!(
                "haversine needs 2 dimensions, got {}",
                self.dimensions
            )));
        }
        Ok(())
    }
}

/// Index statistics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of distinct keys in the index.
    pub num_keys: u64,

    /// Number of vectors in the index.
    pub num_vectors: u64,

    /// Number of allocated vector slots.
    pub capacity: u64,

    /// Maximum layer in the index.
    pub max_level: u8,

    /// Number of insert operations performed.
    pub insert_count: u64,

    /// Number of delete operations performed.
    pub delete_count: u64,

    /// Number of search operations performed.
    pub search_count: u64,

    /// Bytes held by vectors, graph and keys.
    pub memory_usage: u64,
}

/// Everything a live index handle owns.
#[derive(Debug)]
pub(crate) struct IndexState {
    pub options: IndexOptions,
    pub metric: Metric,
    pub store: VectorStore,
    pub keys: KeyMap,
    pub graph: Graph,
    pub insert_count: u64,
    pub delete_count: u64,
}

impl IndexState {
    pub fn new(options: IndexOptions, metric: Metric) -> Result<Self, IndexError> {
        options.validate()?;
        if metric.kind() != options.metric {
            return Err(IndexError::invalid_options(format!(
                "metric {:?} does not match options {:?}",
                metric.kind(),
                options.metric
            )));
        }
        Ok(Self {
            store: VectorStore::new(options.quantization, options.dimensions),
            keys: KeyMap::new(options.multi),
            graph: Graph::new(options.connectivity, options.seed),
            options,
            metric,
            insert_count: 0,
            delete_count: 0,
        })
    }

    fn check_dimensions<T: Scalar>(&self, vector: &[T]) -> Result<(), IndexError> {
        let expected = T::words(self.options.dimensions);
        if vector.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Lifts caller input into the conversion currency. Cosine is scale
    /// invariant, so floats bound for i8 are normalized before quantization.
    fn decode_input<T: Scalar>(&self, vector: &[T]) -> Decoded {
        let decoded = T::decode(vector);
        if self.options.quantization == ScalarKind::I8 && self.metric.kind() == MetricKind::Cos {
            decoded.normalized()
        } else {
            decoded
        }
    }

    fn reserve(&mut self, capacity: usize) -> Result<(), IndexError> {
        self.store.reserve(capacity)?;
        self.graph.reserve(capacity)?;
        self.keys.reserve(capacity)
    }

    pub fn add<T: Scalar>(&mut self, key: u64, vector: &[T]) -> Result<(), IndexError> {
        self.check_dimensions(vector)?;
        self.keys.check_insert(key)?;

        if self.store.is_full() {
            if !self.options.auto_grow {
                return Err(IndexError::CapacityExceeded {
                    capacity: self.store.capacity(),
                });
            }
            let from = self.store.capacity();
            let to = self.store.grown_capacity();
            if to <= from {
                return Err(IndexError::CapacityExceeded { capacity: from });
            }
            self.reserve(to)?;
            log::info!(
                action = "grow",
                from = from,
                to = to;
                "index capacity grown",
            );
        }

        let decoded = self.decode_input(vector);
        let id = self.store.allocate()?;
        if let Err(err) = self.store.store(id, &decoded) {
            self.store.release(id);
            return Err(err);
        }

        let level = self.graph.draw_level();
        let ef = self.options.expansion_add;
        let linked = with_slab!(self.store.vectors(), slab => {
            link(slab, &self.metric, &mut self.graph, id, level, ef)
        });
        if let Err(err) = linked {
            self.store.release(id);
            return Err(err);
        }

        self.keys.insert(key, id);
        self.insert_count += 1;
        Ok(())
    }

    pub fn get<T: Scalar>(&self, key: u64, count: usize) -> Result<Vec<Vec<T>>, IndexError> {
        let nodes = self
            .keys
            .nodes(key)
            .ok_or(IndexError::KeyNotFound { key })?;
        nodes
            .iter()
            .take(count)
            .map(|&id| {
                self.store
                    .fetch(id)
                    .map(|v| T::encode(&v, self.options.dimensions))
                    .ok_or_else(|| IndexError::corrupt(format!("key {key} owns empty slot {id}")))
            })
            .collect()
    }

    pub fn remove(&mut self, key: u64) -> Result<usize, IndexError> {
        let nodes = self.keys.remove(key).ok_or(IndexError::KeyNotFound { key })?;
        for &id in &nodes {
            self.graph.remove(id);
            self.store.release(id);
        }
        self.delete_count += 1;
        Ok(nodes.len())
    }

    pub fn search<T: Scalar>(
        &self,
        query: &[T],
        count: usize,
    ) -> Result<Vec<(u64, f32)>, IndexError> {
        self.check_dimensions(query)?;
        if count == 0 || self.keys.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.decode_input(query);
        let wanted = count.min(self.keys.len());
        let live = self.store.len();
        let mut ef = self.options.expansion_search.max(count);
        loop {
            let hits = with_slab!(self.store.vectors(), slab => {
                search_slab(slab, &self.metric, &self.graph, &query, ef)
            })?;
            let results = self.collapse(hits, count);
            if results.len() >= wanted {
                return Ok(results);
            }
            if ef >= live {
                break;
            }
            ef = (ef * 2).min(live);
        }

        // 图被删除操作分割时，退化为穷举搜索
        let hits = with_slab!(self.store.vectors(), slab => {
            scan_slab(slab, &self.metric, self.keys.live_nodes(), &query)
        })?;
        Ok(self.collapse(hits, count))
    }

    /// Maps node hits to keys, keeping the closest hit of each key.
    fn collapse(&self, hits: Vec<(f32, NodeId)>, count: usize) -> Vec<(u64, f32)> {
        let mut seen: HashSet<u64> = HashSet::with_capacity(count);
        hits.into_iter()
            .filter_map(|(dist, id)| {
                let key = self.keys.key_of(id)?;
                seen.insert(key).then_some((key, dist))
            })
            .take(count)
            .collect()
    }

    fn change_metric(&mut self, metric: Metric) -> Result<(), IndexError> {
        let options = IndexOptions {
            metric: metric.kind(),
            ..self.options.clone()
        };
        options.validate()?;
        self.options = options;
        self.metric = metric;
        Ok(())
    }

    fn memory_usage(&self) -> usize {
        self.store.memory_usage() + self.graph.memory_usage() + self.keys.memory_usage()
    }
}

fn link<E: Scalar>(
    slab: &Slab<E>,
    metric: &Metric,
    graph: &mut Graph,
    id: NodeId,
    level: u8,
    ef: usize,
) -> Result<(), IndexError> {
    let distance = metric.resolve::<E>()?;
    let query = slab
        .vector(id)
        .ok_or_else(|| IndexError::corrupt(format!("slot {id} is empty")))?;
    graph.insert(
        id,
        level,
        ef,
        &SlabSpace {
            slab,
            distance,
            query,
        },
    );
    Ok(())
}

fn search_slab<E: Scalar>(
    slab: &Slab<E>,
    metric: &Metric,
    graph: &Graph,
    query: &Decoded,
    ef: usize,
) -> Result<Vec<(f32, NodeId)>, IndexError> {
    let distance = metric.resolve::<E>()?;
    let query = E::encode(query, slab.dimensions());
    Ok(graph.search(
        &SlabSpace {
            slab,
            distance,
            query: &query,
        },
        ef,
    ))
}

fn scan_slab<E: Scalar>(
    slab: &Slab<E>,
    metric: &Metric,
    nodes: impl Iterator<Item = NodeId>,
    query: &Decoded,
) -> Result<Vec<(f32, NodeId)>, IndexError> {
    let distance = metric.resolve::<E>()?;
    let query = E::encode(query, slab.dimensions());
    let mut hits: Vec<(f32, NodeId)> = nodes
        .filter_map(|id| slab.vector(id).map(|v| (distance.compute(&query, v), id)))
        .collect();
    hits.sort_unstable_by_key(|&(d, id)| (OrderedFloat(d), id));
    Ok(hits)
}

/// An in-memory HNSW index handle.
///
/// Searches share a read lock and run concurrently; mutations, reserve and
/// restore take the write lock. After [`Index::release`] every call fails
/// with [`IndexError::InvalidHandle`].
pub struct Index {
    state: RwLock<Option<IndexState>>,

    /// Number of search operations performed.
    search_count: AtomicU64,
}

impl Index {
    /// Creates a new index with a built-in metric.
    ///
    /// # Arguments
    ///
    /// * `options` - Index configuration; `options.metric` must not be `Custom`
    ///
    /// # Returns
    ///
    /// * `Result<Index, IndexError>` - New index, or `InvalidOptions`
    pub fn new(options: IndexOptions) -> Result<Self, IndexError> {
        let metric = Metric::builtin(options.metric)?;
        Ok(Self::from_state(IndexState::new(options, metric)?))
    }

    /// Creates a new index ranking vectors with a user-defined distance.
    ///
    /// The function receives both vectors widened to f32 and must return a
    /// non-negative distance, lower meaning more similar.
    pub fn with_custom_metric<F>(options: IndexOptions, f: F) -> Result<Self, IndexError>
    where
        F: Fn(&[f32], &[f32]) -> f32 + Send + Sync + 'static,
    {
        let options = IndexOptions {
            metric: MetricKind::Custom,
            ..options
        };
        Ok(Self::from_state(IndexState::new(options, Metric::custom(f))?))
    }

    fn from_state(state: IndexState) -> Self {
        Self {
            search_count: AtomicU64::new(0),
            state: RwLock::new(Some(state)),
        }
    }

    fn with_state<R, F>(&self, f: F) -> Result<R, IndexError>
    where
        F: FnOnce(&IndexState) -> Result<R, IndexError>,
    {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(IndexError::InvalidHandle)?;
        f(state)
    }

    fn with_state_mut<R, F>(&self, f: F) -> Result<R, IndexError>
    where
        F: FnOnce(&mut IndexState) -> Result<R, IndexError>,
    {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(IndexError::InvalidHandle)?;
        f(state)
    }

    /// Inserts a vector under `key`.
    ///
    /// The vector may be given in any supported scalar type and is converted
    /// to the stored encoding. Its length must be the dimensionality, or the
    /// packed byte count for [`crate::B1x8`].
    ///
    /// # Returns
    ///
    /// * `Result<(), IndexError>` - `DimensionMismatch`, `DuplicateKey` or
    ///   `CapacityExceeded` on failure, leaving the index unchanged.
    pub fn add<T: Scalar>(&self, key: u64, vector: &[T]) -> Result<(), IndexError> {
        self.with_state_mut(|s| s.add(key, vector))
    }

    /// Returns up to `count` vectors stored under `key`, converted to `T`.
    pub fn get<T: Scalar>(&self, key: u64, count: usize) -> Result<Vec<Vec<T>>, IndexError> {
        self.with_state(|s| s.get(key, count))
    }

    pub fn contains(&self, key: u64) -> Result<bool, IndexError> {
        self.with_state(|s| Ok(s.keys.contains(key)))
    }

    /// Number of vectors stored under `key`.
    pub fn count(&self, key: u64) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.keys.count(key)))
    }

    /// Removes `key` and all its vectors. Returns the number of vectors removed.
    pub fn remove(&self, key: u64) -> Result<usize, IndexError> {
        self.with_state_mut(|s| s.remove(key))
    }

    /// Searches for the `count` nearest keys to the query vector.
    ///
    /// Results are sorted by ascending distance (closest first), ties by
    /// insertion slot. Each key appears once, at its closest vector.
    ///
    /// # Arguments
    ///
    /// * `query` - Query vector in any supported scalar type
    /// * `count` - Number of nearest keys to return
    ///
    /// # Returns
    ///
    /// * `Result<Vec<(u64, f32)>, IndexError>` - Vector of (key, distance) pairs
    pub fn search<T: Scalar>(
        &self,
        query: &[T],
        count: usize,
    ) -> Result<Vec<(u64, f32)>, IndexError> {
        let results = self.with_state(|s| s.search(query, count))?;
        self.search_count.fetch_add(1, Ordering::Relaxed);
        Ok(results)
    }

    /// Pre-allocates room for `capacity` vectors. Smaller requests are no-ops.
    pub fn reserve(&self, capacity: usize) -> Result<(), IndexError> {
        self.with_state_mut(|s| {
            let from = s.store.capacity();
            s.reserve(capacity)?;
            if capacity > from {
                log::info!(action = "reserve", from = from, to = capacity; "index capacity reserved");
            }
            Ok(())
        })
    }

    /// Number of distinct live keys.
    pub fn size(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.keys.len()))
    }

    /// Number of allocated vector slots.
    pub fn capacity(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.store.capacity()))
    }

    pub fn dimensions(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.options.dimensions))
    }

    pub fn connectivity(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.options.connectivity))
    }

    pub fn metric_kind(&self) -> Result<MetricKind, IndexError> {
        self.with_state(|s| Ok(s.metric.kind()))
    }

    pub fn scalar_kind(&self) -> Result<ScalarKind, IndexError> {
        self.with_state(|s| Ok(s.options.quantization))
    }

    pub fn options(&self) -> Result<IndexOptions, IndexError> {
        self.with_state(|s| Ok(s.options.clone()))
    }

    pub fn expansion_add(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.options.expansion_add))
    }

    pub fn expansion_search(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.options.expansion_search))
    }

    /// Sets the construction-time search breadth for future insertions.
    pub fn change_expansion_add(&self, value: usize) -> Result<(), IndexError> {
        if value == 0 {
            return Err(IndexError::invalid_options("expansion_add must be positive"));
        }
        self.with_state_mut(|s| {
            s.options.expansion_add = value;
            Ok(())
        })
    }

    /// Sets the query-time search breadth for future searches.
    pub fn change_expansion_search(&self, value: usize) -> Result<(), IndexError> {
        if value == 0 {
            return Err(IndexError::invalid_options(
                "expansion_search must be positive",
            ));
        }
        self.with_state_mut(|s| {
            s.options.expansion_search = value;
            Ok(())
        })
    }

    /// Switches to another built-in metric. Edges already built are kept.
    pub fn change_metric_kind(&self, kind: MetricKind) -> Result<(), IndexError> {
        let metric = Metric::builtin(kind)?;
        self.with_state_mut(|s| s.change_metric(metric))
    }

    /// Switches to a user-defined metric. Edges already built are kept.
    pub fn change_custom_metric<F>(&self, f: F) -> Result<(), IndexError>
    where
        F: Fn(&[f32], &[f32]) -> f32 + Send + Sync + 'static,
    {
        self.with_state_mut(|s| s.change_metric(Metric::custom(f)))
    }

    /// Names the kernel path distances run on for the stored encoding and
    /// the current metric, `"serial"` when no accelerated path applies.
    pub fn hardware_acceleration(&self) -> Result<&'static str, IndexError> {
        self.with_state(|s| Ok(hardware_acceleration(s.options.quantization, s.metric.kind())))
    }

    /// Bytes held by vectors, graph and keys.
    pub fn memory_usage(&self) -> Result<usize, IndexError> {
        self.with_state(|s| Ok(s.memory_usage()))
    }

    /// Exact length of the [`Index::save`] output.
    pub fn serialized_length(&self) -> Result<usize, IndexError> {
        self.with_state(codec::encoded_len)
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        self.with_state(|s| {
            Ok(IndexStats {
                num_keys: s.keys.len() as u64,
                num_vectors: s.keys.vectors_len() as u64,
                capacity: s.store.capacity() as u64,
                max_level: s.graph.max_level().unwrap_or_default(),
                insert_count: s.insert_count,
                delete_count: s.delete_count,
                search_count: self.search_count.load(Ordering::Relaxed),
                memory_usage: s.memory_usage() as u64,
            })
        })
    }

    /// Destroys the handle's state. Every later call fails with `InvalidHandle`.
    pub fn release(&self) -> Result<(), IndexError> {
        self.state
            .write()
            .take()
            .map(|_| ())
            .ok_or(IndexError::InvalidHandle)
    }

    /// Stores the whole index to a writer in CBOR format.
    ///
    /// # Arguments
    ///
    /// * `w` - Any type implementing the [`Write`] trait
    ///
    /// # Returns
    ///
    /// * `Result<(), IndexError>` - Success or error.
    pub fn save<W: Write>(&self, w: W) -> Result<(), IndexError> {
        self.with_state(|s| codec::encode(s, w))
    }

    pub fn save_bytes(&self) -> Result<Vec<u8>, IndexError> {
        self.with_state(|s| {
            let mut buf = Vec::with_capacity(codec::encoded_len(s)?);
            codec::encode(s, &mut buf)?;
            Ok(buf)
        })
    }

    /// Saves into a caller-provided buffer and returns the bytes written.
    pub fn save_to_buffer(&self, buf: &mut [u8]) -> Result<usize, IndexError> {
        self.with_state(|s| {
            let needed = codec::encoded_len(s)?;
            if buf.len() < needed {
                return Err(IndexError::BufferTooSmall {
                    needed,
                    got: buf.len(),
                });
            }
            codec::encode(s, &mut buf[..needed])?;
            Ok(needed)
        })
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let path = path.as_ref();
        let io_err = |source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let mut w = BufWriter::new(file);
        self.save(&mut w)?;
        w.flush().map_err(io_err)
    }

    /// Loads an index from a reader holding [`Index::save`] output.
    ///
    /// Fails with `CorruptState` on malformed or inconsistent input, and with
    /// `InvalidOptions` for snapshots of a custom metric, which only
    /// [`Index::restore`] can attach to.
    pub fn load<R: Read>(r: R) -> Result<Self, IndexError> {
        let state = codec::decode(r, None).inspect_err(|err| {
            log::warn!(action = "load"; "rejected index snapshot: {err}");
        })?;
        log::info!(
            action = "load",
            keys = state.keys.len(),
            capacity = state.store.capacity();
            "index loaded",
        );
        Ok(Self::from_state(state))
    }

    pub fn load_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        Self::load(bytes)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load(BufReader::new(file))
    }

    /// Replaces this handle's state with a snapshot read from `r`.
    ///
    /// The current state is kept when the snapshot is rejected. A custom
    /// metric attached to this handle carries over to custom-metric snapshots.
    pub fn restore<R: Read>(&self, r: R) -> Result<(), IndexError> {
        self.with_state_mut(|s| {
            let custom = Some(&s.metric).filter(|m| m.kind() == MetricKind::Custom);
            let state = codec::decode(r, custom).inspect_err(|err| {
                log::warn!(action = "restore"; "rejected index snapshot: {err}");
            })?;
            log::info!(
                action = "restore",
                keys = state.keys.len(),
                capacity = state.store.capacity();
                "index restored",
            );
            *s = state;
            Ok(())
        })
    }

    pub fn restore_bytes(&self, bytes: &[u8]) -> Result<(), IndexError> {
        self.restore(bytes)
    }

    pub fn restore_file(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.restore(BufReader::new(file))
    }
}
