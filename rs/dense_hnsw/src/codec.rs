use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::{
    distance::{Metric, MetricKind},
    error::IndexError,
    graph::{Graph, GraphNode, NodeId},
    index::{IndexOptions, IndexState},
    keys::KeyMap,
    store::{VectorStore, Vectors},
};

/// Version of the snapshot layout written by [`encode`].
pub const FORMAT_VERSION: u16 = 1;

/// Serializable index snapshot (reference version).
#[derive(Serialize)]
struct SnapshotRef<'a> {
    #[serde(rename = "ver")]
    version: u16,
    #[serde(rename = "opt")]
    options: &'a IndexOptions,
    #[serde(rename = "cap")]
    capacity: usize,
    #[serde(rename = "vec")]
    vectors: &'a Vectors,
    #[serde(rename = "free")]
    free: &'a [NodeId],
    #[serde(rename = "nodes")]
    nodes: &'a [Option<GraphNode>],
    #[serde(rename = "entry")]
    entry: Option<(NodeId, u8)>,
    #[serde(rename = "keys")]
    keys: Vec<(u64, Vec<NodeId>)>,
    #[serde(rename = "ops")]
    counters: (u64, u64),
}

/// Serializable index snapshot (owned version).
#[derive(Deserialize)]
struct SnapshotOwned {
    #[serde(rename = "ver")]
    version: u16,
    #[serde(rename = "opt")]
    options: IndexOptions,
    #[serde(rename = "cap")]
    capacity: usize,
    #[serde(rename = "vec")]
    vectors: Vectors,
    #[serde(rename = "free")]
    free: Vec<NodeId>,
    #[serde(rename = "nodes")]
    nodes: Vec<Option<GraphNode>>,
    #[serde(rename = "entry")]
    entry: Option<(NodeId, u8)>,
    #[serde(rename = "keys")]
    keys: Vec<(u64, Vec<NodeId>)>,
    #[serde(rename = "ops")]
    counters: (u64, u64),
}

/// Writes the whole index state to `w` in CBOR format.
pub(crate) fn encode<W: Write>(state: &IndexState, w: W) -> Result<(), IndexError> {
    ciborium::into_writer(
        &SnapshotRef {
            version: FORMAT_VERSION,
            options: &state.options,
            capacity: state.store.capacity(),
            vectors: state.store.vectors(),
            free: state.store.free(),
            nodes: state.graph.nodes(),
            entry: state.graph.entry(),
            keys: state.keys.entries(),
            counters: (state.insert_count, state.delete_count),
        },
        w,
    )
    .map_err(|err| IndexError::Serialization { source: err.into() })
}

/// Exact number of bytes [`encode`] writes for `state`.
pub(crate) fn encoded_len(state: &IndexState) -> Result<usize, IndexError> {
    let mut counter = ByteCounter(0);
    encode(state, &mut counter)?;
    Ok(counter.0)
}

/// Reads an index state from `r`, validating every structural invariant.
///
/// A snapshot of a user-defined metric can only be restored with `custom`,
/// the metric of the handle it is restored into.
pub(crate) fn decode<R: Read>(r: R, custom: Option<&Metric>) -> Result<IndexState, IndexError> {
    let snapshot: SnapshotOwned = ciborium::from_reader(r)
        .map_err(|err| IndexError::corrupt(format!("failed to decode snapshot: {err:?}")))?;

    if snapshot.version != FORMAT_VERSION {
        return Err(IndexError::corrupt(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }

    let options = snapshot.options;
    options
        .validate()
        .map_err(|err| IndexError::corrupt(format!("inconsistent options: {err}")))?;

    let metric = match (options.metric, custom) {
        (MetricKind::Custom, Some(metric)) if metric.kind() == MetricKind::Custom => {
            metric.clone()
        }
        (MetricKind::Custom, _) => {
            return Err(IndexError::invalid_options(
                "snapshot uses a custom metric, restore it into an index with a custom metric",
            ));
        }
        (kind, _) => Metric::builtin(kind)?,
    };

    let store = VectorStore::from_parts(
        options.quantization,
        options.dimensions,
        snapshot.capacity,
        snapshot.free,
        snapshot.vectors,
    )?;

    let slots = store.vectors().slots();
    if snapshot.nodes.len() != slots {
        return Err(IndexError::corrupt(format!(
            "graph has {} nodes for {slots} vector slots",
            snapshot.nodes.len()
        )));
    }
    for (id, node) in snapshot.nodes.iter().enumerate() {
        let freed = store.is_vacant(id as NodeId);
        if node.is_some() == freed {
            return Err(IndexError::corrupt(format!(
                "node {id} disagrees with the free list"
            )));
        }
    }

    let graph = Graph::from_parts(
        options.connectivity,
        options.seed,
        snapshot.nodes,
        snapshot.entry,
    )?;

    let keys = KeyMap::from_entries(options.multi, snapshot.keys, slots, |id| {
        graph.node(id).is_some()
    })?;
    if keys.vectors_len() != store.len() {
        return Err(IndexError::corrupt(format!(
            "{} of {} nodes have a key",
            keys.vectors_len(),
            store.len()
        )));
    }

    let (insert_count, delete_count) = snapshot.counters;
    Ok(IndexState {
        options,
        metric,
        store,
        keys,
        graph,
        insert_count,
        delete_count,
    })
}

/// A writer that only counts bytes.
struct ByteCounter(usize);

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
