//! # Dense HNSW Vector Index
//!
//! An in-memory implementation of the Hierarchical Navigable Small World (HNSW)
//! algorithm for approximate nearest neighbor search over dense vectors.
//!
//! Vectors are stored in one scalar encoding chosen at construction and may be
//! passed in or read out as any supported scalar type; conversion happens at
//! the boundary.
//!
//! ## Features
//!
//! - Approximate k-nearest-neighbor search with tunable expansion factors;
//! - Scalar encodings: f64, f32, f16, bf16, i8 and packed bits (`B1x8`);
//! - Built-in metrics (L2sq, Cosine, Inner Product, Pearson, Haversine,
//!   Divergence, Jaccard, Hamming, Tanimoto, Sorensen) and user-defined metrics;
//! - Single or multi-valued keys, with deletion and slot reuse;
//! - Thread-safe handle: concurrent searches, serialized mutations;
//! - Persistence to writers, byte buffers and files in CBOR format.
//!
//! ## Example
//!
//! ```rust
//! use dense_hnsw::{Index, IndexOptions, MetricKind};
//!
//! let index = Index::new(IndexOptions {
//!     dimensions: 3,
//!     metric: MetricKind::L2sq,
//!     ..Default::default()
//! })?;
//! index.add(1, &[1.0f32, 0.0, 0.0])?;
//! index.add(2, &[0.0f32, 1.0, 0.0])?;
//!
//! let results = index.search(&[0.9f32, 0.1, 0.0], 1)?;
//! assert_eq!(results[0].0, 1);
//! # Ok::<(), dense_hnsw::IndexError>(())
//! ```

mod codec;
mod distance;
mod error;
mod graph;
mod index;
mod keys;
mod scalar;
mod store;

pub use codec::FORMAT_VERSION;
pub use distance::*;
pub use error::*;
pub use graph::{GraphNode, LayerGen, MAX_LEVEL, NodeId, level_bound};
pub use index::*;
pub use keys::{KeyMap, KeyNodes};
pub use scalar::*;
pub use store::{MAX_SLOTS, MIN_GROWTH, Slab, VectorStore, Vectors};

pub use half;
