//! Hierarchical dependency-graph engine.
//!
//! Raw node records are normalized into a flat [`graph::SlimGraph`],
//! grouped by slash-delimited namespaces (and detected node series)
//! into a [`hierarchy::Hierarchy`] with aggregated metaedges, and then
//! projected per expanded group into a [`render::RenderGraphInfo`]
//! whose core graphs have high-degree clutter extracted to the side.

pub mod errors;
pub mod graph;
pub mod hierarchy;
pub mod progress;
pub mod render;
pub mod series;
pub mod template;
