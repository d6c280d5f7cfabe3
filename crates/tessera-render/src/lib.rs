//! Per-frame GPU resource and pass scheduling for the Tessera renderer.
//!
//! This crate provides:
//! - Growable linear heaps for vertex and index data
//! - Transient render targets that follow the viewport size
//! - Descriptor pools and a growable per-frame descriptor arena
//! - A per-frame render graph with barriers between adjacent passes
//! - The render context that owns all of the above for one device

pub mod context;
pub mod descriptor_arena;
pub mod descriptor_pool;
pub mod heap;
pub mod render_graph;
pub mod render_target;

pub use context::{RenderContext, RenderContextConfig};
pub use descriptor_arena::DescriptorArena;
pub use descriptor_pool::{DescriptorPool, DescriptorPoolConfig};
pub use heap::{
    Heap, HeapConfig, HeapRange, HeapRangeOwned, DEFAULT_HEAP_CAPACITY, HEAP_RESERVED_BYTES,
};
pub use render_graph::{
    synthesize_barrier, GraphState, PassDependencies, PassDependency, RenderGraph,
};
pub use render_target::{
    RenderTargetId, RenderTargetInfo, RenderTargetManager, RenderTargetScale,
};
