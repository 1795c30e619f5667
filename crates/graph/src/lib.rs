pub mod merge;
pub mod store;

pub use merge::{MergeConfig, MergeEngine, UNKNOWN_TYPE};
pub use store::{
    EdgeData, EdgeSnapshot, GraphSnapshot, GraphStore, MemoryGraphStore, NodeData, NodeSnapshot,
    SEP,
};
