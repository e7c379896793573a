//! Shadowing B-tree: fixed-width `u64` keys, fixed-width values, COW
//! nodes allocated and reference-counted through a [`crate::Shadow`]
//! implementation (either the real transaction manager or the space
//! map's own internal trees).

pub mod node;
pub mod spine;
pub mod tree;
pub mod value;

pub use node::{NodeRoView, NodeView};
pub use tree::Tree;
pub use value::{ChildRootValue, OpaqueValue, ValueType};
