//! Runtime data model
//!
//! The value, node, query and state types shared by the simplifier,
//! compiler and virtual machine.

pub mod node;
pub mod query;
pub mod state;
pub mod vector;

pub use node::Node;
pub use query::{search, Query};
pub use state::StateDict;
pub use vector::{Object, Vector};
