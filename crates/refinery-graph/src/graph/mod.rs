//! Graph scheduler.
//!
//! A workflow is a set of `Node`s joined by transitions. Unconditional edges
//! always move to their target; conditional edges ask a router for a label
//! and move to the target registered under it. The `Executor` walks the
//! graph from its entry node, merging each node's update into the shared
//! `WorkflowState` before choosing the next step.
//!
//! A compiled `Graph` is also a `Node`, so a group of nodes can run as one
//! step of an enclosing graph.

pub mod builder;
pub mod edge;
pub mod executor;
pub mod node;
mod subgraph;

pub use builder::{Graph, GraphBuilder};
pub use edge::{Router, Target, Transition, END};
pub use executor::{invoke, Aborted, ExecutionResult, Executor, NodeRun};
pub use node::{FnNode, Node};
