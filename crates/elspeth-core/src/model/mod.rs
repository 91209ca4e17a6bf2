//! Execution graph value types: nodes, edges, tokens, outcomes, routing.

pub mod edge;
pub mod node;
pub mod outcome;
pub mod routing;
pub mod token;

pub use edge::{Edge, EdgeMode};
pub use node::{node_id, Node, NodeKind, SchemaRef};
pub use outcome::{FailureReason, Outcome};
pub use routing::{RoutingEvent, RoutingReason};
pub use token::{Determinism, Token, WorkItem};
