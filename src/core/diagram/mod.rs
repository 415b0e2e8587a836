pub mod dependency_graph;
pub mod diagram_context;

pub use dependency_graph::DependencyGraph;
pub use diagram_context::{DiagramContext, Phase};
