mod nested_diagram_tests;

use crate::core::config::ContextConfig;
use crate::core::context::{ContextBase, LeafContext};
use crate::core::diagram::DiagramContext;
use crate::core::ports::SystemOutput;
use crate::core::types::PortIdentifier;
use crate::core::values::TypedValue;

pub(super) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(super) fn port(system: usize, port: usize) -> PortIdentifier {
    PortIdentifier::new(system, port)
}

/// Adds a leaf subsystem with output buffers matching its declared outputs.
pub(super) fn add_leaf(diagram: &mut DiagramContext, index: usize, context: LeafContext) {
    let output = SystemOutput::new(context.num_output_ports());
    diagram
        .add_system(index, Box::new(context), output)
        .expect("subsystem should be accepted");
}

/// source(0) -> gain(1) -> sink(2)
///
/// - source: 1 output, 1 continuous state
/// - gain: 1 input, 1 output, 2 continuous states, one modal state
/// - sink: 2 inputs, no outputs, one discrete group of 2
///
/// Diagram input 0 is sink input 1; diagram output 0 is gain output 0.
pub(super) fn chain() -> DiagramContext {
    init_logging();
    let mut diagram = DiagramContext::new(3);

    add_leaf(
        &mut diagram,
        0,
        LeafContext::new(
            &ContextConfig::new()
                .with_output_ports(1)
                .with_continuous_states(1),
        ),
    );
    add_leaf(
        &mut diagram,
        1,
        LeafContext::new(
            &ContextConfig::new()
                .with_input_ports(1)
                .with_output_ports(1)
                .with_continuous_states(2),
        )
        .with_modal_state(TypedValue::new(false)),
    );
    add_leaf(
        &mut diagram,
        2,
        LeafContext::new(
            &ContextConfig::new()
                .with_input_ports(2)
                .with_difference_state(2),
        ),
    );

    diagram.connect(port(0, 0), port(1, 0)).unwrap();
    diagram.connect(port(1, 0), port(2, 0)).unwrap();
    diagram.export_input(port(2, 1)).unwrap();
    diagram.export_output(port(1, 0)).unwrap();
    diagram.make_state().unwrap();
    diagram
}

pub(super) fn leaf(diagram: &DiagramContext, index: usize) -> &LeafContext {
    diagram
        .subsystem_context(index)
        .downcast_ref::<LeafContext>()
        .expect("subsystem should be a leaf")
}
