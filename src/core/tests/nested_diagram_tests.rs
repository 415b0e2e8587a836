use super::{add_leaf, chain, init_logging, port};
use crate::core::config::ContextConfig;
use crate::core::context::{ContextBase, LeafContext};
use crate::core::diagram::DiagramContext;
use crate::core::ports::{InputPort, NoResolver, ResolvedInput, SystemOutput};
use crate::core::values::{BasicVector, TypedValue};

/// source(0) -> chain(1)
///
/// The inner chain's diagram input 0 (its sink's second input) is fed by
/// the outer source.
fn nested() -> DiagramContext {
    init_logging();
    let mut outer = DiagramContext::new(2);
    add_leaf(
        &mut outer,
        0,
        LeafContext::new(&ContextConfig::new().with_output_ports(1).with_continuous_states(2)),
    );

    let inner = chain();
    let inner_outputs = SystemOutput::new(inner.num_output_ports());
    outer.add_system(1, Box::new(inner), inner_outputs).unwrap();

    outer.connect(port(0, 0), port(1, 0)).unwrap();
    outer.export_output(port(1, 0)).unwrap();
    outer.make_state().unwrap();
    outer
}

fn inner(outer: &DiagramContext) -> &DiagramContext {
    outer
        .subsystem_context(1)
        .downcast_ref::<DiagramContext>()
        .expect("subsystem 1 should be a diagram")
}

#[test]
fn test_time_reaches_grandchildren() {
    let mut outer = nested();
    outer.set_time(3.0);

    let inner = inner(&outer);
    assert_eq!(inner.time(), 3.0);
    for index in 0..inner.num_subsystems() {
        assert_eq!(inner.subsystem_context(index).time(), 3.0);
    }
}

#[test]
fn test_composite_state_spans_nesting() {
    let mut outer = nested();
    // Outer source contributes 2, inner chain contributes 3.
    assert_eq!(outer.num_continuous_states(), 5);
    assert_eq!(outer.num_modal_states(), 1);

    *outer.continuous_state_mut(4).unwrap() = 6.0;
    let inner = inner(&outer);
    assert_eq!(inner.subsystem_context(1).continuous_state(1), Some(6.0));
}

#[test]
fn test_wire_into_nested_diagram_resolves_through_outer() {
    let mut outer = nested();

    // The binding inside the inner diagram belongs to the outer one.
    match inner(&outer).resolve_input(0) {
        Ok(ResolvedInput::Pending(binding)) => assert_eq!(binding.owner, outer.id()),
        other => panic!("expected a pending binding, found {:?}", other),
    }

    let value = BasicVector::from_slice(&[0.5, 1.5]);
    outer
        .set_subsystem_output_value(0, 0, TypedValue::new(value.clone()))
        .unwrap();

    assert_eq!(outer.eval_subsystem_vector_input(1, 0).unwrap(), Some(&value));
}

#[test]
fn test_inner_subsystem_reads_wire_from_outer() {
    let mut outer = nested();
    let value = BasicVector::from_slice(&[0.5, 1.5]);
    outer
        .set_subsystem_output_value(0, 0, TypedValue::new(value.clone()))
        .unwrap();

    let inner = inner(&outer);
    assert_eq!(
        inner
            .eval_subsystem_vector_input_resolving(2, 1, &outer)
            .unwrap(),
        Some(&value)
    );
    let chained = outer.resolver(&NoResolver);
    assert_eq!(
        inner
            .eval_subsystem_vector_input_resolving(2, 1, &chained)
            .unwrap(),
        Some(&value)
    );
    // Wires the inner diagram owns are read from its own buffers.
    assert!(inner
        .eval_subsystem_input_resolving(1, 0, &outer)
        .unwrap()
        .is_none());
}

#[test]
fn test_outer_output_invalidates_inside_nested_diagram() {
    let mut outer = nested();

    let inner_mut = outer
        .subsystem_context_mut(1)
        .downcast_mut::<DiagramContext>()
        .unwrap();
    let sink = inner_mut.subsystem_context_mut(2);
    let ticket = sink.input_port_ticket(1).unwrap();
    let derived = sink.cache_mut().make_cache_ticket(&[ticket]);
    sink.cache_mut().set(derived, TypedValue::new(1i32));

    outer
        .set_subsystem_output_value(0, 0, TypedValue::new(2.0f64))
        .unwrap();

    assert!(inner(&outer)
        .subsystem_context(2)
        .cache()
        .get(derived)
        .is_none());
}

#[test]
fn test_inner_state_change_reaches_outer_output_freshness() {
    let mut outer = nested();
    outer.mark_evaluation_fresh(1);
    assert!(outer.is_output_port_fresh(0));

    // Gain state of the inner chain feeds the exported output.
    *outer.continuous_state_mut(3).unwrap() = 1.0;
    assert!(!outer.is_output_port_fresh(0));
}

#[test]
fn test_nested_output_hand_off_reaches_outer_consumers() {
    init_logging();
    let mut outer = DiagramContext::new(2);
    outer
        .add_system(0, Box::new(chain()), SystemOutput::new(1))
        .unwrap();
    add_leaf(
        &mut outer,
        1,
        LeafContext::new(&ContextConfig::new().with_input_ports(1).with_output_ports(1)),
    );
    outer.connect(port(0, 0), port(1, 0)).unwrap();
    outer.export_output(port(1, 0)).unwrap();
    outer.make_state().unwrap();

    let consumer = outer.subsystem_context_mut(1);
    let ticket = consumer.input_port_ticket(0).unwrap();
    let derived = consumer.cache_mut().make_cache_ticket(&[ticket]);
    consumer.cache_mut().set(derived, TypedValue::new(1i32));
    outer.mark_evaluation_fresh(1);

    // The chain's gain output is its exported output 0.
    let value = BasicVector::from_slice(&[4.0]);
    let changed = outer
        .subsystem_context_mut(0)
        .downcast_mut::<DiagramContext>()
        .unwrap()
        .set_subsystem_output_value(1, 0, TypedValue::new(value.clone()))
        .unwrap();
    assert_eq!(changed, vec![0]);
    assert!(outer.subsystem_context(1).cache().get(derived).is_some());

    assert_eq!(outer.propagate_invalid_subsystem_outputs(0, &changed), vec![0]);
    assert!(outer.subsystem_context(1).cache().get(derived).is_none());
    assert!(!outer.is_output_port_fresh(0));
    assert!(!outer.is_evaluation_fresh(0));

    outer
        .set_subsystem_output_value(0, 0, TypedValue::new(value.clone()))
        .unwrap();
    assert!(outer.is_evaluation_fresh(0));
    assert_eq!(outer.eval_subsystem_vector_input(1, 0).unwrap(), Some(&value));
}

#[test]
fn test_nested_clone_rewires_both_levels() {
    let mut outer = nested();
    outer
        .set_subsystem_output_value(0, 0, TypedValue::new(BasicVector::from_slice(&[7.0])))
        .unwrap();

    let mut cloned = outer.clone_context();
    let clone = cloned.downcast_mut::<DiagramContext>().unwrap();
    let inner_clone = inner(clone);
    let inner_original = inner(&outer);

    assert_ne!(inner_clone.id(), inner_original.id());
    assert_eq!(inner_clone.dependency_graph(), inner_original.dependency_graph());
    match inner_clone.input_port(0).unwrap() {
        Some(InputPort::Dependent(binding)) => assert_eq!(binding.owner, clone.id()),
        other => panic!("expected the outer wire to be replayed, found {:?}", other),
    }
    match inner_clone
        .subsystem_context(1)
        .input_port(0)
        .unwrap()
    {
        Some(InputPort::Dependent(binding)) => assert_eq!(binding.owner, inner_clone.id()),
        other => panic!("expected the inner wire to be replayed, found {:?}", other),
    }
    assert_eq!(
        clone.eval_subsystem_vector_input(1, 0).unwrap().unwrap().values(),
        &[7.0]
    );
    assert_eq!(
        inner_clone
            .eval_subsystem_vector_input_resolving(2, 1, &*clone)
            .unwrap()
            .unwrap()
            .values(),
        &[7.0]
    );

    clone.set_time(2.0);
    assert_eq!(inner(clone).subsystem_context(0).time(), 2.0);
    assert_eq!(inner(&outer).subsystem_context(0).time(), 0.0);
}
