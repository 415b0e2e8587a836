use std::any::Any;
use std::fmt;

use log::{debug, trace};

use super::cache::{Cache, CacheTicket};
use super::config::ContextConfig;
use super::errors::ContextError;
use super::ports::{InputPort, NoResolver, PortResolver, ResolvedInput};
use super::state::{State, StepInfo};
use super::types::{ContextId, PortIndex};
use super::values::{BasicVector, TypedValue};

/// All the inputs to a system: time, state and input ports, plus the cache
/// of values derived from them.
///
/// Implemented by [`LeafContext`] for leaf systems and by
/// [`DiagramContext`](crate::core::diagram::DiagramContext) for diagrams, so
/// diagrams nest. Every mutation of time, state or an input binding goes
/// through one of the `invalidate_*` hooks before it happens.
pub trait ContextBase: Any + Send + Sync + fmt::Debug {
    fn id(&self) -> ContextId;

    fn step_info(&self) -> &StepInfo;

    /// Current time in seconds.
    fn time(&self) -> f64 {
        self.step_info().time
    }

    /// Set the current time, invalidating everything that depends on it.
    fn set_time(&mut self, time: f64);

    fn num_input_ports(&self) -> usize;

    fn num_output_ports(&self) -> usize;

    /// Replace the binding at `index`. `None` disconnects the port.
    fn set_input_port(
        &mut self,
        index: PortIndex,
        port: Option<InputPort>,
    ) -> Result<(), ContextError>;

    /// Replace the binding at `index` without invalidating anything.
    ///
    /// The new binding must carry the same value as the old one, as when a
    /// cloned diagram re-issues its wires against itself.
    fn rebind_input_port(
        &mut self,
        index: PortIndex,
        port: Option<InputPort>,
    ) -> Result<(), ContextError>;

    /// The binding installed at `index`, `None` if unconnected.
    fn input_port(&self, index: PortIndex) -> Result<Option<&InputPort>, ContextError>;

    /// Look up the value on input port `index` as far as this context can.
    fn resolve_input(&self, index: PortIndex) -> Result<ResolvedInput<'_>, ContextError>;

    /// The value on input port `index`, `None` if unconnected or unresolvable.
    fn input_value(&self, index: PortIndex) -> Result<Option<&TypedValue>, ContextError> {
        Ok(self.resolve_input(index)?.value())
    }

    /// The vector on input port `index`, `None` if unconnected or not a
    /// vector-valued port.
    fn get_vector_input(&self, index: PortIndex) -> Result<Option<&BasicVector>, ContextError> {
        Ok(self
            .input_value(index)?
            .and_then(|value| value.get::<BasicVector>().ok()))
    }

    fn num_continuous_states(&self) -> usize;
    fn continuous_state(&self, index: usize) -> Option<f64>;
    /// Writable access to one continuous variable. Invalidates state first.
    fn continuous_state_mut(&mut self, index: usize) -> Option<&mut f64>;

    fn num_difference_states(&self) -> usize;
    fn difference_state(&self, group: usize) -> Option<&BasicVector>;
    /// Writable access to one discrete group. Invalidates state first.
    fn difference_state_mut(&mut self, group: usize) -> Option<&mut BasicVector>;

    fn num_modal_states(&self) -> usize;
    fn modal_state(&self, index: usize) -> Option<&TypedValue>;
    /// Writable access to one modal entry. Invalidates state first.
    fn modal_state_mut(&mut self, index: usize) -> Option<&mut TypedValue>;

    /// Invalidate all cache lines that depend on time.
    fn invalidate_time(&mut self);

    /// Invalidate all cache lines that depend on state.
    fn invalidate_state(&mut self);

    /// Invalidate all cache lines that depend on input port `index`.
    ///
    /// # Panics
    /// If `index` is not a valid input port.
    fn invalidate_input_port(&mut self, index: PortIndex);

    fn mark_output_port_fresh(&mut self, index: PortIndex);
    fn mark_output_port_stale(&mut self, index: PortIndex);
    fn is_output_port_fresh(&self, index: PortIndex) -> bool;

    fn mark_output_ports_fresh(&mut self) {
        for index in 0..self.num_output_ports() {
            self.mark_output_port_fresh(index);
        }
    }

    fn are_output_ports_fresh(&self) -> bool {
        (0..self.num_output_ports()).all(|index| self.is_output_port_fresh(index))
    }

    fn cache(&self) -> &Cache;
    fn cache_mut(&mut self) -> &mut Cache;

    /// Ticket invalidated whenever time changes.
    fn time_ticket(&self) -> CacheTicket;
    /// Ticket invalidated whenever state changes.
    fn state_ticket(&self) -> CacheTicket;
    /// Ticket invalidated whenever input port `index` changes.
    fn input_port_ticket(&self, index: PortIndex) -> Option<CacheTicket>;

    /// Deep copy whose dependent input bindings become free-standing copies of
    /// whatever `upstream` resolves them to.
    fn clone_resolving(&self, upstream: &dyn PortResolver) -> Box<dyn ContextBase>;

    /// Deep copy with no enclosing diagram to resolve dependent bindings
    /// against; those ports come out unconnected.
    fn clone_context(&self) -> Box<dyn ContextBase> {
        self.clone_resolving(&NoResolver)
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn ContextBase {
    pub fn downcast_ref<T: ContextBase>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: ContextBase>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

impl Clone for Box<dyn ContextBase> {
    fn clone(&self) -> Self {
        self.clone_context()
    }
}

/// Context of a leaf system. Owns its time, state, input bindings and cache.
#[derive(Debug)]
pub struct LeafContext {
    id: ContextId,
    step_info: StepInfo,
    state: State,
    inputs: Vec<Option<InputPort>>,
    fresh_outputs: Vec<bool>,
    cache: Cache,
    time_ticket: CacheTicket,
    state_ticket: CacheTicket,
    input_tickets: Vec<CacheTicket>,
}

impl LeafContext {
    pub fn new(config: &ContextConfig) -> Self {
        let mut cache = Cache::new();
        let time_ticket = cache.make_cache_ticket(&[]);
        let state_ticket = cache.make_cache_ticket(&[]);
        let input_tickets = (0..config.input_ports)
            .map(|_| cache.make_cache_ticket(&[]))
            .collect();

        Self {
            id: ContextId::new(),
            step_info: StepInfo::default(),
            state: State::from_config(config),
            inputs: vec![None; config.input_ports],
            fresh_outputs: vec![false; config.output_ports],
            cache,
            time_ticket,
            state_ticket,
            input_tickets,
        }
    }

    /// Declare a modal state entry with its initial value.
    ///
    /// For use while the owning system is being set up, before the context
    /// is added to a diagram.
    pub fn with_modal_state(mut self, value: TypedValue) -> Self {
        self.state.push_modal(value);
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Writable access to the whole state. Invalidates state first.
    pub fn state_mut(&mut self) -> &mut State {
        self.invalidate_state();
        &mut self.state
    }

    fn check_input(&self, index: PortIndex) -> Result<(), ContextError> {
        if index < self.inputs.len() {
            Ok(())
        } else {
            Err(ContextError::InputPortOutOfRange {
                index,
                count: self.inputs.len(),
            })
        }
    }

    fn mark_outputs_stale(&mut self) {
        self.fresh_outputs.iter_mut().for_each(|fresh| *fresh = false);
    }

    fn output_flag(&self, index: PortIndex) -> usize {
        assert!(
            index < self.fresh_outputs.len(),
            "output port {} out of range: context has {} output ports",
            index,
            self.fresh_outputs.len()
        );
        index
    }
}

impl ContextBase for LeafContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn step_info(&self) -> &StepInfo {
        &self.step_info
    }

    fn set_time(&mut self, time: f64) {
        self.invalidate_time();
        self.step_info.time = time;
    }

    fn num_input_ports(&self) -> usize {
        self.inputs.len()
    }

    fn num_output_ports(&self) -> usize {
        self.fresh_outputs.len()
    }

    fn set_input_port(
        &mut self,
        index: PortIndex,
        port: Option<InputPort>,
    ) -> Result<(), ContextError> {
        self.check_input(index)?;
        self.invalidate_input_port(index);
        debug!(
            "context {}: input port {} bound to {:?}",
            self.id, index, port
        );
        self.inputs[index] = port;
        Ok(())
    }

    fn rebind_input_port(
        &mut self,
        index: PortIndex,
        port: Option<InputPort>,
    ) -> Result<(), ContextError> {
        self.check_input(index)?;
        self.inputs[index] = port;
        Ok(())
    }

    fn input_port(&self, index: PortIndex) -> Result<Option<&InputPort>, ContextError> {
        self.check_input(index)?;
        Ok(self.inputs[index].as_ref())
    }

    fn resolve_input(&self, index: PortIndex) -> Result<ResolvedInput<'_>, ContextError> {
        let resolved = match self.input_port(index)? {
            Some(InputPort::Freestanding(value)) => ResolvedInput::Value(value),
            Some(InputPort::Dependent(port)) => ResolvedInput::Pending(*port),
            None => ResolvedInput::Unconnected,
        };
        Ok(resolved)
    }

    fn num_continuous_states(&self) -> usize {
        self.state.continuous().len()
    }

    fn continuous_state(&self, index: usize) -> Option<f64> {
        self.state.continuous().get(index)
    }

    fn continuous_state_mut(&mut self, index: usize) -> Option<&mut f64> {
        if index >= self.state.continuous().len() {
            return None;
        }
        self.state_mut().continuous_mut().get_mut(index)
    }

    fn num_difference_states(&self) -> usize {
        self.state.difference().len()
    }

    fn difference_state(&self, group: usize) -> Option<&BasicVector> {
        self.state.difference().get(group)
    }

    fn difference_state_mut(&mut self, group: usize) -> Option<&mut BasicVector> {
        if group >= self.state.difference().len() {
            return None;
        }
        self.state_mut().difference_mut().get_mut(group)
    }

    fn num_modal_states(&self) -> usize {
        self.state.modal().len()
    }

    fn modal_state(&self, index: usize) -> Option<&TypedValue> {
        self.state.modal().get(index)
    }

    fn modal_state_mut(&mut self, index: usize) -> Option<&mut TypedValue> {
        if index >= self.state.modal().len() {
            return None;
        }
        self.state_mut().modal_mut().get_mut(index)
    }

    fn invalidate_time(&mut self) {
        trace!("context {}: time invalidated", self.id);
        self.cache.invalidate(self.time_ticket);
        self.mark_outputs_stale();
    }

    fn invalidate_state(&mut self) {
        trace!("context {}: state invalidated", self.id);
        self.cache.invalidate(self.state_ticket);
        self.mark_outputs_stale();
    }

    fn invalidate_input_port(&mut self, index: PortIndex) {
        let ticket = match self.input_tickets.get(index) {
            Some(ticket) => *ticket,
            None => panic!(
                "input port {} out of range: context has {} input ports",
                index,
                self.inputs.len()
            ),
        };
        trace!("context {}: input port {} invalidated", self.id, index);
        self.cache.invalidate(ticket);
        self.mark_outputs_stale();
    }

    fn mark_output_port_fresh(&mut self, index: PortIndex) {
        let flag = self.output_flag(index);
        self.fresh_outputs[flag] = true;
    }

    fn mark_output_port_stale(&mut self, index: PortIndex) {
        let flag = self.output_flag(index);
        self.fresh_outputs[flag] = false;
    }

    fn is_output_port_fresh(&self, index: PortIndex) -> bool {
        self.fresh_outputs[self.output_flag(index)]
    }

    fn cache(&self) -> &Cache {
        &self.cache
    }

    fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    fn time_ticket(&self) -> CacheTicket {
        self.time_ticket
    }

    fn state_ticket(&self) -> CacheTicket {
        self.state_ticket
    }

    fn input_port_ticket(&self, index: PortIndex) -> Option<CacheTicket> {
        self.input_tickets.get(index).copied()
    }

    fn clone_resolving(&self, upstream: &dyn PortResolver) -> Box<dyn ContextBase> {
        let inputs = self
            .inputs
            .iter()
            .enumerate()
            .map(|(index, binding)| match binding {
                Some(InputPort::Freestanding(value)) => {
                    Some(InputPort::Freestanding(value.clone()))
                }
                Some(InputPort::Dependent(port)) => {
                    let copied = upstream.resolve(port).cloned();
                    if copied.is_none() {
                        debug!(
                            "context {}: input port {} has no value on its wire; clone leaves it unconnected",
                            self.id, index
                        );
                    }
                    copied.map(InputPort::Freestanding)
                }
                None => None,
            })
            .collect();

        Box::new(LeafContext {
            id: ContextId::new(),
            step_info: self.step_info,
            state: self.state.clone(),
            inputs,
            fresh_outputs: self.fresh_outputs.clone(),
            cache: self.cache.clone(),
            time_ticket: self.time_ticket,
            state_ticket: self.state_ticket,
            input_tickets: self.input_tickets.clone(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::DependentInputPort;
    use crate::core::types::PortIdentifier;

    fn context() -> LeafContext {
        let config = ContextConfig::new()
            .with_input_ports(2)
            .with_output_ports(1)
            .with_continuous_states(2)
            .with_difference_state(1);
        LeafContext::new(&config).with_modal_state(TypedValue::new("idle"))
    }

    #[test]
    fn test_set_time_invalidates_time_dependents() {
        let mut ctx = context();
        let time_ticket = ctx.time_ticket();
        let derived = ctx.cache_mut().make_cache_ticket(&[time_ticket]);
        ctx.cache_mut().set(derived, TypedValue::new(1.0f64));

        ctx.set_time(2.5);

        assert_eq!(ctx.time(), 2.5);
        assert!(ctx.cache().get(derived).is_none());
    }

    #[test]
    fn test_state_mutation_invalidates_state_dependents_only() {
        let mut ctx = context();
        let state_ticket = ctx.state_ticket();
        let time_ticket = ctx.time_ticket();
        let on_state = ctx.cache_mut().make_cache_ticket(&[state_ticket]);
        let on_time = ctx.cache_mut().make_cache_ticket(&[time_ticket]);
        ctx.cache_mut().set(on_state, TypedValue::new(1i32));
        ctx.cache_mut().set(on_time, TypedValue::new(2i32));

        *ctx.continuous_state_mut(1).unwrap() = 4.0;

        assert_eq!(ctx.continuous_state(1), Some(4.0));
        assert!(ctx.cache().get(on_state).is_none());
        assert!(ctx.cache().get(on_time).is_some());
    }

    #[test]
    fn test_out_of_range_state_access_does_not_invalidate() {
        let mut ctx = context();
        let state_ticket = ctx.state_ticket();
        let derived = ctx.cache_mut().make_cache_ticket(&[state_ticket]);
        ctx.cache_mut().set(derived, TypedValue::new(1i32));

        assert!(ctx.continuous_state_mut(5).is_none());
        assert!(ctx.cache().get(derived).is_some());
    }

    #[test]
    fn test_set_input_port_out_of_range() {
        let mut ctx = context();
        let err = ctx
            .set_input_port(2, Some(InputPort::freestanding(1i32)))
            .unwrap_err();
        assert_eq!(err, ContextError::InputPortOutOfRange { index: 2, count: 2 });
    }

    #[test]
    fn test_vector_input() {
        let mut ctx = context();
        ctx.set_input_port(0, Some(InputPort::freestanding(BasicVector::from_slice(&[1.0, 2.0]))))
            .unwrap();
        ctx.set_input_port(1, Some(InputPort::freestanding(3i32))).unwrap();

        assert_eq!(ctx.get_vector_input(0).unwrap().unwrap().values(), &[1.0, 2.0]);
        // Connected but not vector-valued.
        assert!(ctx.get_vector_input(1).unwrap().is_none());
        assert!(ctx.get_vector_input(7).is_err());
    }

    #[test]
    fn test_rebinding_input_invalidates_dependents() {
        let mut ctx = context();
        let input_ticket = ctx.input_port_ticket(0).unwrap();
        let derived = ctx.cache_mut().make_cache_ticket(&[input_ticket]);
        ctx.set_input_port(0, Some(InputPort::freestanding(1i32))).unwrap();
        ctx.cache_mut().set(derived, TypedValue::new(10i32));

        ctx.set_input_port(0, None).unwrap();

        assert!(ctx.cache().get(derived).is_none());
        assert!(ctx.input_value(0).unwrap().is_none());
    }

    #[test]
    fn test_rebinding_keeps_cached_lines() {
        let mut ctx = context();
        let input_ticket = ctx.input_port_ticket(0).unwrap();
        let derived = ctx.cache_mut().make_cache_ticket(&[input_ticket]);
        ctx.set_input_port(0, Some(InputPort::freestanding(1i32))).unwrap();
        ctx.cache_mut().set(derived, TypedValue::new(10i32));
        ctx.mark_output_ports_fresh();

        ctx.rebind_input_port(0, Some(InputPort::freestanding(1i32)))
            .unwrap();

        assert!(ctx.cache().get(derived).is_some());
        assert!(ctx.are_output_ports_fresh());
        assert!(ctx.rebind_input_port(2, None).is_err());
    }

    #[test]
    fn test_freshness_cleared_by_invalidation() {
        let mut ctx = context();
        assert!(!ctx.is_output_port_fresh(0));
        ctx.mark_output_ports_fresh();
        assert!(ctx.are_output_ports_fresh());

        ctx.set_time(1.0);
        assert!(!ctx.is_output_port_fresh(0));
    }

    #[test]
    #[should_panic(expected = "output port 3 out of range")]
    fn test_freshness_out_of_range_panics() {
        context().is_output_port_fresh(3);
    }

    #[test]
    fn test_clone_degrades_dependent_inputs() {
        struct Wire(TypedValue);

        impl PortResolver for Wire {
            fn resolve(&self, _port: &DependentInputPort) -> Option<&TypedValue> {
                Some(&self.0)
            }
        }

        let mut ctx = context();
        let handle = DependentInputPort {
            owner: ContextId::new(),
            source: PortIdentifier::new(0, 0),
        };
        ctx.set_input_port(0, Some(InputPort::Dependent(handle))).unwrap();
        ctx.set_input_port(1, Some(InputPort::Dependent(handle))).unwrap();
        assert!(matches!(ctx.resolve_input(0), Ok(ResolvedInput::Pending(_))));

        let resolved = ctx.clone_resolving(&Wire(TypedValue::new(9i32)));
        assert!(matches!(
            resolved.input_port(0),
            Ok(Some(InputPort::Freestanding(_)))
        ));
        assert_eq!(resolved.input_value(0).unwrap().unwrap().get::<i32>(), Ok(&9));

        let detached = ctx.clone_context();
        assert!(detached.input_port(1).unwrap().is_none());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut ctx = context();
        ctx.set_time(3.0);
        *ctx.continuous_state_mut(0).unwrap() = 1.5;

        let mut clone = ctx.clone_context();
        assert_ne!(clone.id(), ctx.id());
        assert_eq!(clone.time(), 3.0);
        assert_eq!(clone.continuous_state(0), Some(1.5));
        assert_eq!(clone.modal_state(0).unwrap().get::<&str>(), Ok(&"idle"));

        *clone.continuous_state_mut(0).unwrap() = -1.0;
        *clone.modal_state_mut(0).unwrap() = TypedValue::new("running");

        assert_eq!(ctx.continuous_state(0), Some(1.5));
        assert_eq!(ctx.modal_state(0).unwrap().get::<&str>(), Ok(&"idle"));
        assert!(clone.downcast_ref::<LeafContext>().is_some());
    }
}
