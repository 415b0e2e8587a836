use std::any::Any;
use std::collections::BTreeSet;

use log::{debug, trace, warn};
use rayon::prelude::*;

use super::dependency_graph::DependencyGraph;
use crate::core::cache::{Cache, CacheTicket};
use crate::core::config::ConcurrencyMode;
use crate::core::context::ContextBase;
use crate::core::errors::ContextError;
use crate::core::ports::{
    DependentInputPort, InputPort, NoResolver, PortResolver, ResolvedInput, SystemOutput,
};
use crate::core::state::{CompositeState, StepInfo};
use crate::core::types::{ContextId, PortIdentifier, PortIndex, SystemIndex};
use crate::core::values::{BasicVector, TypedValue};

/// Lifecycle of a diagram context.
///
/// `add_system`, `connect`, `export_input` and `export_output` are only
/// accepted while `Building`. `make_state` moves the context to `Sealed`,
/// after which only runtime operations are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Sealed,
}

/// Context of a diagram: the contexts and output buffers of every
/// subsystem, the wiring between them, and the diagram's own external port
/// numbering.
///
/// From the outside it behaves like any other [`ContextBase`], so a diagram
/// context can itself be a subsystem of an enclosing diagram.
#[derive(Debug)]
pub struct DiagramContext {
    id: ContextId,
    phase: Phase,
    concurrency: ConcurrencyMode,
    step_info: StepInfo,

    /// Stored in SystemIndex order; length fixed at construction.
    contexts: Vec<Option<Box<dyn ContextBase>>>,
    /// Same length and order as `contexts`.
    outputs: Vec<Option<SystemOutput>>,

    input_ids: Vec<PortIdentifier>,
    output_ids: Vec<PortIdentifier>,
    graph: DependencyGraph,
    state: CompositeState,

    cache: Cache,
    time_ticket: CacheTicket,
    state_ticket: CacheTicket,
    input_tickets: Vec<CacheTicket>,
}

impl DiagramContext {
    /// A diagram context with room for exactly `num_subsystems` subsystems.
    pub fn new(num_subsystems: usize) -> Self {
        Self::with_concurrency(num_subsystems, ConcurrencyMode::default())
    }

    pub fn with_concurrency(num_subsystems: usize, concurrency: ConcurrencyMode) -> Self {
        let mut cache = Cache::new();
        let time_ticket = cache.make_cache_ticket(&[]);
        let state_ticket = cache.make_cache_ticket(&[]);

        Self {
            id: ContextId::new(),
            phase: Phase::Building,
            concurrency,
            step_info: StepInfo::default(),
            contexts: (0..num_subsystems).map(|_| None).collect(),
            outputs: vec![None; num_subsystems],
            input_ids: Vec::new(),
            output_ids: Vec::new(),
            graph: DependencyGraph::new(),
            state: CompositeState::default(),
            cache,
            time_ticket,
            state_ticket,
            input_tickets: Vec::new(),
        }
    }

    pub fn num_subsystems(&self) -> usize {
        self.contexts.len()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_sealed(&self) -> bool {
        self.phase == Phase::Sealed
    }

    pub fn concurrency(&self) -> ConcurrencyMode {
        self.concurrency
    }

    // ---- Allocation ----

    /// Install the context and output buffers of subsystem `index`.
    pub fn add_system(
        &mut self,
        index: SystemIndex,
        context: Box<dyn ContextBase>,
        output: SystemOutput,
    ) -> Result<(), ContextError> {
        self.ensure_building()?;
        self.check_subsystem_index(index)?;
        if self.contexts[index].is_some() || self.outputs[index].is_some() {
            return Err(ContextError::SubsystemAlreadyAdded { index });
        }

        debug!(
            "diagram {}: subsystem {} added (context {})",
            self.id,
            index,
            context.id()
        );
        self.contexts[index] = Some(context);
        self.outputs[index] = Some(output);
        Ok(())
    }

    /// Wire output port `src` to input port `dest`.
    ///
    /// The destination receives a dependent binding that names `src`; the
    /// value is read from this diagram's output buffers at each access. A
    /// wire that would make a subsystem depend on its own outputs is
    /// rejected.
    pub fn connect(&mut self, src: PortIdentifier, dest: PortIdentifier) -> Result<(), ContextError> {
        self.ensure_building()?;

        let num_src_ports = self.try_subsystem_output(src.system)?.num_ports();
        if src.port >= num_src_ports {
            return Err(ContextError::OutputPortOutOfRange {
                index: src.port,
                count: num_src_ports,
            });
        }
        let num_dest_ports = self.try_subsystem_context(dest.system)?.num_input_ports();
        if dest.port >= num_dest_ports {
            return Err(ContextError::InputPortOutOfRange {
                index: dest.port,
                count: num_dest_ports,
            });
        }

        if src.system == dest.system || self.graph.system_reaches(dest.system, src.system) {
            return Err(ContextError::WiringCycle { src, dest });
        }

        let binding = self.binding_from(src);
        self.try_subsystem_context_mut(dest.system)?
            .set_input_port(dest.port, Some(binding))?;
        self.record_connection(src, dest);
        Ok(())
    }

    /// Expose input port `id` of a subsystem as the next diagram input.
    pub fn export_input(&mut self, id: PortIdentifier) -> Result<PortIndex, ContextError> {
        self.ensure_building()?;
        let count = self.try_subsystem_context(id.system)?.num_input_ports();
        if id.port >= count {
            return Err(ContextError::InputPortOutOfRange {
                index: id.port,
                count,
            });
        }
        Ok(self.push_input_id(id))
    }

    /// Expose output port `id` of a subsystem as the next diagram output.
    pub fn export_output(&mut self, id: PortIdentifier) -> Result<PortIndex, ContextError> {
        self.ensure_building()?;
        let count = self.try_subsystem_output(id.system)?.num_ports();
        if id.port >= count {
            return Err(ContextError::OutputPortOutOfRange {
                index: id.port,
                count,
            });
        }
        self.output_ids.push(id);
        debug!("diagram {}: output {} exported as {}", self.id, id, self.output_ids.len() - 1);
        Ok(self.output_ids.len() - 1)
    }

    /// Build the composite state view over every subsystem and seal the
    /// context.
    pub fn make_state(&mut self) -> Result<(), ContextError> {
        self.ensure_building()?;
        for index in 0..self.num_subsystems() {
            self.try_subsystem_context(index)?;
            self.try_subsystem_output(index)?;
        }

        self.build_state();
        self.phase = Phase::Sealed;
        debug!(
            "diagram {}: sealed with {} subsystems, {} continuous / {} discrete / {} modal states",
            self.id,
            self.num_subsystems(),
            self.state.continuous_len(),
            self.state.difference_len(),
            self.state.modal_len()
        );
        Ok(())
    }

    fn binding_from(&self, src: PortIdentifier) -> InputPort {
        InputPort::Dependent(DependentInputPort {
            owner: self.id,
            source: src,
        })
    }

    fn record_connection(&mut self, src: PortIdentifier, dest: PortIdentifier) {
        if let Some(previous) = self.graph.add_connection(src, dest) {
            debug!("diagram {}: input {} detached from {}", self.id, dest, previous);
        }
        debug!("diagram {}: connected {} -> {}", self.id, src, dest);
    }

    fn push_input_id(&mut self, id: PortIdentifier) -> PortIndex {
        self.input_ids.push(id);
        let ticket = self.cache.make_cache_ticket(&[]);
        self.input_tickets.push(ticket);
        debug!("diagram {}: input {} exported as {}", self.id, id, self.input_ids.len() - 1);
        self.input_ids.len() - 1
    }

    fn build_state(&mut self) {
        let mut state = CompositeState::default();
        for (system, context) in self.contexts.iter().enumerate() {
            if let Some(context) = context {
                state.append(
                    system,
                    context.num_continuous_states(),
                    context.num_difference_states(),
                    context.num_modal_states(),
                );
            }
        }
        self.state = state;
    }

    fn ensure_building(&self) -> Result<(), ContextError> {
        match self.phase {
            Phase::Building => Ok(()),
            Phase::Sealed => Err(ContextError::Sealed),
        }
    }

    fn ensure_sealed(&self) -> Result<(), ContextError> {
        match self.phase {
            Phase::Sealed => Ok(()),
            Phase::Building => Err(ContextError::NotSealed),
        }
    }

    fn assert_sealed(&self, operation: &str) {
        assert!(
            self.is_sealed(),
            "DiagramContext::{} called before make_state: {}",
            operation,
            ContextError::NotSealed
        );
    }

    fn check_subsystem_index(&self, index: SystemIndex) -> Result<(), ContextError> {
        if index < self.num_subsystems() {
            Ok(())
        } else {
            Err(ContextError::SubsystemOutOfRange {
                index,
                count: self.num_subsystems(),
            })
        }
    }

    fn try_subsystem_context(&self, index: SystemIndex) -> Result<&dyn ContextBase, ContextError> {
        self.check_subsystem_index(index)?;
        self.contexts[index]
            .as_deref()
            .ok_or(ContextError::SubsystemMissing { index })
    }

    fn try_subsystem_context_mut(
        &mut self,
        index: SystemIndex,
    ) -> Result<&mut dyn ContextBase, ContextError> {
        self.check_subsystem_index(index)?;
        match self.contexts[index].as_mut() {
            Some(context) => Ok(context.as_mut()),
            None => Err(ContextError::SubsystemMissing { index }),
        }
    }

    fn try_subsystem_output(&self, index: SystemIndex) -> Result<&SystemOutput, ContextError> {
        self.check_subsystem_index(index)?;
        self.outputs[index]
            .as_ref()
            .ok_or(ContextError::SubsystemMissing { index })
    }

    // ---- Subsystem access ----

    /// # Panics
    /// If `index` is out of range or no subsystem was added there.
    pub fn subsystem_context(&self, index: SystemIndex) -> &dyn ContextBase {
        self.try_subsystem_context(index)
            .unwrap_or_else(|err| panic!("DiagramContext::subsystem_context: {}", err))
    }

    /// # Panics
    /// If `index` is out of range or no subsystem was added there.
    pub fn subsystem_context_mut(&mut self, index: SystemIndex) -> &mut dyn ContextBase {
        self.try_subsystem_context_mut(index)
            .unwrap_or_else(|err| panic!("DiagramContext::subsystem_context_mut: {}", err))
    }

    /// # Panics
    /// If `index` is out of range or no subsystem was added there.
    pub fn subsystem_output(&self, index: SystemIndex) -> &SystemOutput {
        self.try_subsystem_output(index)
            .unwrap_or_else(|err| panic!("DiagramContext::subsystem_output: {}", err))
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Subsystem ports exported as diagram inputs, in diagram input order.
    pub fn input_ids(&self) -> &[PortIdentifier] {
        &self.input_ids
    }

    /// Subsystem ports exported as diagram outputs, in diagram output order.
    pub fn output_ids(&self) -> &[PortIdentifier] {
        &self.output_ids
    }

    pub fn composite_state(&self) -> &CompositeState {
        &self.state
    }

    /// The value currently buffered on output port `src`.
    pub fn output_value(&self, src: PortIdentifier) -> Option<&TypedValue> {
        self.outputs.get(src.system)?.as_ref()?.port(src.port)?.value()
    }

    /// The value on input `port` of subsystem `system`, following a wire
    /// through this diagram's output buffers if there is one.
    ///
    /// A wire installed by an enclosing diagram cannot be followed from here
    /// and reads as `None`; use
    /// [`DiagramContext::eval_subsystem_input_resolving`] for a nested
    /// diagram.
    pub fn eval_subsystem_input(
        &self,
        system: SystemIndex,
        port: PortIndex,
    ) -> Result<Option<&TypedValue>, ContextError> {
        self.eval_subsystem_input_resolving(system, port, &NoResolver)
    }

    /// Like [`DiagramContext::eval_subsystem_input`], handing wires this
    /// diagram does not own to `upstream`, usually the enclosing diagram or
    /// a [`DiagramContext::resolver`] chain of enclosing diagrams.
    pub fn eval_subsystem_input_resolving<'a>(
        &'a self,
        system: SystemIndex,
        port: PortIndex,
        upstream: &'a dyn PortResolver,
    ) -> Result<Option<&'a TypedValue>, ContextError> {
        self.ensure_sealed()?;
        let resolved = self.try_subsystem_context(system)?.resolve_input(port)?;
        Ok(match self.settle(resolved) {
            ResolvedInput::Pending(binding) => upstream.resolve(&binding),
            settled => settled.value(),
        })
    }

    /// Vector-valued variant of [`DiagramContext::eval_subsystem_input`].
    pub fn eval_subsystem_vector_input(
        &self,
        system: SystemIndex,
        port: PortIndex,
    ) -> Result<Option<&BasicVector>, ContextError> {
        self.eval_subsystem_vector_input_resolving(system, port, &NoResolver)
    }

    /// Vector-valued variant of
    /// [`DiagramContext::eval_subsystem_input_resolving`].
    pub fn eval_subsystem_vector_input_resolving<'a>(
        &'a self,
        system: SystemIndex,
        port: PortIndex,
        upstream: &'a dyn PortResolver,
    ) -> Result<Option<&'a BasicVector>, ContextError> {
        Ok(self
            .eval_subsystem_input_resolving(system, port, upstream)?
            .and_then(|value| value.get::<BasicVector>().ok()))
    }

    /// Resolver for a diagram nested in this one: wires owned here are read
    /// from this diagram's buffers, the rest are handed to `upstream`.
    pub fn resolver<'a>(&'a self, upstream: &'a dyn PortResolver) -> impl PortResolver + 'a {
        ChainedResolver {
            diagram: self,
            upstream,
        }
    }

    /// Store a freshly evaluated output of subsystem `system`.
    ///
    /// Everything downstream of the port is invalidated first; the port
    /// itself ends up fresh. Returns the diagram outputs that changed.
    ///
    /// An enclosing diagram buffers this diagram's outputs separately, so
    /// when this diagram is nested the caller hands the returned indices to
    /// the enclosing diagram's
    /// [`DiagramContext::propagate_invalid_subsystem_outputs`], then stores
    /// the new values there with `set_subsystem_output_value`.
    pub fn set_subsystem_output_value(
        &mut self,
        system: SystemIndex,
        port: PortIndex,
        value: TypedValue,
    ) -> Result<Vec<PortIndex>, ContextError> {
        self.ensure_sealed()?;
        let count = self.try_subsystem_output(system)?.num_ports();
        let Some(slot) = self.outputs[system].as_mut().and_then(|output| output.port_mut(port)) else {
            return Err(ContextError::OutputPortOutOfRange { index: port, count });
        };
        slot.set_value(value);

        let changed = self.propagate_from(vec![PortIdentifier::new(system, port)]);
        self.subsystem_context_mut(system).mark_output_port_fresh(port);
        Ok(changed)
    }

    pub fn is_evaluation_fresh(&self, index: SystemIndex) -> bool {
        self.subsystem_context(index).are_output_ports_fresh()
    }

    pub fn mark_evaluation_fresh(&mut self, index: SystemIndex) {
        self.subsystem_context_mut(index).mark_output_ports_fresh();
    }

    /// Deep copy of one subsystem context whose wired inputs become
    /// free-standing copies of the values currently on their wires.
    pub fn clone_subsystem_context(&self, index: SystemIndex) -> Box<dyn ContextBase> {
        let resolver = ChainedResolver {
            diagram: self,
            upstream: &NoResolver,
        };
        self.subsystem_context(index).clone_resolving(&resolver)
    }

    // ---- Invalidation ----

    /// Invalidate everything downstream of output port `port` of subsystem
    /// `system`.
    ///
    /// Walks the inverse dependency graph transitively. Each input reached is
    /// invalidated in its subsystem's context, which clears every cache line
    /// depending on it, and every output of that subsystem is treated as
    /// invalid in turn. Returns the diagram output indices whose exported
    /// port was reached.
    pub fn propagate_invalid_outputs(&mut self, system: SystemIndex, port: PortIndex) -> Vec<PortIndex> {
        self.assert_sealed("propagate_invalid_outputs");
        let count = self.subsystem_output(system).num_ports();
        assert!(
            port < count,
            "output port {} out of range: subsystem {} has {} output ports",
            port,
            system,
            count
        );
        self.propagate_from(vec![PortIdentifier::new(system, port)])
    }

    /// Invalidate everything downstream of several outputs of one subsystem
    /// at once, typically the indices a nested diagram's
    /// `set_subsystem_output_value` reported.
    ///
    /// # Panics
    /// If any port is out of range for `system`.
    pub fn propagate_invalid_subsystem_outputs(
        &mut self,
        system: SystemIndex,
        ports: &[PortIndex],
    ) -> Vec<PortIndex> {
        self.assert_sealed("propagate_invalid_subsystem_outputs");
        let count = self.subsystem_output(system).num_ports();
        let mut start: Vec<PortIdentifier> = ports
            .iter()
            .map(|&port| {
                assert!(
                    port < count,
                    "output port {} out of range: subsystem {} has {} output ports",
                    port,
                    system,
                    count
                );
                PortIdentifier::new(system, port)
            })
            .collect();
        start.sort_unstable();
        start.dedup();
        self.propagate_from(start)
    }

    fn propagate_from(&mut self, start: Vec<PortIdentifier>) -> Vec<PortIndex> {
        let mut visited: BTreeSet<PortIdentifier> = start.iter().copied().collect();
        let mut worklist = start;
        let mut changed = BTreeSet::new();

        while let Some(src) = worklist.pop() {
            if let Some(context) = self.contexts[src.system].as_mut() {
                if src.port < context.num_output_ports() {
                    context.mark_output_port_stale(src.port);
                }
            }
            changed.extend(
                self.output_ids
                    .iter()
                    .enumerate()
                    .filter(|(_, id)| **id == src)
                    .map(|(index, _)| index),
            );

            let destinations = self.graph.destinations_of(src).to_vec();
            for dest in destinations {
                trace!("diagram {}: {} invalidates input {}", self.id, src, dest);
                let Some(context) = self.contexts[dest.system].as_mut() else {
                    continue;
                };
                context.invalidate_input_port(dest.port);
                for port in 0..context.num_output_ports() {
                    let next = PortIdentifier::new(dest.system, port);
                    if visited.insert(next) {
                        worklist.push(next);
                    }
                }
            }
        }

        if !changed.is_empty() {
            debug!("diagram {}: exported outputs {:?} invalidated", self.id, changed);
        }
        changed.into_iter().collect()
    }

    /// Every output port of the given subsystems.
    fn outputs_of(&self, systems: impl IntoIterator<Item = SystemIndex>) -> Vec<PortIdentifier> {
        systems
            .into_iter()
            .filter_map(|system| {
                let output = self.outputs.get(system)?.as_ref()?;
                Some((0..output.num_ports()).map(move |port| PortIdentifier::new(system, port)))
            })
            .flatten()
            .collect()
    }

    fn all_outputs(&self) -> Vec<PortIdentifier> {
        self.outputs_of(0..self.num_subsystems())
    }

    /// Turn a binding found in a subsystem into a value if it is ours.
    fn settle<'a>(&'a self, resolved: ResolvedInput<'a>) -> ResolvedInput<'a> {
        match resolved {
            ResolvedInput::Pending(port) if port.owner == self.id => {
                match self.output_value(port.source) {
                    Some(value) => ResolvedInput::Value(value),
                    None => ResolvedInput::Unconnected,
                }
            }
            other => other,
        }
    }

    fn exported_input(&self, index: PortIndex) -> Result<PortIdentifier, ContextError> {
        self.input_ids
            .get(index)
            .copied()
            .ok_or(ContextError::InputPortOutOfRange {
                index,
                count: self.input_ids.len(),
            })
    }

    fn exported_output(&self, index: PortIndex) -> PortIdentifier {
        match self.output_ids.get(index) {
            Some(id) => *id,
            None => panic!(
                "output port {} out of range: diagram has {} output ports",
                index,
                self.output_ids.len()
            ),
        }
    }
}

/// Resolves handles owned by `diagram` from its output buffers and defers
/// everything else to `upstream`.
struct ChainedResolver<'a> {
    diagram: &'a DiagramContext,
    upstream: &'a dyn PortResolver,
}

impl PortResolver for DiagramContext {
    fn resolve(&self, port: &DependentInputPort) -> Option<&TypedValue> {
        if port.owner == self.id {
            self.output_value(port.source)
        } else {
            None
        }
    }
}

impl PortResolver for ChainedResolver<'_> {
    fn resolve(&self, port: &DependentInputPort) -> Option<&TypedValue> {
        if port.owner == self.diagram.id {
            self.diagram.output_value(port.source)
        } else {
            self.upstream.resolve(port)
        }
    }
}

impl ContextBase for DiagramContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn step_info(&self) -> &StepInfo {
        &self.step_info
    }

    /// Sets the time here and in every subsystem.
    fn set_time(&mut self, time: f64) {
        self.assert_sealed("set_time");
        self.cache.invalidate(self.time_ticket);
        self.step_info.time = time;
        for context in self.contexts.iter_mut().flatten() {
            context.set_time(time);
        }
        let outputs = self.all_outputs();
        self.propagate_from(outputs);
    }

    fn num_input_ports(&self) -> usize {
        self.input_ids.len()
    }

    fn num_output_ports(&self) -> usize {
        self.output_ids.len()
    }

    fn set_input_port(&mut self, index: PortIndex, port: Option<InputPort>) -> Result<(), ContextError> {
        let id = self.exported_input(index)?;
        self.cache.invalidate(self.input_tickets[index]);
        self.try_subsystem_context_mut(id.system)?
            .set_input_port(id.port, port)?;
        let outputs = self.outputs_of([id.system]);
        self.propagate_from(outputs);
        Ok(())
    }

    fn rebind_input_port(
        &mut self,
        index: PortIndex,
        port: Option<InputPort>,
    ) -> Result<(), ContextError> {
        let id = self.exported_input(index)?;
        self.try_subsystem_context_mut(id.system)?
            .rebind_input_port(id.port, port)
    }

    fn input_port(&self, index: PortIndex) -> Result<Option<&InputPort>, ContextError> {
        let id = self.exported_input(index)?;
        self.try_subsystem_context(id.system)?.input_port(id.port)
    }

    fn resolve_input(&self, index: PortIndex) -> Result<ResolvedInput<'_>, ContextError> {
        let id = self.exported_input(index)?;
        let resolved = self.try_subsystem_context(id.system)?.resolve_input(id.port)?;
        let settled = self.settle(resolved);
        if let ResolvedInput::Pending(port) = settled {
            trace!(
                "diagram {}: input {} is wired through enclosing diagram {}",
                self.id,
                index,
                port.owner
            );
        }
        Ok(settled)
    }

    fn get_vector_input(&self, index: PortIndex) -> Result<Option<&BasicVector>, ContextError> {
        let resolved = self.resolve_input(index)?;
        if let ResolvedInput::Pending(port) = resolved {
            warn!(
                "diagram {}: input {} is bound to output {} of foreign context {}",
                self.id, index, port.source, port.owner
            );
        }
        Ok(resolved
            .value()
            .and_then(|value| value.get::<BasicVector>().ok()))
    }

    fn num_continuous_states(&self) -> usize {
        self.state.continuous_len()
    }

    fn continuous_state(&self, index: usize) -> Option<f64> {
        let slot = self.state.continuous_slot(index)?;
        self.contexts[slot.system].as_ref()?.continuous_state(slot.index)
    }

    fn continuous_state_mut(&mut self, index: usize) -> Option<&mut f64> {
        let slot = self.state.continuous_slot(index)?;
        self.invalidate_composite_slot(slot.system);
        self.contexts[slot.system]
            .as_mut()?
            .continuous_state_mut(slot.index)
    }

    fn num_difference_states(&self) -> usize {
        self.state.difference_len()
    }

    fn difference_state(&self, group: usize) -> Option<&BasicVector> {
        let slot = self.state.difference_slot(group)?;
        self.contexts[slot.system].as_ref()?.difference_state(slot.index)
    }

    fn difference_state_mut(&mut self, group: usize) -> Option<&mut BasicVector> {
        let slot = self.state.difference_slot(group)?;
        self.invalidate_composite_slot(slot.system);
        self.contexts[slot.system]
            .as_mut()?
            .difference_state_mut(slot.index)
    }

    fn num_modal_states(&self) -> usize {
        self.state.modal_len()
    }

    fn modal_state(&self, index: usize) -> Option<&TypedValue> {
        let slot = self.state.modal_slot(index)?;
        self.contexts[slot.system].as_ref()?.modal_state(slot.index)
    }

    fn modal_state_mut(&mut self, index: usize) -> Option<&mut TypedValue> {
        let slot = self.state.modal_slot(index)?;
        self.invalidate_composite_slot(slot.system);
        self.contexts[slot.system].as_mut()?.modal_state_mut(slot.index)
    }

    fn invalidate_time(&mut self) {
        self.cache.invalidate(self.time_ticket);
        for context in self.contexts.iter_mut().flatten() {
            context.invalidate_time();
        }
        let outputs = self.all_outputs();
        self.propagate_from(outputs);
    }

    fn invalidate_state(&mut self) {
        self.cache.invalidate(self.state_ticket);
        for context in self.contexts.iter_mut().flatten() {
            context.invalidate_state();
        }
        let outputs = self.all_outputs();
        self.propagate_from(outputs);
    }

    fn invalidate_input_port(&mut self, index: PortIndex) {
        let id = self
            .exported_input(index)
            .unwrap_or_else(|err| panic!("DiagramContext::invalidate_input_port: {}", err));
        self.cache.invalidate(self.input_tickets[index]);
        self.subsystem_context_mut(id.system).invalidate_input_port(id.port);
        let outputs = self.outputs_of([id.system]);
        self.propagate_from(outputs);
    }

    fn mark_output_port_fresh(&mut self, index: PortIndex) {
        let id = self.exported_output(index);
        self.subsystem_context_mut(id.system).mark_output_port_fresh(id.port);
    }

    fn mark_output_port_stale(&mut self, index: PortIndex) {
        let id = self.exported_output(index);
        self.subsystem_context_mut(id.system).mark_output_port_stale(id.port);
    }

    fn is_output_port_fresh(&self, index: PortIndex) -> bool {
        let id = self.exported_output(index);
        trace!("diagram {}: freshness of output {} read from {}", self.id, index, id);
        self.subsystem_context(id.system).is_output_port_fresh(id.port)
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

    /// Clones every subsystem, then replays the wiring onto the copy.
    ///
    /// The copy gets a new id, so dependent bindings are re-issued against
    /// it and never resolve through the original's buffers. Re-issuing a
    /// wire does not invalidate: cached lines and freshness carry over.
    fn clone_resolving(&self, upstream: &dyn PortResolver) -> Box<dyn ContextBase> {
        self.assert_sealed("clone");
        let resolver = ChainedResolver {
            diagram: self,
            upstream,
        };
        let clone_child = |context: &Option<Box<dyn ContextBase>>| {
            context.as_ref().map(|context| context.clone_resolving(&resolver))
        };
        let contexts: Vec<Option<Box<dyn ContextBase>>> = match self.concurrency {
            ConcurrencyMode::Sequential => self.contexts.iter().map(clone_child).collect(),
            ConcurrencyMode::Rayon => self.contexts.par_iter().map(clone_child).collect(),
        };

        let mut clone = DiagramContext::with_concurrency(self.num_subsystems(), self.concurrency);
        clone.step_info = self.step_info;
        clone.cache = self.cache.clone();
        clone.contexts = contexts;
        clone.outputs = self.outputs.clone();
        clone.build_state();

        for (src, dest) in self.graph.connections() {
            let binding = clone.binding_from(src);
            clone
                .try_subsystem_context_mut(dest.system)
                .and_then(|context| context.rebind_input_port(dest.port, Some(binding)))
                .unwrap_or_else(|err| {
                    panic!("replaying connection {} -> {} on clone failed: {}", src, dest, err)
                });
            clone.record_connection(src, dest);
        }
        clone.input_ids = self.input_ids.clone();
        clone.input_tickets = self.input_tickets.clone();
        clone.output_ids = self.output_ids.clone();
        clone.phase = Phase::Sealed;

        debug!(
            "diagram {}: cloned into {} ({} connections replayed)",
            self.id,
            clone.id,
            self.graph.len()
        );
        Box::new(clone)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl DiagramContext {
    /// A write through the composite view is a state change of `system`:
    /// invalidate our own state lines and whatever reads that subsystem's
    /// outputs. The subsystem invalidates its own state lines itself.
    fn invalidate_composite_slot(&mut self, system: SystemIndex) {
        self.cache.invalidate(self.state_ticket);
        let outputs = self.outputs_of([system]);
        self.propagate_from(outputs);
    }
}
