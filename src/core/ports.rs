use super::types::{ContextId, PortIdentifier};
use super::values::TypedValue;

/// What is bound to one input port of a context.
#[derive(Debug, Clone)]
pub enum InputPort {
    /// A value supplied from outside, owned by the binding.
    Freestanding(TypedValue),
    /// A wire from an output port of a sibling subsystem.
    Dependent(DependentInputPort),
}

impl InputPort {
    pub fn freestanding<T: Send + Sync + Clone + 'static>(value: T) -> Self {
        InputPort::Freestanding(TypedValue::new(value))
    }
}

/// Handle to an output port, resolved through the diagram that owns it.
///
/// The handle never refers to the output directly. Only the diagram whose id
/// is `owner` can turn it into a value; any other context treats it as
/// unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependentInputPort {
    pub owner: ContextId,
    pub source: PortIdentifier,
}

/// Outcome of looking up the value on an input port.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedInput<'a> {
    Value(&'a TypedValue),
    /// Bound to an output of a diagram this context cannot see.
    Pending(DependentInputPort),
    Unconnected,
}

impl<'a> ResolvedInput<'a> {
    pub fn value(self) -> Option<&'a TypedValue> {
        match self {
            ResolvedInput::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Something that can turn a dependent binding into the value on its wire.
pub trait PortResolver: Sync {
    fn resolve(&self, port: &DependentInputPort) -> Option<&TypedValue>;
}

/// Resolver for contexts with no enclosing diagram.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl PortResolver for NoResolver {
    fn resolve(&self, _port: &DependentInputPort) -> Option<&TypedValue> {
        None
    }
}

/// Buffer for one output port of a subsystem.
#[derive(Debug, Clone, Default)]
pub struct OutputPort {
    value: Option<TypedValue>,
}

impl OutputPort {
    pub fn value(&self) -> Option<&TypedValue> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: TypedValue) {
        self.value = Some(value);
    }

    pub fn clear(&mut self) -> Option<TypedValue> {
        self.value.take()
    }
}

/// Output buffers of one subsystem, one per declared output port.
#[derive(Debug, Clone, Default)]
pub struct SystemOutput {
    ports: Vec<OutputPort>,
}

impl SystemOutput {
    pub fn new(num_ports: usize) -> Self {
        Self {
            ports: vec![OutputPort::default(); num_ports],
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn port(&self, index: usize) -> Option<&OutputPort> {
        self.ports.get(index)
    }

    pub fn port_mut(&mut self, index: usize) -> Option<&mut OutputPort> {
        self.ports.get_mut(index)
    }
}
