use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::{PortIdentifier, PortIndex, SystemIndex};

/// Port-to-port wiring inside one diagram.
///
/// Kept in both directions: `forward` answers "which output feeds this
/// input", `inverse` answers "which inputs does this output feed". Ordered
/// maps keep replay order deterministic when a diagram is cloned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// dest input -> src output
    forward: BTreeMap<PortIdentifier, PortIdentifier>,
    /// src output -> dest inputs
    inverse: BTreeMap<PortIdentifier, Vec<PortIdentifier>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `src` feeds `dest`.
    ///
    /// An input has at most one source, so an existing edge into `dest` is
    /// dropped first. Returns the source it replaced, if any.
    pub fn add_connection(
        &mut self,
        src: PortIdentifier,
        dest: PortIdentifier,
    ) -> Option<PortIdentifier> {
        let previous = self.forward.insert(dest, src);
        if let Some(old_src) = previous {
            if let Some(targets) = self.inverse.get_mut(&old_src) {
                targets.retain(|target| *target != dest);
                if targets.is_empty() {
                    self.inverse.remove(&old_src);
                }
            }
        }
        self.inverse.entry(src).or_default().push(dest);
        previous
    }

    /// The output feeding `dest`
    pub fn source_of(&self, dest: PortIdentifier) -> Option<PortIdentifier> {
        self.forward.get(&dest).copied()
    }

    /// The inputs fed by `src`
    pub fn destinations_of(&self, src: PortIdentifier) -> &[PortIdentifier] {
        self.inverse.get(&src).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All edges as `(src, dest)`, ordered by destination.
    pub fn connections(&self) -> impl Iterator<Item = (PortIdentifier, PortIdentifier)> + '_ {
        self.forward.iter().map(|(dest, src)| (*src, *dest))
    }

    /// Whether a chain of wires leads from any output of subsystem `from` to
    /// an input of subsystem `to`.
    pub fn system_reaches(&self, from: SystemIndex, to: SystemIndex) -> bool {
        let mut visited = BTreeSet::from([from]);
        let mut worklist = vec![from];

        while let Some(system) = worklist.pop() {
            let outputs =
                PortIdentifier::new(system, 0)..=PortIdentifier::new(system, PortIndex::MAX);
            for dest in self.inverse.range(outputs).flat_map(|(_, dests)| dests) {
                if dest.system == to {
                    return true;
                }
                if visited.insert(dest.system) {
                    worklist.push(dest.system);
                }
            }
        }
        false
    }

    pub fn is_connected(&self, dest: PortIdentifier) -> bool {
        self.forward.contains_key(&dest)
    }

    /// Number of wired inputs
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
