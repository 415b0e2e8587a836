use std::sync::Arc;

use log::trace;

use super::values::TypedValue;

/// Handle naming one memoized value and its fixed prerequisite set.
///
/// Tickets are issued densely from zero by one [`Cache`]. A cloned cache
/// accepts the same tickets as the cache it was cloned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheTicket(usize);

impl CacheTicket {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for CacheTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct CacheLine {
    value: Option<Arc<TypedValue>>,
    /// Tickets that list this one as a prerequisite.
    dependents: Vec<CacheTicket>,
}

/// Dependency-linked store of derived values for one context.
///
/// The cache only stores and invalidates. Deciding when a value must be
/// recomputed is the caller's job: a `None` from [`Cache::get`] means
/// "compute it and [`Cache::set`] it".
#[derive(Debug, Default)]
pub struct Cache {
    lines: Vec<CacheLine>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new line depending on every ticket in `prerequisites`.
    ///
    /// # Panics
    /// If a prerequisite was not issued by this cache.
    pub fn make_cache_ticket(&mut self, prerequisites: &[CacheTicket]) -> CacheTicket {
        let ticket = CacheTicket(self.lines.len());

        let mut prerequisites = prerequisites.to_vec();
        prerequisites.sort_unstable();
        prerequisites.dedup();
        for prerequisite in &prerequisites {
            assert!(
                prerequisite.0 < self.lines.len(),
                "cache ticket {} lists unknown prerequisite {}",
                ticket,
                prerequisite
            );
        }
        for prerequisite in prerequisites {
            self.lines[prerequisite.0].dependents.push(ticket);
        }

        self.lines.push(CacheLine::default());
        ticket
    }

    /// Store a freshly computed value, replacing any previous one.
    ///
    /// Nothing is invalidated: the caller asserts `value` is consistent with
    /// the current prerequisites.
    pub fn set(&mut self, ticket: CacheTicket, value: TypedValue) -> &TypedValue {
        let line = self.line_mut(ticket);
        &**line.value.insert(Arc::new(value))
    }

    /// The current value, or `None` if never set or invalidated since.
    pub fn get(&self, ticket: CacheTicket) -> Option<&TypedValue> {
        self.line(ticket).value.as_deref()
    }

    /// A shared handle to the current value.
    ///
    /// The handle keeps the value's storage alive after the line is
    /// invalidated. Only the logical validity is cleared by invalidation, so
    /// a caller holding the handle across an invalidation reads the old value.
    pub fn get_shared(&self, ticket: CacheTicket) -> Option<Arc<TypedValue>> {
        self.line(ticket).value.clone()
    }

    /// Replace the value and hand the previous one to the caller.
    pub fn swap(&mut self, ticket: CacheTicket, value: TypedValue) -> Option<TypedValue> {
        let line = self.line_mut(ticket);
        line.value
            .replace(Arc::new(value))
            .map(|previous| Arc::try_unwrap(previous).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn is_valid(&self, ticket: CacheTicket) -> bool {
        self.line(ticket).value.is_some()
    }

    /// Clear `ticket` and every ticket that transitively depends on it.
    ///
    /// Lines that are already empty are still traversed, so a dependent set
    /// after an earlier invalidation is cleared again.
    pub fn invalidate(&mut self, ticket: CacheTicket) {
        // Validate up front so an unknown ticket panics with a clear message.
        self.line(ticket);

        let mut visited = vec![false; self.lines.len()];
        let mut worklist = vec![ticket];
        visited[ticket.0] = true;

        while let Some(current) = worklist.pop() {
            let line = &mut self.lines[current.0];
            if line.value.take().is_some() {
                trace!("cache line {} invalidated", current);
            }
            for dependent in &line.dependents {
                if !visited[dependent.0] {
                    visited[dependent.0] = true;
                    worklist.push(*dependent);
                }
            }
        }
    }

    /// Number of tickets issued by this cache.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn line(&self, ticket: CacheTicket) -> &CacheLine {
        match self.lines.get(ticket.0) {
            Some(line) => line,
            None => panic!("unknown cache ticket {}", ticket),
        }
    }

    fn line_mut(&mut self, ticket: CacheTicket) -> &mut CacheLine {
        match self.lines.get_mut(ticket.0) {
            Some(line) => line,
            None => panic!("unknown cache ticket {}", ticket),
        }
    }
}

impl Clone for Cache {
    /// Deep copy: values are cloned, not shared, so the two caches never
    /// observe each other's writes.
    fn clone(&self) -> Self {
        let lines = self
            .lines
            .iter()
            .map(|line| CacheLine {
                value: line.value.as_ref().map(|value| Arc::new((**value).clone())),
                dependents: line.dependents.clone(),
            })
            .collect();
        Self { lines }
    }
}
