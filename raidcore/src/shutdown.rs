// vim: tw=80
//! Teardown actions, run in the reverse order of their registration

use std::{fmt, panic::Location};

struct Entry {
    name: &'static str,
    location: &'static Location<'static>,
    action: Box<dyn FnOnce() + Send>,
}

/// A LIFO stack of cleanup actions.
///
/// Whatever is still registered when the list is dropped runs then.
#[derive(Default)]
pub struct ShutdownList {
    entries: Vec<Entry>,
}

impl ShutdownList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action.  The caller's source location is recorded for
    /// diagnostics.
    #[track_caller]
    pub fn push<F>(&mut self, name: &'static str, action: F)
        where F: FnOnce() + Send + 'static
    {
        let location = Location::caller();
        self.entries.push(Entry{name, location, action: Box::new(action)});
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run and discard every registered action, most recent first
    pub fn run(&mut self) {
        while let Some(e) = self.entries.pop() {
            tracing::debug!(name = e.name, registered_at = %e.location,
                            "shutdown action");
            (e.action)();
        }
    }
}

impl fmt::Debug for ShutdownList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.name, e.location)))
            .finish()
    }
}

impl Drop for ShutdownList {
    fn drop(&mut self) {
        self.run();
    }
}
