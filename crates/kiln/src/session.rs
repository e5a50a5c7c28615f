use std::collections::HashMap;

use kiln_core::backend::Backend;
use kiln_core::error::Result;
use kiln_core::{bail, Error};

use crate::job::{Job, JobBuilder};

// Session — the registry of compiled jobs
//
// A session owns a device and every job compiled against it. It is an
// explicit value, not process-global state: code that needs a session is
// handed one, and two sessions cannot interfere.
//
// Comparison scenarios compile several jobs, run them, and must not leak
// compiled artifacts into the next scenario. `clear` drops everything;
// `scope` goes further and guarantees the drop even when the closure
// panics (a failed closeness assertion unwinds through it), so a failing
// scenario cannot poison the ones after it.

/// Execution context holding compiled jobs for one device.
#[derive(Debug)]
pub struct Session<B: Backend> {
    device: B::Device,
    jobs: HashMap<String, Job<B>>,
}

impl<B: Backend> Session<B> {
    pub fn new(device: B::Device) -> Self {
        Session {
            device,
            jobs: HashMap::new(),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Compile a job and register it under its name.
    ///
    /// Re-registering a name is refused: a stale job under the same name is
    /// exactly the state leak sessions exist to prevent. Clear first.
    pub fn compile(&mut self, builder: JobBuilder) -> Result<&Job<B>> {
        let name = builder.name().to_string();
        if self.jobs.contains_key(&name) {
            bail!("job '{}' is already compiled in this session", name);
        }
        let job = builder.build::<B>(self.device.clone())?;
        Ok(self.jobs.entry(name).or_insert(job))
    }

    /// Look up a compiled job.
    pub fn job(&self, name: &str) -> Result<&Job<B>> {
        self.jobs
            .get(name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))
    }

    /// Drop every compiled job and backend artifact.
    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run `f` against this session and clear it afterwards — also when `f`
    /// panics, so an assertion failure inside a scenario cannot leak
    /// compiled state into the next one.
    pub fn scope<R>(&mut self, f: impl FnOnce(&mut Session<B>) -> R) -> R {
        struct ClearOnDrop<'a, B: Backend>(&'a mut Session<B>);
        impl<B: Backend> Drop for ClearOnDrop<'_, B> {
            fn drop(&mut self) {
                self.0.clear();
            }
        }
        let mut guard = ClearOnDrop(self);
        f(&mut *guard.0)
    }
}
