//! Instrumented collaborators for host-side tests.
//!
//! Available under `cfg(test)` and with the `mock` feature. Clones of a
//! [`MockBackend`] share state, so a test can keep one clone to inspect
//! while the channel owns the other.

#![cfg(any(test, feature = "mock"))]

use crate::backend::PwmBackend;
use crate::endpoint::FileOperations;
use crate::error::{BackendError, RegistrationError};
use crate::registry::{ClassId, MemoryRegistry, NodeFile, NodeId, RegionId, Registry};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

/// A successful collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request(u8),
    Configure { on_time_ns: u64, period_ns: u64 },
    Enable,
    Disable,
    Free(u8),
    AllocRegion,
    ReleaseRegion,
    CreateClass,
    DestroyClass,
    CreateNode,
    DestroyNode,
}

/// Ordered event log shared between mock collaborators.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn record(&self, event: Event) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

#[derive(Debug, Default)]
struct BackendState {
    taken: HashSet<u8>,
    output_enabled: bool,
    last_on_time_ns: Option<u64>,
    reject_configure: bool,
    reject_enable: bool,
}

/// Lets a test park one `configure` call mid-flight.
#[derive(Debug, Default)]
struct Gate {
    armed: bool,
    entered: bool,
    open: bool,
}

#[derive(Debug)]
pub struct MockHandle {
    channel: u8,
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    channels: u8,
    journal: Journal,
    state: Arc<Mutex<BackendState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    gate: Arc<(Mutex<Gate>, Condvar)>,
}

impl MockBackend {
    /// Backend exposing channels 0..4.
    pub fn new() -> Self {
        Self::with_journal(Journal::default())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            channels: 4,
            journal,
            state: Arc::default(),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
            gate: Arc::default(),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn events(&self) -> Vec<Event> {
        self.journal.events()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.journal.count(pred)
    }

    /// Channels requested and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.lock().taken.len()
    }

    pub fn output_enabled(&self) -> bool {
        self.lock().output_enabled
    }

    pub fn last_on_time_ns(&self) -> Option<u64> {
        self.lock().last_on_time_ns
    }

    pub fn max_concurrent_configures(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reject_configure(&self, reject: bool) {
        self.lock().reject_configure = reject;
    }

    pub fn reject_enable(&self, reject: bool) {
        self.lock().reject_enable = reject;
    }

    /// Block the next `configure` until [`release_configure`](Self::release_configure).
    pub fn hold_next_configure(&self) {
        let (gate, _) = &*self.gate;
        *gate.lock().unwrap_or_else(PoisonError::into_inner) = Gate {
            armed: true,
            ..Gate::default()
        };
    }

    /// Wait until a held `configure` has been entered.
    pub fn wait_configure_held(&self) {
        let (gate, cvar) = &*self.gate;
        let mut gate = gate.lock().unwrap_or_else(PoisonError::into_inner);
        while !gate.entered {
            gate = cvar.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn release_configure(&self) {
        let (gate, cvar) = &*self.gate;
        gate.lock().unwrap_or_else(PoisonError::into_inner).open = true;
        cvar.notify_all();
    }

    fn pass_gate(&self) {
        let (gate, cvar) = &*self.gate;
        let mut gate = gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !gate.armed {
            return;
        }
        gate.armed = false;
        gate.entered = true;
        cvar.notify_all();
        while !gate.open {
            gate = cvar.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PwmBackend for MockBackend {
    type Handle = MockHandle;

    fn request(&mut self, channel: u8) -> Option<MockHandle> {
        if channel >= self.channels || !self.lock().taken.insert(channel) {
            return None;
        }
        self.journal.record(Event::Request(channel));
        Some(MockHandle { channel })
    }

    fn configure(
        &mut self,
        _handle: &mut MockHandle,
        on_time_ns: u64,
        period_ns: u64,
    ) -> Result<(), BackendError> {
        self.pass_gate();
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        thread::yield_now();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        if state.reject_configure || on_time_ns > period_ns {
            return Err(BackendError::TimingRejected {
                on_time_ns,
                period_ns,
            });
        }
        state.last_on_time_ns = Some(on_time_ns);
        drop(state);
        self.journal.record(Event::Configure {
            on_time_ns,
            period_ns,
        });
        Ok(())
    }

    fn enable(&mut self, _handle: &mut MockHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.reject_enable {
            return Err(BackendError::Failed("enable refused".into()));
        }
        state.output_enabled = true;
        drop(state);
        self.journal.record(Event::Enable);
        Ok(())
    }

    fn disable(&mut self, _handle: &mut MockHandle) {
        self.lock().output_enabled = false;
        self.journal.record(Event::Disable);
    }

    fn free(&mut self, handle: MockHandle) {
        self.lock().taken.remove(&handle.channel);
        self.journal.record(Event::Free(handle.channel));
    }
}

/// Registration step a [`FaultyRegistry`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStep {
    Region,
    Class,
    Node,
}

/// [`MemoryRegistry`] with injectable failures and journaling.
#[derive(Default)]
pub struct FaultyRegistry {
    inner: MemoryRegistry,
    journal: Journal,
    fail_create: Mutex<Option<RegistryStep>>,
    fail_destroy: Mutex<Option<RegistryStep>>,
}

impl FaultyRegistry {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn fail_create(&self, step: RegistryStep) {
        *self.fail_create.lock().unwrap_or_else(PoisonError::into_inner) = Some(step);
    }

    pub fn fail_destroy(&self, step: RegistryStep) {
        *self.fail_destroy.lock().unwrap_or_else(PoisonError::into_inner) = Some(step);
    }

    pub fn inner(&self) -> &MemoryRegistry {
        &self.inner
    }

    pub fn open(&self, name: &str) -> Option<NodeFile> {
        self.inner.open(name)
    }

    fn check(slot: &Mutex<Option<RegistryStep>>, step: RegistryStep) -> Result<(), RegistrationError> {
        match *slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(failing) if failing == step => {
                Err(RegistrationError::Failed(format!("injected {:?} fault", step)))
            }
            _ => Ok(()),
        }
    }
}

impl Registry for FaultyRegistry {
    fn alloc_region(&self, name: &str) -> Result<RegionId, RegistrationError> {
        Self::check(&self.fail_create, RegistryStep::Region)?;
        let region = self.inner.alloc_region(name)?;
        self.journal.record(Event::AllocRegion);
        Ok(region)
    }

    fn release_region(&self, region: RegionId) -> Result<(), RegistrationError> {
        Self::check(&self.fail_destroy, RegistryStep::Region)?;
        self.inner.release_region(region)?;
        self.journal.record(Event::ReleaseRegion);
        Ok(())
    }

    fn create_class(&self, name: &str) -> Result<ClassId, RegistrationError> {
        Self::check(&self.fail_create, RegistryStep::Class)?;
        let class = self.inner.create_class(name)?;
        self.journal.record(Event::CreateClass);
        Ok(class)
    }

    fn destroy_class(&self, class: ClassId) -> Result<(), RegistrationError> {
        Self::check(&self.fail_destroy, RegistryStep::Class)?;
        self.inner.destroy_class(class)?;
        self.journal.record(Event::DestroyClass);
        Ok(())
    }

    fn create_node(
        &self,
        class: ClassId,
        region: RegionId,
        name: &str,
        ops: Arc<dyn FileOperations>,
    ) -> Result<NodeId, RegistrationError> {
        Self::check(&self.fail_create, RegistryStep::Node)?;
        let node = self.inner.create_node(class, region, name, ops)?;
        self.journal.record(Event::CreateNode);
        Ok(node)
    }

    fn destroy_node(&self, node: NodeId) -> Result<(), RegistrationError> {
        Self::check(&self.fail_destroy, RegistryStep::Node)?;
        self.inner.destroy_node(node)?;
        self.journal.record(Event::DestroyNode);
        Ok(())
    }
}
