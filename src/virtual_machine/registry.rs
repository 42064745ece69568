//! Liveness registry and the supervisor that runs VMs on their own threads.
//!
//! Every loaded VM is entered in a shared [`Registry`] and removed when its
//! [`Registration`] guard drops. The guard travels with the VM into its
//! thread, so the entry disappears on halt, fault, panic, or when a handle is
//! discarded without ever being run.

use crate::config::RunConfig;
use crate::virtual_machine::errors::{LoadError, VMError};
use crate::virtual_machine::program::{Program, read_program_file};
use crate::virtual_machine::vm::{ExitStatus, FinalState, RegisterSnapshot, VM};
use crate::{debug, info, warn};
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Unique identifier assigned to each registered VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(u64);

impl VmId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm-{}", self.0)
    }
}

/// Set of live VMs, safe to mutate from every VM thread at once.
#[derive(Debug, Default)]
pub struct Registry {
    live: DashMap<VmId, String>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new live VM and returns the guard that removes it again.
    pub fn register(self: &Arc<Self>, name: &str) -> Registration {
        let id = VmId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live.insert(id, name.to_string());
        Registration {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Removes `id`. Returns false if it was not registered.
    pub fn unregister(&self, id: VmId) -> bool {
        self.live.remove(&id).is_some()
    }

    pub fn contains(&self, id: VmId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Names of the live VMs in registration order.
    pub fn live_names(&self) -> Vec<String> {
        let mut entries: Vec<(VmId, String)> = self
            .live
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, name)| name).collect()
    }
}

/// Registry membership of one VM. Dropping it unregisters the VM.
#[derive(Debug)]
pub struct Registration {
    id: VmId,
    registry: Arc<Registry>,
}

impl Registration {
    pub fn id(&self) -> VmId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// A loaded, registered VM that has not started yet.
pub struct VmHandle {
    registration: Registration,
    vm: VM,
}

impl VmHandle {
    pub fn id(&self) -> VmId {
        self.registration.id()
    }

    pub fn name(&self) -> &str {
        self.vm.name()
    }

    pub fn program(&self) -> &Program {
        self.vm.program()
    }
}

/// A VM executing on its own thread.
pub struct RunningVm {
    id: VmId,
    name: String,
    thread: Result<JoinHandle<FinalState>, VMError>,
}

impl RunningVm {
    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the VM to stop. A panic on its thread becomes a
    /// [`VMError::ThreadPanicked`] fault.
    pub fn join(self) -> FinalState {
        let err = match self.thread {
            Ok(handle) => match handle.join() {
                Ok(state) => return state,
                Err(payload) => VMError::ThreadPanicked {
                    reason: panic_reason(&*payload),
                },
            },
            Err(err) => err,
        };
        warn!("{}: {}", self.name, err);
        aborted(self.name, err)
    }
}

/// Loads programs and runs each one on a dedicated OS thread.
///
/// The registry, run configuration and cancellation flag are handed to every
/// VM explicitly; nothing is global.
pub struct Supervisor {
    registry: Arc<Registry>,
    config: RunConfig,
    cancel: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: RunConfig) -> Self {
        Self::with_registry(Arc::new(Registry::new()), config)
    }

    pub fn with_registry(registry: Arc<Registry>, config: RunConfig) -> Self {
        Self {
            registry,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> RunConfig {
        self.config
    }

    /// Compiles `bytes` and registers a VM for it.
    ///
    /// A trailing partial record is zero-padded and logged, not rejected.
    pub fn load(&self, bytes: &[u8], name: impl Into<String>) -> Result<VmHandle, LoadError> {
        let name = name.into();
        if bytes.is_empty() {
            return Err(LoadError::EmptyInput { name });
        }

        let compiled = Program::compile(bytes);
        if let Some(warning) = compiled.warning {
            warn!("{}: {}", name, warning);
        }

        let registration = self.registry.register(&name);
        info!(
            "{}: loaded {} instructions as {}",
            name,
            compiled.program.len(),
            registration.id()
        );
        let vm = VM::new(name, compiled.program)
            .with_config(self.config)
            .with_cancel_flag(Arc::clone(&self.cancel));
        Ok(VmHandle { registration, vm })
    }

    /// Reads a program file and loads it under its path.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<VmHandle, LoadError> {
        let path = path.as_ref();
        let bytes = read_program_file(path)?;
        self.load(&bytes, path.display().to_string())
    }

    /// Starts `handle` on a new thread named after its [`VmId`].
    ///
    /// The VM name is caller-supplied and may hold bytes a thread name
    /// cannot, so only the id is given to the OS.
    pub fn spawn(&self, handle: VmHandle) -> RunningVm {
        let id = handle.id();
        let name = handle.name().to_string();
        debug!("{}: starting as {}", name, id);

        let thread = thread::Builder::new()
            .name(id.to_string())
            .spawn(move || {
                let VmHandle {
                    registration,
                    mut vm,
                } = handle;
                let state = vm.run();
                drop(registration);
                state
            })
            .map_err(|e| VMError::SpawnFailed {
                reason: e.to_string(),
            });

        RunningVm { id, name, thread }
    }

    /// Runs every handle concurrently and waits for all of them.
    ///
    /// Results are in the same order as `handles`.
    pub fn run_all(&self, handles: Vec<VmHandle>) -> Vec<FinalState> {
        let count = handles.len();
        let running: Vec<RunningVm> = handles.into_iter().map(|h| self.spawn(h)).collect();
        let states: Vec<FinalState> = running.into_iter().map(RunningVm::join).collect();

        let halted = states.iter().filter(|s| s.status.is_halted()).count();
        info!(
            "{} of {} programs halted, {} faulted",
            halted,
            count,
            count - halted
        );
        states
    }

    /// Asks every VM started by this supervisor to stop at its next step.
    ///
    /// The flag stays set: VMs loaded or spawned afterwards stop with
    /// [`VMError::Cancelled`] before their first instruction until
    /// [`Supervisor::reset_cancel`] clears it.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Clears a previous [`Supervisor::cancel`] so new VMs run normally.
    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Final state for a VM whose thread never reported back.
fn aborted(name: String, err: VMError) -> FinalState {
    FinalState {
        name,
        registers: RegisterSnapshot::default(),
        ip: 0,
        status: ExitStatus::Faulted(err),
        steps: 0,
        unknown_opcodes: 0,
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
