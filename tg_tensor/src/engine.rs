//! The engine: one context object owning the active backend, the live-tensor
//! table, the scope stack, the gradient tape and the variable registry.
//!
//! Every operation goes through [`Engine::run_kernel`], which executes the
//! primitive on the active backend, records a tape node while gradients are
//! being recorded, and hands the output to the innermost scope.
//!
//! The engine is single-threaded: state lives in a `RefCell` and no borrow is
//! held across user callbacks or `.await` points.

use std::cell::{RefCell, RefMut};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;

use crate::backend::{BackendRegistry, KernelBackend, TensorInfo};
use crate::config::EngineConfig;
use crate::dtype::{DType, TensorValues};
use crate::error::{BackendResult, Error, Result};
use crate::profiler::{KernelProfile, Profiler};
use crate::scope::ScopeFrame;
use crate::shape::Shape;
use crate::tape::{GradFn, TapeNode};
use crate::tensor::{DataId, Tensor, TensorId, Variable};

/// Live-tensor bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct TensorRecord {
    pub data_id: DataId,
    pub shape: Shape,
    pub dtype: DType,
    /// Set when this id is a registered variable.
    pub variable: Option<String>,
}

/// Reference count for one storage buffer.
#[derive(Debug, Clone)]
pub(crate) struct DataRecord {
    pub ref_count: usize,
    pub bytes: usize,
}

/// Snapshot of engine memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    /// Live tensors, variables included.
    pub num_tensors: usize,
    /// Distinct storage buffers; aliased tensors share one.
    pub num_data_buffers: usize,
    pub num_bytes: usize,
}

pub(crate) struct EngineState {
    pub registry: BackendRegistry,
    pub backends: HashMap<String, Box<dyn KernelBackend>>,
    pub active: String,
    pub tensors: HashMap<TensorId, TensorRecord>,
    pub data: HashMap<DataId, DataRecord>,
    pub num_bytes: usize,
    next_tensor_id: u64,
    pub scopes: Vec<ScopeFrame>,
    pub tape: Vec<TapeNode>,
    /// How many tape nodes reference each tensor.
    pub tape_holds: HashMap<TensorId, usize>,
    pub gradient_depth: usize,
    /// Non-zero while a custom-gradient forward pass runs.
    pub tape_paused: usize,
    pub variables: Vec<Variable>,
    pub next_variable: u64,
    pub profiler: Profiler,
}

impl EngineState {
    fn new(registry: BackendRegistry, active: String, backend: Box<dyn KernelBackend>) -> Self {
        let mut backends = HashMap::new();
        backends.insert(active.clone(), backend);
        EngineState {
            registry,
            backends,
            active,
            tensors: HashMap::new(),
            data: HashMap::new(),
            num_bytes: 0,
            next_tensor_id: 0,
            scopes: vec![ScopeFrame::new("root")],
            tape: Vec::new(),
            tape_holds: HashMap::new(),
            gradient_depth: 0,
            tape_paused: 0,
            variables: Vec::new(),
            next_variable: 0,
            profiler: Profiler::default(),
        }
    }

    pub fn backend_mut(&mut self) -> Result<&mut (dyn KernelBackend + 'static)> {
        self.backends
            .get_mut(&self.active)
            .map(|b| b.as_mut())
            .ok_or_else(|| Error::UnknownBackend(self.active.clone()))
    }

    pub fn backend(&self) -> Result<&(dyn KernelBackend + 'static)> {
        self.backends
            .get(&self.active)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::UnknownBackend(self.active.clone()))
    }

    pub fn next_id(&mut self) -> TensorId {
        let id = TensorId(self.next_tensor_id);
        self.next_tensor_id += 1;
        id
    }

    /// Id the next registered tensor will get.
    pub(crate) fn peek_next_id(&self) -> TensorId {
        TensorId(self.next_tensor_id)
    }

    /// Fail unless `t` is alive and still points at its original storage.
    pub fn ensure_live(&self, t: &Tensor, op: &str) -> Result<()> {
        match self.tensors.get(&t.id) {
            Some(record) if record.data_id == t.data_id => Ok(()),
            _ => Err(Error::DisposedTensor {
                id: t.id,
                op: op.to_string(),
            }),
        }
    }

    pub fn acquire_data(&mut self, data_id: DataId, bytes: usize) {
        match self.data.entry(data_id) {
            Entry::Occupied(mut e) => e.get_mut().ref_count += 1,
            Entry::Vacant(e) => {
                e.insert(DataRecord {
                    ref_count: 1,
                    bytes,
                });
                self.num_bytes += bytes;
                self.profiler.observe_bytes(self.num_bytes);
            }
        }
    }

    /// Drop one reference; the backend releases storage when none remain.
    pub fn release_data(&mut self, data_id: DataId) -> Result<()> {
        let remaining = match self.data.get_mut(&data_id) {
            Some(record) => {
                record.ref_count -= 1;
                record.ref_count
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            if let Some(record) = self.data.remove(&data_id) {
                self.num_bytes -= record.bytes;
            }
            self.backend_mut()?.dispose_data(data_id)?;
        }
        Ok(())
    }

    /// Wrap kernel output in a new tensor tracked by the innermost scope.
    pub fn register_output(&mut self, info: TensorInfo) -> Tensor {
        let bytes = info.shape.numel() * info.dtype.byte_size();
        self.acquire_data(info.data_id, bytes);
        let id = self.next_id();
        self.tensors.insert(
            id,
            TensorRecord {
                data_id: info.data_id,
                shape: info.shape.clone(),
                dtype: info.dtype,
                variable: None,
            },
        );
        self.track(id);
        Tensor {
            id,
            shape: info.shape,
            dtype: info.dtype,
            data_id: info.data_id,
        }
    }

    /// Remove a live tensor and release its storage.
    pub fn dispose_tensor(&mut self, id: TensorId) -> Result<()> {
        let record = self
            .tensors
            .remove(&id)
            .ok_or(Error::AlreadyDisposed { id })?;
        if let Some(name) = &record.variable {
            self.variables.retain(|v| &v.name != name);
        }
        for frame in self.scopes.iter_mut().rev() {
            if frame.tracked.remove(&id) {
                break;
            }
        }
        self.release_data(record.data_id)
    }

    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.tensors.len(),
            num_data_buffers: self.data.len(),
            num_bytes: self.num_bytes,
        }
    }
}

/// Execution context for tensors, scopes and gradients.
pub struct Engine {
    config: EngineConfig,
    pub(crate) state: RefCell<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Engine")
            .field("backend", &state.active)
            .field("memory", &state.memory())
            .field("scope_depth", &state.scopes.len())
            .field("gradient_depth", &state.gradient_depth)
            .finish()
    }
}

impl Engine {
    /// Build an engine, initializing the best available backend.
    ///
    /// With `config.backend` set, only that backend is tried. Otherwise
    /// registered backends are tried by descending priority and the first
    /// that initializes wins.
    pub fn new(registry: BackendRegistry, config: EngineConfig) -> Result<Self> {
        let candidates = match &config.backend {
            Some(name) if !registry.contains(name) => {
                return Err(Error::UnknownBackend(name.clone()));
            }
            Some(name) => vec![name.clone()],
            None => registry.names_by_priority(),
        };

        let mut selected = None;
        for name in candidates {
            match registry.create(&name) {
                Ok(backend) => {
                    log::info!("using backend '{name}'");
                    selected = Some((name, backend));
                    break;
                }
                Err(err) => log::warn!("backend '{name}' unavailable: {err}"),
            }
        }

        let (name, backend) = match (selected, &config.backend) {
            (Some(selected), _) => selected,
            (None, Some(name)) => return Err(Error::UnknownBackend(name.clone())),
            (None, None) => return Err(Error::NoBackend),
        };

        Ok(Engine {
            config,
            state: RefCell::new(EngineState::new(registry, name, backend)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, EngineState> {
        self.state.borrow_mut()
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> String {
        self.state.borrow().active.clone()
    }

    /// Initialize `name` if needed and report whether it is usable.
    pub fn find_backend(&self, name: &str) -> bool {
        let mut state = self.state.borrow_mut();
        if state.backends.contains_key(name) {
            return true;
        }
        match state.registry.create(name) {
            Ok(backend) => {
                state.backends.insert(name.to_string(), backend);
                true
            }
            Err(err) => {
                log::warn!("backend '{name}' unavailable: {err}");
                false
            }
        }
    }

    /// Switch the active backend. Refused while data is alive on the
    /// current one, since storage is not migrated.
    pub fn set_backend(&self, name: &str) -> Result<()> {
        if !self.find_backend(name) {
            return Err(Error::UnknownBackend(name.to_string()));
        }
        let mut state = self.state.borrow_mut();
        if state.active == name {
            return Ok(());
        }
        if !state.data.is_empty() {
            return Err(Error::BackendInUse {
                backend: state.active.clone(),
                live: state.data.len(),
            });
        }
        log::info!("switching backend '{}' -> '{name}'", state.active);
        state.active = name.to_string();
        Ok(())
    }

    /// Inspect the active backend.
    pub fn with_backend<R>(&self, f: impl FnOnce(&dyn KernelBackend) -> R) -> Result<R> {
        let state = self.state.borrow();
        Ok(f(state.backend()?))
    }

    pub fn memory(&self) -> MemoryInfo {
        self.state.borrow().memory()
    }

    /// Whether `t` is alive.
    pub fn is_alive(&self, t: &Tensor) -> bool {
        self.state.borrow().ensure_live(t, "is_alive").is_ok()
    }

    /// Whether a gradient tape is currently recording kernels.
    pub fn is_recording(&self) -> bool {
        self.state.borrow().is_recording()
    }

    /// Dispatch a kernel to the active backend.
    ///
    /// `compute` must only allocate backend storage. While gradients are
    /// being recorded a tape node capturing `inputs`, the output and
    /// `gradient` is appended; the output is then tracked by the innermost
    /// scope. Inputs must be validated by the caller.
    pub fn run_kernel<F>(
        &self,
        kernel: &str,
        inputs: &[(&str, &Tensor)],
        compute: F,
        gradient: Option<GradFn>,
    ) -> Result<Tensor>
    where
        F: FnOnce(&mut dyn KernelBackend) -> BackendResult<TensorInfo>,
    {
        let mut state = self.state.borrow_mut();
        for (_, input) in inputs {
            state.ensure_live(input, kernel)?;
        }

        let timed = self.config.debug || state.profiler.is_active();
        let start = timed.then(Instant::now);
        let info = compute(state.backend_mut()?)?;

        if let Some(start) = start {
            let ms = start.elapsed().as_secs_f64() * 1e3;
            let check_nan = self.config.debug || state.profiler.has_session();
            let has_nan = check_nan && output_has_nan(state.backend()?, &info, kernel);
            log::debug!(
                "kernel {kernel}: {ms:.3}ms, output {} {}",
                info.shape,
                info.dtype
            );
            state.profiler.record_kernel(KernelProfile {
                name: kernel.to_string(),
                ms,
                output_shape: info.shape.clone(),
                output_bytes: info.shape.numel() * info.dtype.byte_size(),
                has_nan,
            });
            if has_nan {
                log::warn!("kernel '{kernel}' produced NaN");
                if self.config.debug && self.config.fail_on_nan {
                    if !state.data.contains_key(&info.data_id) {
                        state.backend_mut()?.dispose_data(info.data_id)?;
                    }
                    return Err(Error::NanDetected {
                        kernel: kernel.to_string(),
                    });
                }
            }
        }

        let output = state.register_output(info);
        if state.is_recording() {
            state.record(TapeNode {
                kernel: kernel.to_string(),
                inputs: inputs
                    .iter()
                    .map(|(name, t)| (name.to_string(), (*t).clone()))
                    .collect(),
                output: output.clone(),
                saved: Vec::new(),
                gradient,
            });
        }
        Ok(output)
    }

    /// Upload host values into a new tensor.
    pub fn tensor(&self, values: impl Into<TensorValues>, shape: impl Into<Shape>) -> Result<Tensor> {
        let values = values.into();
        let shape = shape.into();
        if values.len() != shape.numel() {
            return Err(Error::shape_mismatch(
                "tensor",
                format!("{} values for shape {shape}", shape.numel()),
                values.len(),
            ));
        }
        let dtype = values.dtype();
        let mut state = self.state.borrow_mut();
        let backend = state.backend_mut()?;
        let data_id = backend.allocate(&shape, dtype)?;
        if let Err(err) = backend.write(data_id, values) {
            backend.dispose_data(data_id)?;
            return Err(err.into());
        }
        Ok(state.register_output(TensorInfo::new(data_id, shape, dtype)))
    }

    pub fn scalar(&self, value: f32) -> Result<Tensor> {
        self.tensor(vec![value], Shape::scalar())
    }

    pub fn tensor1d(&self, values: &[f32]) -> Result<Tensor> {
        self.tensor(values.to_vec(), [values.len()])
    }

    pub fn tensor2d(&self, values: &[f32], rows: usize, cols: usize) -> Result<Tensor> {
        self.tensor(values.to_vec(), [rows, cols])
    }

    /// Read values without waiting on the device.
    pub fn read_sync(&self, t: &Tensor) -> Result<TensorValues> {
        let state = self.state.borrow();
        state.ensure_live(t, "read_sync")?;
        Ok(state.backend()?.read_sync(t.data_id)?)
    }

    /// Read values, waiting on the device if needed.
    pub async fn data(&self, t: &Tensor) -> Result<TensorValues> {
        let pending = {
            let state = self.state.borrow();
            state.ensure_live(t, "data")?;
            state.backend()?.read(t.data_id)
        };
        Ok(pending.await?)
    }

    /// Read values as `f32`.
    pub fn to_vec(&self, t: &Tensor) -> Result<Vec<f32>> {
        Ok(self.read_sync(t)?.to_f32_vec())
    }

    /// Read the single value of a one-element tensor.
    pub fn item(&self, t: &Tensor) -> Result<f32> {
        if t.numel() != 1 {
            return Err(Error::shape_mismatch("item", "one element", t.shape()));
        }
        Ok(self.to_vec(t)?[0])
    }

    /// Dispose every tensor and variable, clear the tape and scopes.
    /// Intended for test harnesses.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.tape.clear();
        state.tape_holds.clear();
        state.gradient_depth = 0;
        state.tape_paused = 0;
        state.scopes.truncate(1);
        state.scopes[0].tracked.clear();
        let ids: Vec<TensorId> = state.tensors.keys().copied().collect();
        for id in ids {
            state.dispose_tensor(id)?;
        }
        state.next_variable = 0;
        Ok(())
    }
}

fn output_has_nan(backend: &dyn KernelBackend, info: &TensorInfo, kernel: &str) -> bool {
    if info.dtype != DType::Float32 {
        return false;
    }
    match backend.read_sync(info.data_id) {
        Ok(values) => values.has_nan(),
        Err(err) => {
            log::debug!("skipping NaN check for '{kernel}': {err}");
            false
        }
    }
}
