//! Engine behaviour through the CPU backend: scopes, disposal, backend
//! selection, NaN checks, variables and profiling.

use std::collections::HashMap;

use futures::executor::block_on;
use futures::future::{self, BoxFuture, FutureExt};
use tg_backend_cpu::{cpu_engine, cpu_engine_with, register, CpuBackend, CPU_BACKEND_NAME};
use tg_tensor::prelude::*;
use tg_tensor::{BackendError, DataId, MemoryInfo};

fn engine() -> Engine {
    cpu_engine().unwrap()
}

/// Engine and backend agree on how many buffers are alive.
fn assert_no_orphaned_buffers(e: &Engine) {
    let backend_buffers = e.with_backend(|b| b.num_data_ids()).unwrap();
    assert_eq!(backend_buffers, e.memory().num_data_buffers);
}

// ============================================================================
// Scopes
// ============================================================================

#[test]
fn test_tidy_releases_intermediates() {
    let e = engine();
    let a = e.tensor1d(&[2.0, 3.0, -1.0]).unwrap();
    let b = e.zeros([3]).unwrap();
    let before = e.memory().num_tensors;

    let out = e
        .tidy(|| {
            let mut b = b.clone();
            for _ in 0..3 {
                b = e.add_strict(&a, &b)?;
            }
            e.add(&a, &b)
        })
        .unwrap();

    assert_eq!(e.to_vec(&out).unwrap(), vec![8.0, 12.0, -4.0]);
    assert_eq!(e.memory().num_tensors, before + 1);
    assert_no_orphaned_buffers(&e);
}

#[test]
fn test_tidy_balances_on_error() {
    let e = engine();
    let before = e.memory();
    let depth = e.scope_depth();

    let result: Result<Tensor> = e.tidy(|| {
        e.ones([4])?;
        e.start_scope("left open");
        e.ones([2])?;
        Err(Error::UnknownVariable("missing".to_string()))
    });

    assert!(matches!(result, Err(Error::UnknownVariable(_))));
    assert_eq!(e.memory(), before);
    assert_eq!(e.scope_depth(), depth);
}

#[test]
fn test_tidy_keeps_nested_results() {
    let e = engine();
    let before = e.memory().num_tensors;

    let (sum, parts) = e
        .tidy(|| {
            let parts = e.tidy(|| Ok(vec![e.ones([2])?, e.zeros([2])?]))?;
            let sum = e.add(&parts[0], &parts[1])?;
            e.square(&sum)?;
            Ok((sum, parts))
        })
        .unwrap();

    assert_eq!(e.memory().num_tensors, before + 3);
    assert_eq!(e.to_vec(&sum).unwrap(), vec![1.0, 1.0]);
    assert!(e.is_alive(&parts[1]));
}

#[test]
fn test_tidy_closes_scopes_left_open() {
    let e = engine();
    let before = e.memory().num_tensors;
    let out = e
        .tidy(|| {
            e.start_scope("forgotten");
            e.ones([3])?;
            e.ones([2])
        })
        .unwrap();
    assert!(e.is_alive(&out));
    assert_eq!(e.memory().num_tensors, before + 1);
    assert_eq!(e.scope_depth(), 1);
}

#[test]
fn test_manual_scopes() {
    let e = engine();
    e.start_scope("manual");
    let tmp = e.ones([2]).unwrap();
    let result = e.add(&tmp, &tmp).unwrap();
    e.end_scope(&result).unwrap();

    assert!(!e.is_alive(&tmp));
    assert_eq!(e.to_vec(&result).unwrap(), vec![2.0, 2.0]);

    // the root scope cannot be closed
    assert!(matches!(e.end_scope(&()), Err(Error::InvalidArgument { .. })));
}

#[test]
fn test_keep_survives_tidy() {
    let e = engine();
    let mut kept = None;

    e.tidy(|| {
        e.tidy(|| {
            let t = e.tensor1d(&[1.0, 2.0])?;
            kept = Some(e.keep(&t)?);
            e.ones([5])?;
            Ok(())
        })
    })
    .unwrap();

    let kept = kept.unwrap();
    assert!(e.is_alive(&kept));
    assert_eq!(e.to_vec(&kept).unwrap(), vec![1.0, 2.0]);
    assert_eq!(e.memory().num_tensors, 1);

    e.dispose(&kept).unwrap();
    assert_eq!(e.memory(), MemoryInfo::default());
}

#[test]
fn test_keep_is_idempotent() {
    let e = engine();
    let mut kept = None;

    e.tidy(|| {
        let t = e.ones([3])?;
        e.keep(&t)?;
        kept = Some(e.keep(&t)?);
        Ok(())
    })
    .unwrap();

    let kept = kept.unwrap();
    assert_eq!(e.memory().num_tensors, 1);
    e.dispose(&kept).unwrap();
    assert_eq!(e.memory(), MemoryInfo::default());
    assert_eq!(e.dispose(&kept), Err(Error::AlreadyDisposed { id: kept.id() }));
}

// ============================================================================
// Disposal
// ============================================================================

#[test]
fn test_dispose_releases_storage() {
    let e = engine();
    let a = e.ones([4]).unwrap();
    let b = e.zeros([2, 2]).unwrap();
    assert_eq!(e.memory().num_bytes, 32);

    e.dispose(&vec![a.clone(), b.clone(), a.clone()]).unwrap();
    assert_eq!(e.memory(), MemoryInfo::default());
    assert_no_orphaned_buffers(&e);
}

#[test]
fn test_double_dispose_fails() {
    let e = engine();
    let a = e.ones([2]).unwrap();
    let b = e.ones([2]).unwrap();
    e.dispose(&a).unwrap();

    assert_eq!(e.dispose(&a), Err(Error::AlreadyDisposed { id: a.id() }));
    // nothing in a failed batch is released
    assert!(e.dispose(&(b.clone(), a.clone())).is_err());
    assert!(e.is_alive(&b));
}

#[test]
fn test_disposed_tensor_is_unusable() {
    let e = engine();
    let a = e.ones([2]).unwrap();
    e.dispose(&a).unwrap();

    assert!(matches!(e.add(&a, &a), Err(Error::DisposedTensor { .. })));
    assert!(matches!(e.to_vec(&a), Err(Error::DisposedTensor { .. })));
    assert!(matches!(e.keep(&a), Err(Error::DisposedTensor { .. })));
    assert!(matches!(block_on(e.data(&a)), Err(Error::DisposedTensor { .. })));
}

#[test]
fn test_reset() {
    let e = engine();
    let t = e.ones([3]).unwrap();
    e.variable(&t, Some("w"), true).unwrap();
    e.start_scope("open");
    e.ones([2]).unwrap();

    e.reset().unwrap();
    assert_eq!(e.memory(), MemoryInfo::default());
    assert_eq!(e.scope_depth(), 1);
    assert!(e.registered_variables().is_empty());
    assert_no_orphaned_buffers(&e);
}

// ============================================================================
// Backends
// ============================================================================

fn failing_factory() -> std::result::Result<Box<dyn KernelBackend>, BackendError> {
    Err(BackendError::Init {
        backend: "gpu".to_string(),
        reason: "no device".to_string(),
    })
}

#[test]
fn test_backend_fallback() {
    let mut registry = BackendRegistry::new();
    registry.register("gpu", 100, failing_factory);
    assert!(register(&mut registry));
    assert!(!register(&mut registry));

    let e = Engine::new(registry, EngineConfig::default()).unwrap();
    assert_eq!(e.backend_name(), CPU_BACKEND_NAME);
    assert!(!e.find_backend("gpu"));
    assert!(matches!(e.set_backend("gpu"), Err(Error::UnknownBackend(_))));

    let t = e.tensor1d(&[1.0, 2.0]).unwrap();
    assert_eq!(e.to_vec(&t).unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_no_backend() {
    let mut registry = BackendRegistry::new();
    registry.register("gpu", 100, failing_factory);
    assert!(matches!(
        Engine::new(registry, EngineConfig::default()),
        Err(Error::NoBackend)
    ));

    assert!(matches!(
        cpu_engine_with(EngineConfig::new().with_backend("tpu")),
        Err(Error::UnknownBackend(_))
    ));
}

#[test]
fn test_forced_backend_skips_priority() {
    let mut registry = BackendRegistry::new();
    registry.register("fast", 10, || Ok(Box::new(CpuBackend::new()) as Box<dyn KernelBackend>));
    register(&mut registry);

    let e = Engine::new(registry, EngineConfig::new().with_backend(CPU_BACKEND_NAME)).unwrap();
    assert_eq!(e.backend_name(), CPU_BACKEND_NAME);
}

#[test]
fn test_switch_backend_requires_no_live_data() {
    let mut registry = BackendRegistry::new();
    register(&mut registry);
    registry.register("cpu-alt", 0, || Ok(Box::new(CpuBackend::new()) as Box<dyn KernelBackend>));
    let e = Engine::new(registry, EngineConfig::default()).unwrap();
    assert_eq!(e.backend_name(), CPU_BACKEND_NAME);

    let t = e.ones([2]).unwrap();
    assert_eq!(
        e.set_backend("cpu-alt"),
        Err(Error::BackendInUse {
            backend: CPU_BACKEND_NAME.to_string(),
            live: 1,
        })
    );

    e.dispose(&t).unwrap();
    e.set_backend("cpu-alt").unwrap();
    assert_eq!(e.backend_name(), "cpu-alt");
    let t = e.ones([2]).unwrap();
    assert_eq!(e.to_vec(&t).unwrap(), vec![1.0, 1.0]);
}

/// Storage-only backend whose data is never synchronously readable.
#[derive(Default)]
struct StagedBackend {
    buffers: HashMap<DataId, TensorValues>,
    /// Number of upcoming `dispose_data` calls that fail.
    failing_disposals: usize,
}

impl KernelBackend for StagedBackend {
    fn name(&self) -> &str {
        "staged"
    }

    fn allocate(&mut self, _shape: &Shape, _dtype: DType) -> std::result::Result<DataId, BackendError> {
        Ok(DataId::next())
    }

    fn write(&mut self, data_id: DataId, values: TensorValues) -> std::result::Result<(), BackendError> {
        self.buffers.insert(data_id, values);
        Ok(())
    }

    fn read(&self, data_id: DataId) -> BoxFuture<'static, std::result::Result<TensorValues, BackendError>> {
        let values = self
            .buffers
            .get(&data_id)
            .cloned()
            .ok_or(BackendError::UnknownData(data_id));
        future::ready(values).boxed()
    }

    fn read_sync(&self, data_id: DataId) -> std::result::Result<TensorValues, BackendError> {
        Err(BackendError::DataPending(data_id))
    }

    fn dispose_data(&mut self, data_id: DataId) -> std::result::Result<(), BackendError> {
        if self.failing_disposals > 0 {
            self.failing_disposals -= 1;
            return Err(BackendError::InvalidInput {
                backend: "staged".to_string(),
                kernel: "Dispose",
                reason: "device lost".to_string(),
            });
        }
        self.buffers
            .remove(&data_id)
            .map(|_| ())
            .ok_or(BackendError::UnknownData(data_id))
    }

    fn num_data_ids(&self) -> usize {
        self.buffers.len()
    }
}

#[test]
fn test_pending_data_and_missing_kernels() {
    let mut registry = BackendRegistry::new();
    registry.register("staged", 5, || Ok(Box::new(StagedBackend::default()) as Box<dyn KernelBackend>));
    let e = Engine::new(registry, EngineConfig::default()).unwrap();
    assert_eq!(e.backend_name(), "staged");

    let t = e.tensor1d(&[1.0, 2.0]).unwrap();
    let before = e.memory();
    assert_eq!(
        e.read_sync(&t),
        Err(Error::Backend(BackendError::DataPending(t.data_id())))
    );
    assert_eq!(block_on(e.data(&t)).unwrap(), TensorValues::Float32(vec![1.0, 2.0]));

    assert_eq!(
        e.exp(&t),
        Err(Error::Backend(BackendError::UnsupportedKernel {
            backend: "staged".to_string(),
            kernel: "Exp",
        }))
    );
    assert_eq!(e.memory(), before);

    e.dispose(&t).unwrap();
    assert_no_orphaned_buffers(&e);
}

#[test]
fn test_scope_exit_survives_dispose_failure() {
    let mut registry = BackendRegistry::new();
    registry.register("staged", 5, || {
        let backend = StagedBackend {
            failing_disposals: 1,
            ..Default::default()
        };
        Ok(Box::new(backend) as Box<dyn KernelBackend>)
    });
    let e = Engine::new(registry, EngineConfig::default()).unwrap();

    let result = e.tidy(|| {
        for v in [1.0, 2.0, 3.0] {
            e.tensor1d(&[v])?;
        }
        Ok(())
    });

    assert!(matches!(
        result,
        Err(Error::Backend(BackendError::InvalidInput { kernel: "Dispose", .. }))
    ));
    // the other two tensors are still released and the frame is gone
    assert_eq!(e.memory(), MemoryInfo::default());
    assert_eq!(e.scope_depth(), 1);
    assert_eq!(e.with_backend(|b| b.num_data_ids()).unwrap(), 1);
}

#[test]
fn test_async_read() {
    let e = engine();
    let t = e.tensor1d(&[1.5, -2.0]).unwrap();
    let values = block_on(e.data(&t)).unwrap();
    assert_eq!(values, TensorValues::Float32(vec![1.5, -2.0]));

    let i = e.tensor(vec![3, 4], [2]).unwrap();
    assert_eq!(block_on(e.data(&i)).unwrap(), TensorValues::Int32(vec![3, 4]));
}

#[test]
fn test_dtype_checks() {
    let e = engine();
    let f = e.ones([2]).unwrap();
    let i = e.tensor(vec![1, 2], [2]).unwrap();
    assert!(matches!(e.add(&f, &i), Err(Error::DTypeMismatch { .. })));
    assert!(matches!(e.exp(&i), Err(Error::DTypeMismatch { .. })));

    let as_float = e.cast(&i, DType::Float32).unwrap();
    assert_eq!(e.to_vec(&e.add(&f, &as_float).unwrap()).unwrap(), vec![2.0, 3.0]);

    assert!(matches!(
        e.tensor(vec![1.0f32, 2.0, 3.0], [2, 2]),
        Err(Error::ShapeMismatch { .. })
    ));
}

// ============================================================================
// Debug mode
// ============================================================================

#[test]
fn test_nan_detection_fails_kernel() {
    let e = cpu_engine_with(EngineConfig::new().with_debug(true).with_fail_on_nan(true)).unwrap();
    let x = e.tensor1d(&[1.0, -1.0]).unwrap();
    let before = e.memory();

    let err = e.log(&x).unwrap_err();
    assert_eq!(err, Error::NanDetected { kernel: "Log".to_string() });
    assert_eq!(e.memory(), before);
    assert_no_orphaned_buffers(&e);

    // finite results pass
    assert!(e.exp(&x).is_ok());
}

#[test]
fn test_nan_is_reported_without_failing() {
    let e = cpu_engine_with(EngineConfig::new().with_debug(true)).unwrap();
    let x = e.tensor1d(&[-4.0]).unwrap();
    let (out, info) = e.profile(|| e.sqrt(&x)).unwrap();
    assert!(e.to_vec(&out).unwrap()[0].is_nan());
    assert_eq!(info.kernels.len(), 1);
    assert!(info.kernels[0].has_nan);
}

// ============================================================================
// Variables
// ============================================================================

#[test]
fn test_variable_lifecycle() {
    let e = engine();
    let init = e.tensor1d(&[1.0, 2.0]).unwrap();
    let w = e.variable(&init, Some("w"), true).unwrap();
    assert_eq!(w.name(), "w");

    // the variable shares the initial value's storage
    assert_eq!(e.memory().num_tensors, 2);
    assert_eq!(e.memory().num_data_buffers, 1);
    e.dispose(&init).unwrap();

    let old = e.read_variable(&w).unwrap();
    assert_eq!(e.to_vec(&old).unwrap(), vec![1.0, 2.0]);

    e.tidy(|| {
        let next = e.tensor1d(&[5.0, 6.0])?;
        e.assign(&w, &next)
    })
    .unwrap();

    assert_eq!(e.to_vec(&e.read_variable(&w).unwrap()).unwrap(), vec![5.0, 6.0]);
    assert!(matches!(e.to_vec(&old), Err(Error::DisposedTensor { .. })));
    assert_eq!(e.memory().num_data_buffers, 1);

    let wrong = e.zeros([3]).unwrap();
    assert!(matches!(e.assign(&w, &wrong), Err(Error::ShapeMismatch { .. })));

    assert!(matches!(
        e.variable(&wrong, Some("w"), true),
        Err(Error::VariableExists(_))
    ));

    e.dispose_variable(&w).unwrap();
    assert!(e.find_variable("w").is_none());
    assert!(matches!(e.read_variable(&w), Err(Error::UnknownVariable(_))));
}

#[test]
fn test_variable_names_are_generated() {
    let e = engine();
    let t = e.ones([1]).unwrap();
    let a = e.variable(&t, None, true).unwrap();
    let b = e.variable(&t, None, false).unwrap();
    assert_ne!(a.name(), b.name());
    assert_eq!(e.registered_variables().len(), 2);
    e.dispose_variables().unwrap();
    assert!(e.registered_variables().is_empty());
}

#[test]
fn test_variable_grads_uses_trainable_variables() {
    let e = engine();
    let w = e.variable(&e.tensor1d(&[1.0, -2.0]).unwrap(), Some("w"), true).unwrap();
    let frozen = e.variable(&e.tensor1d(&[3.0]).unwrap(), Some("frozen"), false).unwrap();

    let result = e
        .variable_grads(
            || {
                let w = e.read_variable(&w)?;
                let f = e.read_variable(&frozen)?;
                e.sum(&e.mul(&e.square(&w)?, &f)?, None, false)
            },
            None,
        )
        .unwrap();

    assert_eq!(e.item(&result.value).unwrap(), 15.0);
    assert_eq!(result.grads.len(), 1);
    assert_eq!(e.to_vec(&result.grads["w"]).unwrap(), vec![6.0, -12.0]);

    let explicit = e
        .variable_grads(
            || e.sum(&e.read_variable(&frozen)?, None, false),
            Some(&[frozen.clone()]),
        )
        .unwrap();
    assert_eq!(e.to_vec(&explicit.grads["frozen"]).unwrap(), vec![1.0]);
}

// ============================================================================
// Profiling
// ============================================================================

#[test]
fn test_time_disposes_everything() {
    let e = engine();
    let a = e.ones([8, 8]).unwrap();
    let before = e.memory();

    let timing = e.time(|| e.matmul(&a, &a, false, false)).unwrap();
    assert!(timing.kernel_ms >= 0.0);
    assert!(timing.wall_ms >= timing.kernel_ms);
    assert_eq!(e.memory(), before);
}

#[test]
fn test_profile_counts_kernels_and_memory() {
    let e = engine();
    let (out, info) = e
        .profile(|| {
            let a = e.ones([4])?;
            e.tidy(|| {
                let b = e.add(&a, &a)?;
                e.mul(&b, &b)
            })
        })
        .unwrap();

    let kernels: Vec<&str> = info.kernels.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(kernels, vec!["Fill", "Add", "Mul"]);
    assert_eq!(info.new_tensors, 2);
    assert_eq!(info.new_bytes, 32);
    assert_eq!(info.peak_bytes, 48);
    assert_eq!(e.to_vec(&out).unwrap(), vec![4.0; 4]);
}
