//! Memory scoping: `tidy`, `keep` and `dispose`.
//!
//! Every tensor produced by a kernel is tracked by the innermost open scope.
//! When a scope ends, tracked tensors that were returned move to the parent
//! scope, tensors still referenced by a live gradient tape move there too,
//! and everything else is disposed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::engine::{Engine, EngineState};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorId};

/// A frame on the scope stack.
#[derive(Debug, Clone)]
pub(crate) struct ScopeFrame {
    pub name: String,
    pub tracked: BTreeSet<TensorId>,
}

impl ScopeFrame {
    pub fn new(name: &str) -> Self {
        ScopeFrame {
            name: name.to_string(),
            tracked: BTreeSet::new(),
        }
    }
}

/// Anything that can hand out the tensors it contains.
///
/// Values returned from [`Engine::tidy`] and passed to [`Engine::dispose`]
/// implement this; containers recurse into their elements.
pub trait TensorContainer {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>);

    /// Convenience wrapper around [`collect_tensors`](Self::collect_tensors).
    fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }
}

impl TensorContainer for Tensor {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        out.push(self);
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for &T {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        (**self).collect_tensors(out);
    }
}

impl<T: TensorContainer> TensorContainer for [T] {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        for item in self {
            item.collect_tensors(out);
        }
    }
}

impl<T: TensorContainer, const N: usize> TensorContainer for [T; N] {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        self.as_slice().collect_tensors(out);
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        self.as_slice().collect_tensors(out);
    }
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        if let Some(item) = self {
            item.collect_tensors(out);
        }
    }
}

impl<K, T: TensorContainer> TensorContainer for BTreeMap<K, T> {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        for item in self.values() {
            item.collect_tensors(out);
        }
    }
}

impl<K, T: TensorContainer> TensorContainer for HashMap<K, T> {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        for item in self.values() {
            item.collect_tensors(out);
        }
    }
}

macro_rules! impl_container_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: TensorContainer),+> TensorContainer for ($($name,)+) {
            #[allow(non_snake_case)]
            fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
                let ($($name,)+) = self;
                $($name.collect_tensors(out);)+
            }
        }
    };
}

impl_container_for_tuple!(A);
impl_container_for_tuple!(A, B);
impl_container_for_tuple!(A, B, C);
impl_container_for_tuple!(A, B, C, D);

macro_rules! impl_container_for_plain {
    ($($ty:ty),+) => {
        $(impl TensorContainer for $ty {
            fn collect_tensors<'a>(&'a self, _out: &mut Vec<&'a Tensor>) {}
        })+
    };
}

impl_container_for_plain!((), bool, f32, f64, usize, i32, String);

impl EngineState {
    /// Track `id` in the innermost frame.
    pub(crate) fn track(&mut self, id: TensorId) {
        if let Some(frame) = self.scopes.last_mut() {
            frame.tracked.insert(id);
        }
    }

    pub(crate) fn push_scope(&mut self, name: &str) {
        log::trace!("enter scope '{name}' (depth {})", self.scopes.len());
        self.scopes.push(ScopeFrame::new(name));
    }

    /// Pop the innermost frame, moving `keep` and tape-held tensors to the
    /// parent and disposing the rest.
    pub(crate) fn pop_scope(&mut self, keep: &HashSet<TensorId>) -> Result<()> {
        if self.scopes.len() <= 1 {
            return Err(Error::invalid_argument("end_scope", "no scope is open"));
        }
        let frame = match self.scopes.pop() {
            Some(frame) => frame,
            None => return Err(Error::invalid_argument("end_scope", "no scope is open")),
        };
        let mut disposed = 0usize;
        let mut first_err = None;
        for id in frame.tracked {
            if !self.tensors.contains_key(&id) {
                continue;
            }
            if keep.contains(&id) || self.tape_holds.contains_key(&id) {
                self.track(id);
                continue;
            }
            match self.dispose_tensor(id) {
                Ok(()) => disposed += 1,
                Err(err) => {
                    log::warn!("failed to dispose {id} in scope '{}': {err}", frame.name);
                    first_err.get_or_insert(err);
                }
            }
        }
        log::trace!("exit scope '{}', disposed {disposed} tensors", frame.name);
        first_err.map_or(Ok(()), Err)
    }

    /// Move a tracked tensor to the root frame.
    fn keep(&mut self, id: TensorId) {
        for frame in self.scopes.iter_mut().skip(1) {
            frame.tracked.remove(&id);
        }
        if self.tensors.get(&id).is_some_and(|r| r.variable.is_none()) {
            self.scopes[0].tracked.insert(id);
        }
    }
}

fn ids_of(container: &impl TensorContainer) -> HashSet<TensorId> {
    container.tensors().into_iter().map(|t| t.id).collect()
}

impl Engine {
    /// Run `f` in a fresh scope and dispose every tensor it creates that is
    /// not part of its return value.
    ///
    /// The scope is closed on error too; tensors created before the failure
    /// are released.
    pub fn tidy<T, F>(&self, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce() -> Result<T>,
    {
        self.tidy_named("tidy", f)
    }

    /// [`tidy`](Self::tidy) with a name for tracing.
    pub fn tidy_named<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce() -> Result<T>,
    {
        let depth = {
            let mut state = self.state_mut();
            state.push_scope(name);
            state.scopes.len()
        };

        let result = f();

        let keep = match &result {
            Ok(value) => ids_of(value),
            Err(_) => HashSet::new(),
        };
        let closed = self.close_scopes_to(depth, &keep);
        match (result, closed) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Close scopes left open inside a tidy, then the tidy's own frame.
    fn close_scopes_to(&self, depth: usize, keep: &HashSet<TensorId>) -> Result<()> {
        let mut state = self.state_mut();
        while state.scopes.len() > depth {
            let name = state.scopes.last().map(|f| f.name.clone()).unwrap_or_default();
            log::warn!("scope '{name}' was left open; closing it");
            state.pop_scope(keep)?;
        }
        if state.scopes.len() == depth {
            state.pop_scope(keep)?;
        }
        Ok(())
    }

    /// Open a scope manually. Must be paired with [`end_scope`](Self::end_scope).
    pub fn start_scope(&self, name: &str) {
        self.state_mut().push_scope(name);
    }

    /// Close the innermost manual scope, keeping `result`.
    pub fn end_scope(&self, result: &impl TensorContainer) -> Result<()> {
        let keep = ids_of(result);
        self.state_mut().pop_scope(&keep)
    }

    /// Number of open scopes, the root included.
    pub fn scope_depth(&self) -> usize {
        self.state.borrow().scopes.len()
    }

    /// Exempt `t` from scope cleanup. It lives until disposed explicitly.
    pub fn keep(&self, t: &Tensor) -> Result<Tensor> {
        let mut state = self.state_mut();
        state.ensure_live(t, "keep")?;
        state.keep(t.id);
        Ok(t.clone())
    }

    /// Release every tensor in `container` now.
    ///
    /// Fails with [`Error::AlreadyDisposed`] if any of them is gone, in
    /// which case nothing is released. Repeated handles within one call are
    /// released once.
    pub fn dispose(&self, container: &impl TensorContainer) -> Result<()> {
        let mut state = self.state_mut();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for t in container.tensors() {
            if !seen.insert(t.id) {
                continue;
            }
            if state.ensure_live(t, "dispose").is_err() {
                return Err(Error::AlreadyDisposed { id: t.id });
            }
            ids.push(t.id);
        }
        for id in ids {
            state.dispose_tensor(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;
    use crate::dtype::DType;
    use crate::tensor::DataId;

    fn handle(id: u64) -> Tensor {
        Tensor {
            id: TensorId(id),
            shape: Shape::scalar(),
            dtype: DType::Float32,
            data_id: DataId::next(),
        }
    }

    #[test]
    fn test_collect_nested_containers() {
        let a = handle(1);
        let b = handle(2);
        let c = handle(3);
        let mut map = BTreeMap::new();
        map.insert("c", c.clone());
        let value = (vec![a.clone(), b.clone()], Some(&c), map, 1.5f32);
        let ids: Vec<TensorId> = value.tensors().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id, c.id]);
    }

    #[test]
    fn test_plain_values_have_no_tensors() {
        assert!(().tensors().is_empty());
        assert!(None::<Tensor>.tensors().is_empty());
    }
}
