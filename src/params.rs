//! Live classifier parameters, pretrained snapshots, weight transfer and freezing.
//!
//! A [`ParameterStore`] owns every variable of one classifier together with a
//! per-parameter trainable flag. The classifier itself is built from a
//! [`VarBuilder`] handed out by the store, so the same store can re-bind the
//! classifier with frozen parameters as constants ([`Binding::Training`]) or with
//! every parameter detached ([`Binding::Inference`]).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::error::{FinetuneError, Result};

/// How the store's parameters enter a rebuilt classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Trainable parameters are tracked variables, frozen ones are constants.
    Training,
    /// Every parameter is a constant; no backprop graph is recorded.
    Inference,
}

/// Enumeration entry for one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    /// Dotted parameter name, e.g. `fc.weight`.
    pub name: String,
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Total element count.
    pub elem_count: usize,
    /// Whether the optimizer updates this parameter.
    pub trainable: bool,
}

/// The live, named parameters of one classifier.
pub struct ParameterStore {
    varmap: VarMap,
    frozen: BTreeSet<String>,
    device: Device,
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("frozen", &self.frozen)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ParameterStore {
    /// Create an empty store on `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            frozen: BTreeSet::new(),
            device,
        }
    }

    /// Device holding the parameters.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builder that creates (and registers) freshly initialised variables.
    ///
    /// Pass it to `Classifier::build` once to populate the store.
    #[must_use]
    pub fn init_var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    /// Builder serving the existing parameters under the requested binding.
    ///
    /// The returned tensors share storage with the store, so in-place updates
    /// made by the optimizer are visible to every classifier built from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn bind(&self, binding: Binding) -> Result<VarBuilder<'static>> {
        let data = self.lock()?;
        let tensors: HashMap<String, Tensor> = data
            .iter()
            .map(|(name, var)| {
                let tensor = match binding {
                    Binding::Training if !self.frozen.contains(name) => var.as_tensor().clone(),
                    _ => var.as_detached_tensor(),
                };
                (name.clone(), tensor)
            })
            .collect();
        Ok(VarBuilder::from_tensors(tensors, DType::F32, &self.device))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|e| FinetuneError::Model(format!("parameter store lock poisoned: {e}")))
    }

    /// Number of parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Whether the store holds no parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Enumerate every parameter, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn parameters(&self) -> Result<Vec<ParameterInfo>> {
        let data = self.lock()?;
        let mut infos: Vec<ParameterInfo> = data
            .iter()
            .map(|(name, var)| ParameterInfo {
                name: name.clone(),
                shape: var.dims().to_vec(),
                elem_count: var.elem_count(),
                trainable: !self.frozen.contains(name),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    /// Detached copy of one parameter's current value.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the copy fails.
    pub fn get(&self, name: &str) -> Result<Option<Tensor>> {
        let data = self.lock()?;
        data.get(name)
            .map(|var| var.as_tensor().copy().map_err(FinetuneError::from))
            .transpose()
    }

    /// Overwrite one parameter in place.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Model`] for an unknown name and a candle error
    /// when the shape or dtype differs.
    pub fn set(&self, name: &str, value: &Tensor) -> Result<()> {
        let data = self.lock()?;
        let var = data
            .get(name)
            .ok_or_else(|| FinetuneError::Model(format!("unknown parameter: {name}")))?;
        var.set(value)?;
        Ok(())
    }

    /// Set a parameter's trainable flag.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Model`] for an unknown name.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()> {
        if !self.lock()?.contains_key(name) {
            return Err(FinetuneError::Model(format!("unknown parameter: {name}")));
        }
        if trainable {
            self.frozen.remove(name);
        } else {
            self.frozen.insert(name.to_string());
        }
        Ok(())
    }

    /// Whether `name` is a known, trainable parameter.
    #[must_use]
    pub fn is_trainable(&self, name: &str) -> bool {
        !self.frozen.contains(name) && self.lock().is_ok_and(|data| data.contains_key(name))
    }

    /// Variables the optimizer may update, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = self.lock()?;
        let mut vars: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| !self.frozen.contains(*name))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(b.0));
        Ok(vars.into_iter().map(|(_, var)| var.clone()).collect())
    }

    /// Immutable copy of every parameter, trainable and frozen.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or a copy fails.
    pub fn snapshot(&self) -> Result<ParameterSnapshot> {
        let data = self.lock()?;
        let mut tensors = BTreeMap::new();
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(ParameterSnapshot { tensors })
    }
}

/// A named set of tensors from a previous run or a pretrained source.
#[derive(Debug, Clone, Default)]
pub struct ParameterSnapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterSnapshot {
    /// Build a snapshot from in-memory tensors. Later duplicates win.
    pub fn from_tensors<I, S>(tensors: I) -> Self
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: Into<String>,
    {
        Self {
            tensors: tensors.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Load a snapshot onto the CPU.
    ///
    /// `.safetensors` files are read directly; `.pth`, `.pt` and `.bin` are
    /// read as PyTorch pickled state dicts.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Checkpoint`] for an unsupported extension, or
    /// the underlying error when the file cannot be parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let snapshot = match extension.as_str() {
            "safetensors" => {
                Self::from_tensors(candle_core::safetensors::load(path, &Device::Cpu)?)
            }
            "pth" | "pt" | "bin" => Self::from_tensors(candle_core::pickle::read_all(path)?),
            other => {
                return Err(FinetuneError::Checkpoint(format!(
                    "unsupported snapshot format '{other}': {}",
                    path.display()
                )))
            }
        };
        tracing::debug!(
            "Loaded {} tensors from {}",
            snapshot.len(),
            path.display()
        );
        Ok(snapshot)
    }

    /// Write the snapshot as safetensors.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<&str, Tensor> = self
            .tensors
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Tensor stored under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Entry names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Iterate over `(name, tensor)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Result of transferring one parameter present in both snapshot and store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The source value was copied into the target.
    Transferred {
        /// Parameter name.
        name: String,
    },
    /// Element counts differ; the target keeps its initial value.
    SkippedShapeMismatch {
        /// Parameter name.
        name: String,
        /// Shape found in the snapshot.
        source_shape: Vec<usize>,
        /// Shape of the live parameter.
        target_shape: Vec<usize>,
    },
}

impl TransferOutcome {
    /// Parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Transferred { name } | Self::SkippedShapeMismatch { name, .. } => name,
        }
    }
}

/// Full account of a weight transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// One outcome per name present in both, in name order.
    pub outcomes: Vec<TransferOutcome>,
    /// Store parameters with no snapshot entry.
    pub missing: Vec<String>,
    /// Snapshot entries with no store parameter.
    pub unexpected: Vec<String>,
}

impl TransferReport {
    /// Number of parameters actually copied.
    #[must_use]
    pub fn transferred(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, TransferOutcome::Transferred { .. }))
            .count()
    }

    /// Number of shape-mismatch skips.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.transferred()
    }

    /// Emit the report through `tracing`.
    pub fn log(&self) {
        tracing::info!(
            "Weight transfer: {} transferred, {} skipped, {} missing, {} unexpected",
            self.transferred(),
            self.skipped(),
            self.missing.len(),
            self.unexpected.len()
        );
        for outcome in &self.outcomes {
            if let TransferOutcome::SkippedShapeMismatch {
                name,
                source_shape,
                target_shape,
            } = outcome
            {
                tracing::warn!(
                    "Skipped {name}: snapshot shape {source_shape:?} vs model shape {target_shape:?}"
                );
            }
        }
        if !self.missing.is_empty() {
            tracing::debug!("Missing from snapshot: {:?}", self.missing);
        }
        if !self.unexpected.is_empty() {
            tracing::debug!("Unused snapshot entries: {:?}", self.unexpected);
        }
    }
}

/// Copy every snapshot entry whose element count matches the live parameter.
///
/// Sources with a different shape but the same element count are reshaped to
/// the target shape. Parameters without a usable source keep their current
/// values; partial coverage is not an error.
///
/// # Errors
///
/// Returns an error only when a tensor conversion or copy fails.
pub fn transfer_weights(
    store: &ParameterStore,
    snapshot: &ParameterSnapshot,
) -> Result<TransferReport> {
    let mut report = TransferReport::default();
    let mut seen = BTreeSet::new();

    for info in store.parameters()? {
        let Some(source) = snapshot.get(&info.name) else {
            report.missing.push(info.name);
            continue;
        };
        seen.insert(info.name.clone());

        if source.elem_count() == info.elem_count {
            let value = source
                .reshape(info.shape.as_slice())?
                .to_dtype(DType::F32)?
                .to_device(store.device())?;
            store.set(&info.name, &value)?;
            report
                .outcomes
                .push(TransferOutcome::Transferred { name: info.name });
        } else {
            report.outcomes.push(TransferOutcome::SkippedShapeMismatch {
                name: info.name,
                source_shape: source.dims().to_vec(),
                target_shape: info.shape,
            });
        }
    }

    report.unexpected = snapshot
        .names()
        .filter(|name| !seen.contains(*name))
        .map(str::to_string)
        .collect();
    Ok(report)
}

/// Rule deciding which parameters are frozen before training.
pub struct FreezePolicy {
    predicate: Box<dyn Fn(&str) -> bool + Send + Sync>,
    description: String,
}

impl std::fmt::Debug for FreezePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreezePolicy")
            .field("rule", &self.description)
            .finish()
    }
}

impl Default for FreezePolicy {
    fn default() -> Self {
        Self::except_marker("fc")
    }
}

impl FreezePolicy {
    /// Freeze every parameter whose name does not contain `marker`.
    #[must_use]
    pub fn except_marker(marker: impl Into<String>) -> Self {
        let marker = marker.into();
        let description = format!("freeze names without '{marker}'");
        Self {
            predicate: Box::new(move |name| !name.contains(marker.as_str())),
            description,
        }
    }

    /// Freeze every parameter for which `predicate` returns `true`.
    pub fn from_predicate<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            description: "custom predicate".into(),
        }
    }

    /// Whether `name` would be frozen.
    #[must_use]
    pub fn should_freeze(&self, name: &str) -> bool {
        (self.predicate)(name)
    }

    /// Mark matching parameters non-trainable and return their names.
    ///
    /// Parameters not matched are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    pub fn apply(&self, store: &mut ParameterStore) -> Result<Vec<String>> {
        let mut frozen = Vec::new();
        for info in store.parameters()? {
            if self.should_freeze(&info.name) {
                store.set_trainable(&info.name, false)?;
                tracing::debug!("Froze {}", info.name);
                frozen.push(info.name);
            }
        }
        tracing::info!(
            "Freeze policy ({}): {} parameters frozen",
            self.description,
            frozen.len()
        );
        Ok(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{linear, Module};
    use tempfile::TempDir;

    fn store_with_two_layers() -> ParameterStore {
        let store = ParameterStore::new(Device::Cpu);
        let vb = store.init_var_builder();
        linear(4, 3, vb.pp("features.0")).unwrap();
        linear(3, 2, vb.pp("fc")).unwrap();
        store
    }

    #[test]
    fn test_enumeration_sorted_with_flags() {
        let store = store_with_two_layers();
        let params = store.parameters().unwrap();
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            ["fc.bias", "fc.weight", "features.0.bias", "features.0.weight"]
        );
        assert_eq!(params[1].shape, vec![2, 3]);
        assert_eq!(params[1].elem_count, 6);
        assert!(params.iter().all(|p| p.trainable));
    }

    #[test]
    fn test_set_rejects_unknown_and_wrong_shape() {
        let store = store_with_two_layers();
        let value = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(store.set("missing.weight", &value).is_err());
        assert!(store.set("fc.bias", &value).is_err());
        store.set("fc.weight", &value).unwrap();
        let got = store.get("fc.weight").unwrap().unwrap();
        assert_eq!(got.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_transfer_matching_and_mismatched() {
        let store = store_with_two_layers();
        let before = store.get("features.0.weight").unwrap().unwrap();

        let fc_weight = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let wrong = Tensor::ones((5, 5), DType::F32, &Device::Cpu).unwrap();
        let extra = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();
        let snapshot = ParameterSnapshot::from_tensors([
            ("fc.weight", fc_weight),
            ("features.0.weight", wrong),
            ("aux.weight", extra),
        ]);

        let report = transfer_weights(&store, &snapshot).unwrap();
        assert_eq!(report.transferred(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(
            report.outcomes[1],
            TransferOutcome::SkippedShapeMismatch {
                name: "features.0.weight".into(),
                source_shape: vec![5, 5],
                target_shape: vec![3, 4],
            }
        );
        assert_eq!(report.missing, vec!["fc.bias", "features.0.bias"]);
        assert_eq!(report.unexpected, vec!["aux.weight"]);

        let after_fc = store.get("fc.weight").unwrap().unwrap();
        assert_eq!(after_fc.sum_all().unwrap().to_scalar::<f32>().unwrap(), 6.0);

        let after = store.get("features.0.weight").unwrap().unwrap();
        let diff = (after - before).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_transfer_reshapes_equal_element_count() {
        let store = store_with_two_layers();
        let flat = Tensor::arange(0f32, 6., &Device::Cpu).unwrap();
        let snapshot = ParameterSnapshot::from_tensors([("fc.weight", flat)]);

        let report = transfer_weights(&store, &snapshot).unwrap();
        assert_eq!(report.transferred(), 1);
        let w = store.get("fc.weight").unwrap().unwrap();
        assert_eq!(w.dims(), &[2, 3]);
        assert_eq!(
            w.to_vec2::<f32>().unwrap(),
            vec![vec![0., 1., 2.], vec![3., 4., 5.]]
        );
    }

    #[test]
    fn test_default_freeze_policy() {
        let mut store = store_with_two_layers();
        let frozen = FreezePolicy::default().apply(&mut store).unwrap();
        assert_eq!(frozen, vec!["features.0.bias", "features.0.weight"]);

        for info in store.parameters().unwrap() {
            assert_eq!(info.trainable, info.name.contains("fc"), "{}", info.name);
        }
        assert_eq!(store.trainable_vars().unwrap().len(), 2);
    }

    #[test]
    fn test_custom_freeze_policy() {
        let mut store = store_with_two_layers();
        let policy = FreezePolicy::from_predicate(|name| name.ends_with("bias"));
        policy.apply(&mut store).unwrap();
        assert!(!store.is_trainable("fc.bias"));
        assert!(store.is_trainable("fc.weight"));
        assert!(!store.is_trainable("does.not.exist"));
    }

    #[test]
    fn test_bindings_share_storage() {
        let mut store = store_with_two_layers();
        store.set_trainable("fc.bias", false).unwrap();

        let train_vb = store.bind(Binding::Training).unwrap();
        let fc = linear(3, 2, train_vb.pp("fc")).unwrap();
        let eval_vb = store.bind(Binding::Inference).unwrap();
        let fc_eval = linear(3, 2, eval_vb.pp("fc")).unwrap();

        let update = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        store.set("fc.weight", &update).unwrap();
        store
            .set("fc.bias", &Tensor::ones(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();

        let xs = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let ys = fc.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        let ys_eval = fc_eval.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(ys, vec![vec![1.0, 1.0]]);
        assert_eq!(ys, ys_eval);
    }

    #[test]
    fn test_frozen_parameters_get_no_gradient() {
        let mut store = store_with_two_layers();
        FreezePolicy::default().apply(&mut store).unwrap();
        let vb = store.bind(Binding::Training).unwrap();
        let features = linear(4, 3, vb.pp("features.0")).unwrap();
        let fc = linear(3, 2, vb.pp("fc")).unwrap();

        let xs = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let loss = fc
            .forward(&features.forward(&xs).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();

        let data = store.varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            assert_eq!(
                grads.get(var).is_some(),
                !store.frozen.contains(name),
                "{name}"
            );
        }
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.safetensors");
        let store = store_with_two_layers();
        store.snapshot().unwrap().save(&path).unwrap();

        let loaded = ParameterSnapshot::load(&path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(
            loaded.names().collect::<Vec<_>>(),
            ["fc.bias", "fc.weight", "features.0.bias", "features.0.weight"]
        );
        assert_eq!(loaded.get("fc.weight").unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_snapshot_is_independent_of_store() {
        let store = store_with_two_layers();
        let snapshot = store.snapshot().unwrap();
        store
            .set("fc.bias", &Tensor::full(7f32, 2, &Device::Cpu).unwrap())
            .unwrap();
        let kept = snapshot.get("fc.bias").unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(kept, vec![7.0, 7.0]);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let result = ParameterSnapshot::load("weights.onnx");
        assert!(matches!(result, Err(FinetuneError::Checkpoint(_))));
    }
}
