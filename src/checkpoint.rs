//! Persisting the parameter store and the class index map.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::dataset::ClassIndex;
use crate::error::{FinetuneError, Result};
use crate::params::{ParameterSnapshot, ParameterStore};

/// Sibling path used while a checkpoint is being written.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write every parameter of `store` to `path` as safetensors, replacing any
/// previous file.
///
/// The data goes to a temporary sibling first, is synced to disk, then renamed
/// over `path`.
///
/// # Errors
///
/// Returns an error if the snapshot, the write, the sync or the rename fails.
pub fn save_checkpoint(store: &ParameterStore, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    store.snapshot()?.save(&tmp).map_err(|e| {
        FinetuneError::Checkpoint(format!("failed to write {}: {e}", tmp.display()))
    })?;
    OpenOptions::new().write(true).open(&tmp)?.sync_all()?;
    fs::rename(&tmp, path)?;
    tracing::info!("Saved checkpoint to: {}", path.display());
    Ok(())
}

/// Read a checkpoint written by [`save_checkpoint`].
///
/// # Errors
///
/// Returns an error if the file is missing or malformed.
pub fn load_checkpoint(path: &Path) -> Result<ParameterSnapshot> {
    ParameterSnapshot::load(path)
}

/// Persist the class index map to `path`.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn write_class_indices(classes: &ClassIndex, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    classes.save(path)?;
    tracing::info!(
        "Wrote {} classes to {}: {:?}",
        classes.len(),
        path.display(),
        classes.names()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::linear;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("model_data.safetensors");
        let store = ParameterStore::new(Device::Cpu);
        linear(3, 2, store.init_var_builder().pp("fc")).unwrap();

        save_checkpoint(&store, &path).unwrap();
        store
            .set("fc.bias", &Tensor::full(3f32, 2, &Device::Cpu).unwrap())
            .unwrap();
        save_checkpoint(&store, &path).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get("fc.bias").unwrap().to_vec1::<f32>().unwrap(),
            vec![3.0, 3.0]
        );
        assert!(!temp_path(&path).exists());
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_checkpoint_includes_frozen_parameters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model_data.safetensors");
        let mut store = ParameterStore::new(Device::Cpu);
        let vb = store.init_var_builder();
        linear(4, 3, vb.pp("features.0")).unwrap();
        linear(3, 2, vb.pp("fc")).unwrap();
        crate::params::FreezePolicy::default()
            .apply(&mut store)
            .unwrap();

        save_checkpoint(&store, &path).unwrap();
        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.get("features.0.weight").unwrap().dtype(), DType::F32);
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let path = Path::new("/run/model_data.safetensors");
        assert_eq!(
            temp_path(path),
            PathBuf::from("/run/model_data.safetensors.tmp")
        );
    }

    #[test]
    fn test_write_class_indices() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("class_indices.json");
        let classes = ClassIndex::new(vec!["daisy".into(), "roses".into()]);
        write_class_indices(&classes, &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"0\": \"daisy\",\n    \"1\": \"roses\"\n}");
    }
}
