//! Parameter snapshots and where they are kept.
//!
//! A snapshot maps variable names (as registered in a `VarMap`) to
//! detached copies of their values. A `CheckpointStore` keeps
//! snapshots under string keys such as `"m2/mnist"`.

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type ParamSnapshot = HashMap<String, Tensor>;

/// Anything whose trainable parameters can be copied out and written
/// back in place
pub trait Checkpointable {
    /// Deep copy of every parameter
    fn state_dict(&self) -> anyhow::Result<ParamSnapshot>;

    /// Overwrite every parameter with the snapshot's value; a missing
    /// name or a shape mismatch is an error
    fn load_state_dict(&self, snapshot: &ParamSnapshot) -> anyhow::Result<()>;
}

impl Checkpointable for VarMap {
    fn state_dict(&self) -> anyhow::Result<ParamSnapshot> {
        let vars = self
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("poisoned variable map: {}", e))?;

        let mut snapshot = ParamSnapshot::with_capacity(vars.len());
        for (name, var) in vars.iter() {
            snapshot.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        Ok(snapshot)
    }

    fn load_state_dict(&self, snapshot: &ParamSnapshot) -> anyhow::Result<()> {
        let vars = self
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("poisoned variable map: {}", e))?;

        for (name, var) in vars.iter() {
            let value = snapshot
                .get(name)
                .ok_or(anyhow::anyhow!("checkpoint has no parameter `{}`", name))?;

            if value.dims() != var.dims() {
                return Err(anyhow::anyhow!(
                    "parameter `{}`: checkpoint shape {:?} vs. model shape {:?}",
                    name,
                    value.dims(),
                    var.dims()
                ));
            }

            var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }
}

/// Variables whose names start with `prefix`, e.g., to give an
/// optimizer a single layer of a larger model
pub fn vars_with_prefix(variable_map: &VarMap, prefix: &str) -> anyhow::Result<Vec<Var>> {
    let vars = variable_map
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("poisoned variable map: {}", e))?;

    let mut selected: Vec<(String, Var)> = vars
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();

    selected.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(selected.into_iter().map(|(_, v)| v).collect())
}

/// A key-value store of parameter snapshots
pub trait CheckpointStore {
    fn save(&mut self, key: &str, snapshot: &ParamSnapshot) -> anyhow::Result<()>;

    /// Fails if nothing was saved under `key`
    fn load(&self, key: &str) -> anyhow::Result<ParamSnapshot>;

    fn contains(&self, key: &str) -> bool;
}

impl<S> CheckpointStore for &mut S
where
    S: CheckpointStore + ?Sized,
{
    fn save(&mut self, key: &str, snapshot: &ParamSnapshot) -> anyhow::Result<()> {
        (**self).save(key, snapshot)
    }

    fn load(&self, key: &str) -> anyhow::Result<ParamSnapshot> {
        (**self).load(key)
    }

    fn contains(&self, key: &str) -> bool {
        (**self).contains(key)
    }
}

/// Snapshots kept in memory
#[derive(Default)]
pub struct MemoryCheckpointStore {
    slots: HashMap<String, ParamSnapshot>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, key: &str, snapshot: &ParamSnapshot) -> anyhow::Result<()> {
        let mut copied = ParamSnapshot::with_capacity(snapshot.len());
        for (name, value) in snapshot.iter() {
            copied.insert(name.clone(), value.copy()?);
        }
        self.slots.insert(key.to_string(), copied);
        Ok(())
    }

    fn load(&self, key: &str) -> anyhow::Result<ParamSnapshot> {
        self.slots
            .get(key)
            .cloned()
            .ok_or(anyhow::anyhow!("no checkpoint saved under `{}`", key))
    }

    fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }
}

/// Snapshots written as `{root}/{key}.safetensors`
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.safetensors", key))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, key: &str, snapshot: &ParamSnapshot) -> anyhow::Result<()> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(snapshot, &path)?;
        debug!("saved checkpoint {:?}", path);
        Ok(())
    }

    fn load(&self, key: &str) -> anyhow::Result<ParamSnapshot> {
        let path = self.path_of(key);
        if !path.exists() {
            return Err(anyhow::anyhow!("missing checkpoint file {:?}", path));
        }
        Ok(candle_core::safetensors::load(&path, &Device::Cpu)?)
    }

    fn contains(&self, key: &str) -> bool {
        self.path_of(key).exists()
    }
}
