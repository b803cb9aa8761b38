//! Checkpoint I/O.
//!
//! Classifier checkpoints are safetensors files of the model's `VarMap`.
//! Diffusion checkpoints may also be PyTorch pickles (`.pt`, `.pth`, `.bin`)
//! holding a flat state dict.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::{Error, Result};

/// Read every tensor of a weight file onto `device`.
pub fn read_tensors(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match ext {
        "safetensors" => candle_core::safetensors::load(path, device)
            .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display()))),
        "pt" | "pth" | "bin" => {
            let tensors = candle_core::pickle::read_all(path)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?;
            tensors
                .into_iter()
                .map(|(name, t)| Ok((name, t.to_device(device)?)))
                .collect()
        }
        other => Err(Error::WeightLoad(format!(
            "{}: unsupported weight format '{other}'",
            path.display()
        ))),
    }
}

/// Copy matching tensors into the variables of `varmap`.
///
/// Values are cast to each variable's dtype; shapes must match. With
/// `strict`, every variable must be present in `tensors`. Returns the number
/// of variables written.
pub fn load_into_varmap(varmap: &VarMap, tensors: &HashMap<String, Tensor>, strict: bool) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| Error::WeightLoad(format!("variable map poisoned: {e}")))?;
    let mut loaded = 0;
    let mut missing = Vec::new();
    for (name, var) in data.iter() {
        let Some(value) = tensors.get(name) else {
            missing.push(name.clone());
            continue;
        };
        if value.dims() != var.dims() {
            return Err(Error::WeightLoad(format!(
                "{name}: checkpoint shape {:?}, model shape {:?}",
                value.dims(),
                var.dims()
            )));
        }
        var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
        loaded += 1;
    }
    if strict && !missing.is_empty() {
        missing.sort();
        return Err(Error::WeightLoad(format!("missing weights: {}", missing.join(", "))));
    }
    if !missing.is_empty() {
        tracing::debug!(count = missing.len(), "variables left at their initial values");
    }
    Ok(loaded)
}

/// Load a single named tensor from a weight file into the variable `target`.
pub fn load_tensor_into(
    varmap: &VarMap,
    path: impl AsRef<Path>,
    source: &str,
    target: &str,
) -> Result<()> {
    let path = path.as_ref();
    let device = {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| Error::WeightLoad(format!("variable map poisoned: {e}")))?;
        data.get(target)
            .ok_or_else(|| Error::WeightLoad(format!("model has no variable '{target}'")))?
            .device()
            .clone()
    };
    let mut tensors = read_tensors(path, &device)?;
    let value = tensors
        .remove(source)
        .ok_or_else(|| Error::WeightLoad(format!("{} has no tensor '{source}'", path.display())))?;
    let renamed = HashMap::from([(target.to_string(), value)]);
    load_into_varmap(varmap, &renamed, false)?;
    tracing::info!(path = %path.display(), source, target, "loaded tensor");
    Ok(())
}
