//! Per-layer K/V storage tensors
//!
//! Each layer owns one K and one V tensor, both 1-D buffers of
//! `width × size` elements. Widths come from the model hyperparameters and
//! may differ per layer. Buffers are zero-filled at creation so unused
//! padding never feeds NaNs into the attention kernels.
//!
//! With `offload` enabled the layer tensors live on the model's device;
//! otherwise they stay on the CPU. Allocation totals are reported per device
//! kind.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::config::ModelHparams;

/// Device kind label used to group allocation accounting.
fn device_kind(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Per-layer K/V tensor storage for the whole cache.
#[derive(Debug)]
pub struct TensorPane {
    k_l: Vec<Tensor>,
    v_l: Vec<Tensor>,
}

impl TensorPane {
    /// Allocate zero-filled per-layer buffers sized for `size` cells.
    pub fn new(
        hparams: &ModelHparams,
        type_k: DType,
        type_v: DType,
        size: usize,
        offload: bool,
        device: &Device,
    ) -> Result<Self> {
        let mut k_l = Vec::with_capacity(hparams.n_layer);
        let mut v_l = Vec::with_capacity(hparams.n_layer);
        let mut kind_bytes: HashMap<&'static str, usize> = HashMap::new();

        for il in 0..hparams.n_layer {
            let n_embd_k_gqa = hparams.n_embd_k_gqa[il];
            let n_embd_v_gqa = hparams.n_embd_v_gqa[il];

            debug!("layer {il}: n_embd_k_gqa = {n_embd_k_gqa}, n_embd_v_gqa = {n_embd_v_gqa}");

            let dev = if offload { device.clone() } else { Device::Cpu };

            let k = Tensor::zeros((n_embd_k_gqa * size,), type_k, &dev)
                .with_context(|| format!("failed to allocate K cache buffer for layer {il}"))?;
            let v = Tensor::zeros((n_embd_v_gqa * size,), type_v, &dev)
                .with_context(|| format!("failed to allocate V cache buffer for layer {il}"))?;

            *kind_bytes.entry(device_kind(&dev)).or_insert(0) +=
                k.elem_count() * type_k.size_in_bytes() + v.elem_count() * type_v.size_in_bytes();

            k_l.push(k);
            v_l.push(v);
        }

        for (kind, bytes) in &kind_bytes {
            info!(
                "{kind:>6} KV buffer size = {:8.2} MiB",
                *bytes as f64 / 1024.0 / 1024.0
            );
        }

        Ok(Self { k_l, v_l })
    }

    pub fn n_layer(&self) -> usize {
        self.k_l.len()
    }

    /// K buffer of layer `il`.
    pub fn k(&self, il: usize) -> &Tensor {
        &self.k_l[il]
    }

    /// V buffer of layer `il`.
    pub fn v(&self, il: usize) -> &Tensor {
        &self.v_l[il]
    }

    /// Total bytes across all backing buffers.
    pub fn total_size(&self) -> usize {
        self.k_l
            .iter()
            .chain(self.v_l.iter())
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }

    /// Zero-fill every buffer.
    pub fn clear(&mut self) -> Result<()> {
        for t in self.k_l.iter_mut().chain(self.v_l.iter_mut()) {
            *t = t.zeros_like().context("failed to zero KV cache buffer")?;
        }
        Ok(())
    }
}
