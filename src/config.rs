//! Model and compute hyperparameters consumed at cache construction
//!
//! These mirror what a model loader hands the runtime: layer count,
//! per-layer K/V projection widths (already GQA-adjusted, with any
//! recurrent-state widths folded in by the loader), and the architecture
//! flags that decide the cache discipline.

use anyhow::{bail, Result};

/// Model hyperparameters relevant to KV cache sizing.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModelHparams {
    /// Number of attention (or recurrent-mixing) layers
    pub n_layer: usize,
    /// Per-layer K projection width in elements
    pub n_embd_k_gqa: Vec<usize>,
    /// Per-layer V projection width in elements
    pub n_embd_v_gqa: Vec<usize>,
    /// Recurrent-state architecture (Mamba, RWKV): one cell per sequence
    #[serde(default)]
    pub recurrent: bool,
    /// Multi-head Latent Attention: cell layout precludes position-shift fixups
    #[serde(default)]
    pub mla: bool,
}

impl ModelHparams {
    /// Hyperparameters with the same K/V width on every layer.
    ///
    /// Most dense models have uniform widths; per-layer vectors only matter
    /// for hybrid architectures.
    pub fn uniform(n_layer: usize, n_embd_k_gqa: usize, n_embd_v_gqa: usize) -> Self {
        Self {
            n_layer,
            n_embd_k_gqa: vec![n_embd_k_gqa; n_layer],
            n_embd_v_gqa: vec![n_embd_v_gqa; n_layer],
            recurrent: false,
            mla: false,
        }
    }

    /// Mark these hyperparameters as describing a recurrent architecture.
    pub fn with_recurrent(mut self, recurrent: bool) -> Self {
        self.recurrent = recurrent;
        self
    }

    /// Mark these hyperparameters as describing an MLA architecture.
    pub fn with_mla(mut self, mla: bool) -> Self {
        self.mla = mla;
        self
    }

    /// Check that the per-layer width vectors cover every layer.
    pub fn validate(&self) -> Result<()> {
        if self.n_embd_k_gqa.len() != self.n_layer {
            bail!(
                "n_embd_k_gqa has {} entries for {} layers",
                self.n_embd_k_gqa.len(),
                self.n_layer
            );
        }
        if self.n_embd_v_gqa.len() != self.n_layer {
            bail!(
                "n_embd_v_gqa has {} entries for {} layers",
                self.n_embd_v_gqa.len(),
                self.n_layer
            );
        }
        Ok(())
    }
}

/// Compute parameters that influence cache layout.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ComputeParams {
    /// Flash-attention kernels in use: V is stored row-major and slot ranges
    /// need coarser padding
    #[serde(default)]
    pub flash_attn: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_widths() {
        let hp = ModelHparams::uniform(4, 512, 512);
        assert_eq!(hp.n_layer, 4);
        assert_eq!(hp.n_embd_k_gqa, vec![512; 4]);
        assert!(!hp.recurrent);
        assert!(!hp.mla);
        hp.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_short_width_vector() {
        let mut hp = ModelHparams::uniform(4, 512, 512);
        hp.n_embd_k_gqa.pop();
        assert!(hp.validate().is_err());
    }

    #[test]
    fn test_deserialize_defaults() {
        let hp: ModelHparams = serde_json::from_str(
            r#"{"n_layer": 2, "n_embd_k_gqa": [64, 64], "n_embd_v_gqa": [64, 64]}"#,
        )
        .unwrap();
        assert!(!hp.recurrent);
        assert!(!hp.mla);

        let cp: ComputeParams = serde_json::from_str("{}").unwrap();
        assert!(!cp.flash_attn);
    }

    #[test]
    fn test_deserialize_recurrent() {
        let hp: ModelHparams = serde_json::from_str(
            r#"{"n_layer": 1, "n_embd_k_gqa": [0], "n_embd_v_gqa": [128], "recurrent": true}"#,
        )
        .unwrap();
        assert!(hp.recurrent);
    }
}
