use candle_core::{Result, Tensor};

/// Per-session key/value store for every attention layer of a language stack.
///
/// Keys and values are kept as `(1, kv_heads, seq, head_dim)` and grow along the
/// sequence axis. The cache never evicts.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
    tokens: usize,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
            tokens: 0,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of tokens whose keys and values are cached.
    pub fn tokens_processed(&self) -> usize {
        self.tokens
    }

    /// Cached sequence length of one layer.
    pub fn layer_len(&self, layer: usize) -> usize {
        match self.layers.get(layer) {
            Some(Some((k, _))) => k.dims().get(2).copied().unwrap_or(0),
            _ => 0,
        }
    }

    /// Append this step's projections to `layer` and return the full accumulated range.
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| candle_core::Error::Msg(format!("no cache slot for layer {layer}")))?;

        let (k, v) = match slot.take() {
            Some((k_prev, v_prev)) => (
                Tensor::cat(&[&k_prev, k], 2)?.contiguous()?,
                Tensor::cat(&[&v_prev, v], 2)?.contiguous()?,
            ),
            None => (k.contiguous()?, v.contiguous()?),
        };
        *slot = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    /// Record that `n` more tokens went through every layer.
    ///
    /// # Panics
    ///
    /// Panics if any layer's cached length differs from the new token count, which means
    /// a forward pass skipped or repeated a layer.
    pub fn commit(&mut self, n: usize) {
        let expected = self.tokens + n;
        for layer in 0..self.layers.len() {
            let len = self.layer_len(layer);
            assert_eq!(
                len, expected,
                "kv cache of layer {layer} holds {len} positions, expected {expected}"
            );
        }
        self.tokens = expected;
    }

    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(|slot| *slot = None);
        self.tokens = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn step(cache: &mut KvCache, seq: usize) -> Result<()> {
        let kv = Tensor::zeros((1, 2, seq, 4), DType::F32, &Device::Cpu)?;
        for layer in 0..cache.num_layers() {
            let (k, v) = cache.append(layer, &kv, &kv)?;
            assert_eq!(k.dims(), v.dims());
        }
        cache.commit(seq);
        Ok(())
    }

    #[test]
    fn test_cache_growth() -> Result<()> {
        let mut cache = KvCache::new(3);
        step(&mut cache, 5)?;
        for n in 1..=4 {
            step(&mut cache, 1)?;
            assert_eq!(cache.tokens_processed(), 5 + n);
            for layer in 0..3 {
                assert_eq!(cache.layer_len(layer), 5 + n);
            }
        }
        cache.reset();
        assert_eq!(cache.tokens_processed(), 0);
        assert_eq!(cache.layer_len(0), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "kv cache of layer 1")]
    fn test_divergent_layers_panic() {
        let mut cache = KvCache::new(2);
        let kv = Tensor::zeros((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        cache.append(0, &kv, &kv).unwrap();
        cache.commit(2);
    }
}
