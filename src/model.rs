use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::{linear, ops, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub embedding_size: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_size: 150,
            num_hidden_layers: 1,
            embedding_size: 300,
        }
    }
}

/// Stacked GRU over word vectors, read out through a 2-way linear layer and
/// a sigmoid.
pub struct BinaryClassifier {
    layers: Vec<GRU>,
    fc: Linear,
    hidden_size: usize,
    embedding_size: usize,
}

impl BinaryClassifier {
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let in_dim = if i == 0 {
                config.embedding_size
            } else {
                config.hidden_size
            };
            layers.push(gru(
                in_dim,
                config.hidden_size,
                GRUConfig::default(),
                vb.pp(format!("gru{}", i)),
            )?);
        }
        let fc = linear(config.hidden_size, 2, vb.pp("fc"))?;

        Ok(Self {
            layers,
            fc,
            hidden_size: config.hidden_size,
            embedding_size: config.embedding_size,
        })
    }

    /// One zeroed `(batch, hidden_size)` state per layer.
    pub fn init_hidden(&self, batch: usize, device: &Device) -> Result<Vec<Tensor>> {
        (0..self.layers.len())
            .map(|_| Tensor::zeros((batch, self.hidden_size), DType::F32, device))
            .collect()
    }

    /// `input` is `(batch, seq_len, embedding_size)`. Returns the `(batch, 2)`
    /// class probabilities and the final hidden state of every layer,
    /// detached from the graph.
    pub fn forward(&self, input: &Tensor, hidden: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let (_, seq_len, emb) = input.dims3()?;
        if emb != self.embedding_size {
            bail!("expected {} features per step, got {emb}", self.embedding_size)
        }
        if seq_len == 0 {
            bail!("cannot classify an empty sequence")
        }
        if hidden.len() != self.layers.len() {
            bail!("expected {} hidden states, got {}", self.layers.len(), hidden.len())
        }

        let mut out = input.clone();
        let mut last = Vec::with_capacity(self.layers.len());
        for (layer, h0) in self.layers.iter().zip(hidden) {
            let states = layer.seq_init(&out, &GRUState { h: h0.clone() })?;
            let hs: Vec<Tensor> = states.into_iter().map(|s| s.h).collect();
            out = Tensor::stack(&hs, 1)?;
            last.push(hs[seq_len - 1].clone());
        }

        let probs = ops::sigmoid(&self.fc.forward(&last[last.len() - 1])?)?;
        let next_hidden = last.iter().map(|h| h.detach()).collect();
        Ok((probs, next_hidden))
    }
}

pub fn num_trainable_params(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(num_hidden_layers: usize) -> Result<(BinaryClassifier, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = ClassifierConfig {
            hidden_size: 5,
            num_hidden_layers,
            embedding_size: 4,
        };
        Ok((BinaryClassifier::new(&cfg, vb)?, varmap))
    }

    #[test]
    fn forward_shapes() -> Result<()> {
        let (model, _) = classifier(2)?;
        let input = Tensor::randn(0f32, 1., (3, 7, 4), &Device::Cpu)?;
        let hidden = model.init_hidden(3, &Device::Cpu)?;
        let (probs, next) = model.forward(&input, &hidden)?;
        assert_eq!(probs.dims(), &[3, 2]);
        assert_eq!(next.len(), 2);
        assert_eq!(next[1].dims(), &[3, 5]);
        for p in probs.flatten_all()?.to_vec1::<f32>()? {
            assert!((0.0..=1.0).contains(&p));
        }
        Ok(())
    }

    #[test]
    fn param_count_matches_gru_and_linear() -> Result<()> {
        let (_, varmap) = classifier(1)?;
        // GRU: 3 gates * (h*in + h*h + 2h); linear: 2h + 2
        let expected = 3 * (5 * 4 + 5 * 5 + 2 * 5) + (5 * 2 + 2);
        assert_eq!(num_trainable_params(&varmap), expected);
        Ok(())
    }

    #[test]
    fn wrong_feature_size_is_rejected() -> Result<()> {
        let (model, _) = classifier(1)?;
        let input = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu)?;
        let hidden = model.init_hidden(1, &Device::Cpu)?;
        assert!(model.forward(&input, &hidden).is_err());
        Ok(())
    }

    #[test]
    fn hidden_state_changes_the_output() -> Result<()> {
        let (model, _) = classifier(1)?;
        let input = Tensor::randn(0f32, 1., (1, 3, 4), &Device::Cpu)?;
        let zeros = model.init_hidden(1, &Device::Cpu)?;
        let (_, carried) = model.forward(&input, &zeros)?;
        let (a, _) = model.forward(&input, &zeros)?;
        let (b, _) = model.forward(&input, &carried)?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }
}
