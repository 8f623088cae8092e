//! Linear (fully connected) layer.

use rand::Rng;
use tg_tensor::prelude::*;

/// A linear (fully connected) layer: y = x @ W^T + b
///
/// Parameters are registered as trainable variables named `{name}/kernel`
/// and `{name}/bias`.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix [out_features, in_features]
    pub weight: Variable,
    /// Bias vector [out_features]
    pub bias: Option<Variable>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Create a new linear layer with random initialization.
    ///
    /// Uses Kaiming initialization (He et al.) for ReLU networks.
    pub fn new(
        engine: &Engine,
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
    ) -> Result<Self> {
        Self::with_rng(engine, name, in_features, out_features, bias, &mut rand::thread_rng())
    }

    /// [`new`](Self::new) drawing from `rng`.
    pub fn with_rng<R: Rng>(
        engine: &Engine,
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        // Kaiming initialization: std = sqrt(2 / fan_in)
        let std = (2.0 / in_features.max(1) as f32).sqrt();
        let weight_data: Vec<f32> = (0..out_features * in_features)
            .map(|_| rng.gen::<f32>() * std * 2.0 - std)
            .collect();

        let weight = new_variable(
            engine,
            &format!("{name}/kernel"),
            engine.tensor2d(&weight_data, out_features, in_features)?,
        )?;
        let bias = if bias {
            Some(new_variable(engine, &format!("{name}/bias"), engine.zeros([out_features])?)?)
        } else {
            None
        };
        log::debug!("linear layer '{name}': {in_features} -> {out_features}");

        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Forward pass: y = x @ W^T + b
    ///
    /// Input x has shape [batch, in_features].
    /// Output has shape [batch, out_features].
    pub fn forward(&self, engine: &Engine, x: &Tensor) -> Result<Tensor> {
        engine.tidy(|| {
            let weight = engine.read_variable(&self.weight)?;
            let y = engine.matmul(x, &weight, false, true)?;
            match &self.bias {
                Some(bias) => engine.add(&y, &engine.read_variable(bias)?),
                None => Ok(y),
            }
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Get all trainable parameters.
    pub fn parameters(&self) -> Vec<Variable> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.clone());
        params
    }

    /// Copies of the current parameter values, weight first.
    pub fn get_weights(&self, engine: &Engine) -> Result<Vec<Tensor>> {
        self.parameters()
            .iter()
            .map(|p| engine.clone_tensor(&engine.read_variable(p)?))
            .collect()
    }

    /// Overwrite the parameters from values in [`get_weights`](Self::get_weights) order.
    pub fn set_weights(&self, engine: &Engine, weights: &[Tensor]) -> Result<()> {
        let params = self.parameters();
        if weights.len() != params.len() {
            return Err(Error::InvalidArgument {
                op: "set_weights".to_string(),
                reason: format!("expected {} tensors, got {}", params.len(), weights.len()),
            });
        }
        for (param, value) in params.iter().zip(weights) {
            engine.assign(param, value)?;
        }
        Ok(())
    }

    /// Unregister the layer's variables.
    pub fn dispose(&self, engine: &Engine) -> Result<()> {
        for param in self.parameters() {
            engine.dispose_variable(&param)?;
        }
        Ok(())
    }
}

/// Register `initial` as a trainable variable and drop the temporary.
fn new_variable(engine: &Engine, name: &str, initial: Tensor) -> Result<Variable> {
    let var = engine.variable(&initial, Some(name), true);
    engine.dispose(&initial)?;
    var
}
