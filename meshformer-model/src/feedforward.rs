//! Position-wise feedforward: column-parallel up, row-parallel down.

use meshformer::{Activation, CollectivePoint, ModelConfig, Result, ShardLocal, Tensor};

use crate::weights::{Linear, RowLinear, SublayerOutput, WeightSource};
use crate::TransformerOps;

pub struct FeedForward<B: TransformerOps> {
    up: Linear<B>,
    down: RowLinear<B>,
    activation: Activation,
    /// Local `d_ff` slice when the up projection is gated.
    glu_width: Option<usize>,
    collective: CollectivePoint,
}

impl<B: TransformerOps> FeedForward<B> {
    pub(crate) fn load(
        source: &WeightSource<'_>,
        prefix: &str,
        config: &ModelConfig,
    ) -> Result<Self> {
        let up = Linear::load(source, &format!("{prefix}.up"))?;
        let glu_width = config.glu.then(|| up.out_features() / 2);
        Ok(Self {
            up,
            down: RowLinear::load(source, &format!("{prefix}.down"))?,
            activation: config.activation,
            glu_width,
            collective: config.collective,
        })
    }

    /// `down(act(up(x)))`, or `down(value * act(gate))` when gated.
    pub fn forward(
        &self,
        input: &ShardLocal<B::Tensor>,
        comm: &B::Comm,
    ) -> Result<SublayerOutput<B::Tensor>> {
        let hidden = self.up.forward(input.get())?;
        let hidden = match self.glu_width {
            Some(width) => {
                let axis = hidden.ndim() - 1;
                let value = B::narrow(&hidden, axis, 0, width)?;
                let gate = B::narrow(&hidden, axis, width, width)?;
                B::mul(&value, &B::activation(&gate, self.activation)?)?
            }
            None => B::activation(&hidden, self.activation)?,
        };
        self.down.forward(&hidden, self.collective, comm)
    }
}
