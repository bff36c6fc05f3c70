//! One transformer layer on one shard: norms, attention, feedforward and
//! the residual wiring of the architecture variant.

use meshformer::{
    AttentionBias, Comm, ModelConfig, NormPlacement, Replicated, Residual, Result, ShardLocal,
};

use crate::attention::{AttentionCore, DecodeState, RotaryTables};
use crate::feedforward::FeedForward;
use crate::norm::Norm;
use crate::weights::{SublayerOutput, WeightSource};
use crate::TransformerOps;

pub struct LayerShard<B: TransformerOps> {
    norm_1: Norm<B>,
    /// `None` when the parallel residual shares `norm_1`.
    norm_2: Option<Norm<B>>,
    attention: AttentionCore<B>,
    feedforward: FeedForward<B>,
    residual: Residual,
    placement: NormPlacement,
}

impl<B: TransformerOps> LayerShard<B> {
    pub(crate) fn load(
        source: &WeightSource<'_>,
        config: &ModelConfig,
        layer: usize,
        rotary: Option<RotaryTables<B>>,
    ) -> Result<Self> {
        let spec = config.spec();
        let prefix = format!("layers.{layer}");
        let norm_2 = match spec.residual {
            Residual::Parallel { shared_norm: true } => None,
            _ => Some(Norm::load(source, &format!("{prefix}.norm_2"), config.norm)?),
        };
        Ok(Self {
            norm_1: Norm::load(source, &format!("{prefix}.norm_1"), config.norm)?,
            norm_2,
            attention: AttentionCore::load(
                source,
                &format!("{prefix}.attention"),
                config,
                layer,
                rotary,
            )?,
            feedforward: FeedForward::load(source, &format!("{prefix}.feedforward"), config)?,
            residual: spec.residual,
            placement: spec.norm_placement,
        })
    }

    pub const fn attention(&self) -> &AttentionCore<B> {
        &self.attention
    }

    /// Forward pass through the layer over a full sequence.
    pub fn forward(
        &self,
        x: &Replicated<B::Tensor>,
        positional: &AttentionBias,
        comm: &B::Comm,
    ) -> Result<Replicated<B::Tensor>> {
        let (out, ()) = self.run(x, comm, |attention, input| {
            Ok((attention.forward(input, positional, comm)?, ()))
        })?;
        Ok(out)
    }

    /// Forward pass that also primes this layer's decode state.
    pub fn get_init_decode_state(
        &self,
        x: &Replicated<B::Tensor>,
        given_length: usize,
        positional: &AttentionBias,
        comm: &B::Comm,
    ) -> Result<(Replicated<B::Tensor>, DecodeState<B>)> {
        self.run(x, comm, |attention, input| {
            attention.get_init_decode_state(input, given_length, positional, comm)
        })
    }

    /// One-token forward pass against this layer's decode state.
    pub fn decode_once(
        &self,
        state: DecodeState<B>,
        x: &Replicated<B::Tensor>,
        positional: &AttentionBias,
        comm: &B::Comm,
    ) -> Result<(Replicated<B::Tensor>, DecodeState<B>)> {
        self.run(x, comm, |attention, input| {
            attention.decode_once(state, input, positional, comm)
        })
    }

    /// Residual wiring shared by every pass; `attend` is the only part that
    /// differs between full-sequence and incremental passes.
    fn run<S>(
        &self,
        x: &Replicated<B::Tensor>,
        comm: &B::Comm,
        attend: impl FnOnce(
            &AttentionCore<B>,
            &ShardLocal<B::Tensor>,
        ) -> Result<(SublayerOutput<B::Tensor>, S)>,
    ) -> Result<(Replicated<B::Tensor>, S)> {
        match (self.residual, self.placement) {
            (Residual::Parallel { .. }, _) => {
                let attn_in = self.norm_1.forward(x, comm)?;
                let ff_in = match &self.norm_2 {
                    Some(norm) => norm.forward(x, comm)?,
                    None => attn_in.clone(),
                };
                let (attn_out, state) = attend(&self.attention, &attn_in)?;
                let ff_out = self.feedforward.forward(&ff_in, comm)?;
                let update = match (attn_out, ff_out) {
                    (SublayerOutput::Partial(a), SublayerOutput::Partial(f)) => {
                        comm.all_reduce_sum(a.zip(&f, |a, f| B::add(a, f))?)?
                    }
                    (a, f) => {
                        let a = a.reduce(comm)?;
                        let f = f.reduce(comm)?;
                        a.zip(&f, |a, f| B::add(a, f))?
                    }
                };
                Ok((residual_add::<B>(x, &update)?, state))
            }
            (Residual::Sequential, NormPlacement::Pre) => {
                let attn_in = self.norm_1.forward(x, comm)?;
                let (attn_out, state) = attend(&self.attention, &attn_in)?;
                let h = residual_add::<B>(x, &attn_out.reduce(comm)?)?;

                let ff_in = self.second_norm().forward(&h, comm)?;
                let ff_out = self.feedforward.forward(&ff_in, comm)?.reduce(comm)?;
                Ok((residual_add::<B>(&h, &ff_out)?, state))
            }
            (Residual::Sequential, NormPlacement::Post) => {
                let (attn_out, state) = attend(&self.attention, &x.clone().localize())?;
                let h = residual_add::<B>(x, &attn_out.reduce(comm)?)?;
                let h = self.norm_1.forward_synced(&h, comm)?;

                let ff_out = self
                    .feedforward
                    .forward(&h.clone().localize(), comm)?
                    .reduce(comm)?;
                let out = residual_add::<B>(&h, &ff_out)?;
                Ok((self.second_norm().forward_synced(&out, comm)?, state))
            }
        }
    }

    fn second_norm(&self) -> &Norm<B> {
        self.norm_2.as_ref().unwrap_or(&self.norm_1)
    }
}

fn residual_add<B: TransformerOps>(
    x: &Replicated<B::Tensor>,
    update: &Replicated<B::Tensor>,
) -> Result<Replicated<B::Tensor>> {
    x.zip(update, |x, u| B::add(x, u))
}
