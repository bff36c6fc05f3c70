//! Uploading a worker's parameter slice and the two linear layouts.

use meshformer::{
    CollectivePoint, Comm, Error, HostTensor, ParamSet, Replicated, Result, ShardLocal, Tensor,
};

use crate::TransformerOps;

/// Read access to one worker's host parameters.
pub(crate) struct WeightSource<'a> {
    params: &'a ParamSet,
}

impl<'a> WeightSource<'a> {
    pub(crate) fn new(params: &'a ParamSet) -> Self {
        Self { params }
    }

    pub(crate) fn host(&self, path: &str) -> Result<&'a HostTensor> {
        self.params
            .get(path)
            .ok_or_else(|| Error::MissingParameter(path.to_string()))
    }

    pub(crate) fn contains(&self, path: &str) -> bool {
        self.params.contains_key(path)
    }

    pub(crate) fn load_tensor<B: TransformerOps>(&self, path: &str) -> Result<B::Tensor> {
        let host = self.host(path)?;
        B::from_f32(host.shape(), host.data())
    }

    pub(crate) fn load_optional<B: TransformerOps>(&self, path: &str) -> Result<Option<B::Tensor>> {
        if self.contains(path) {
            self.load_tensor::<B>(path).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Column-parallel projection: full input, a slice of the outputs.
pub(crate) struct Linear<B: TransformerOps> {
    weight: B::Tensor,
    bias: Option<B::Tensor>,
}

impl<B: TransformerOps> Linear<B> {
    pub(crate) fn load(source: &WeightSource<'_>, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: source.load_tensor::<B>(&format!("{prefix}.weight"))?,
            bias: source.load_optional::<B>(&format!("{prefix}.bias"))?,
        })
    }

    /// Local output width.
    pub(crate) fn out_features(&self) -> usize {
        self.weight.last_dim()
    }

    pub(crate) fn forward(&self, input: &B::Tensor) -> Result<B::Tensor> {
        let out = B::matmul(input, &self.weight)?;
        match &self.bias {
            Some(bias) => B::add_bias(&out, bias),
            None => Ok(out),
        }
    }
}

/// Row-parallel projection: a slice of the inputs, a partial sum of the
/// full output. The bias is a full copy on every rank.
pub(crate) struct RowLinear<B: TransformerOps> {
    weight: B::Tensor,
    bias: Option<B::Tensor>,
}

/// Output of a row-parallel sublayer, reduced or not depending on where the
/// layer places its collective.
pub enum SublayerOutput<T> {
    Partial(ShardLocal<T>),
    Reduced(Replicated<T>),
}

impl<B: TransformerOps> RowLinear<B> {
    pub(crate) fn load(source: &WeightSource<'_>, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: source.load_tensor::<B>(&format!("{prefix}.weight"))?,
            bias: source.load_optional::<B>(&format!("{prefix}.bias"))?,
        })
    }

    /// Late collective: return the partial sum, with the bias added by rank
    /// 0 only so the later reduction counts it once.
    /// Early collective: reduce right away, then add the bias everywhere.
    pub(crate) fn forward(
        &self,
        input: &B::Tensor,
        point: CollectivePoint,
        comm: &B::Comm,
    ) -> Result<SublayerOutput<B::Tensor>> {
        let partial = B::matmul(input, &self.weight)?;
        match point {
            CollectivePoint::Late => {
                let partial = match &self.bias {
                    Some(bias) if comm.rank() == 0 => B::add_bias(&partial, bias)?,
                    _ => partial,
                };
                Ok(SublayerOutput::Partial(ShardLocal::new(partial)))
            }
            CollectivePoint::Early => {
                let reduced = comm.all_reduce_sum(ShardLocal::new(partial))?;
                let reduced = match &self.bias {
                    Some(bias) => reduced.map(|out| B::add_bias(&out, bias))?,
                    None => reduced,
                };
                Ok(SublayerOutput::Reduced(reduced))
            }
        }
    }
}

impl<T> SublayerOutput<T> {
    /// Bring the output onto every rank of the group.
    pub fn reduce<C: Comm<T>>(self, comm: &C) -> Result<Replicated<T>> {
        match self {
            Self::Partial(partial) => comm.all_reduce_sum(partial),
            Self::Reduced(reduced) => Ok(reduced),
        }
    }
}

/// Sum one host scalar across the group.
pub(crate) fn reduce_scalar<B: TransformerOps>(comm: &B::Comm, value: f32) -> Result<f32> {
    let local = B::from_f32(&[1], &[value])?;
    let reduced = comm.all_reduce_sum(ShardLocal::new(local))?;
    let values = B::to_f32_vec(reduced.get())?;
    values
        .first()
        .copied()
        .ok_or_else(|| Error::Collective("scalar reduction returned no value".into()))
}
