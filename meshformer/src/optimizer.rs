//! Optimizer contract and plain SGD with momentum.

use crate::params::{HostTensor, ParamSet};
use crate::{Error, Result};

/// An optimizer over shard-local host parameters.
///
/// Each worker owns one optimizer state for its own parameter slice.
/// Gradients arrive already averaged over the batch axis.
pub trait Optimizer: Send + Sync {
    type State: Send;

    /// # Errors
    /// Returns an error if the parameters cannot be tracked.
    fn init(&self, params: &ParamSet) -> Result<Self::State>;

    /// Returns the additive updates and the next state.
    ///
    /// # Errors
    /// Returns an error if `grads` does not cover `params`.
    fn update(
        &self,
        grads: &ParamSet,
        state: Self::State,
        params: &ParamSet,
    ) -> Result<(ParamSet, Self::State)>;
}

/// SGD with heavy-ball momentum.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: f32,
}

impl Sgd {
    #[must_use]
    pub const fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
        }
    }
}

impl Optimizer for Sgd {
    type State = ParamSet;

    fn init(&self, params: &ParamSet) -> Result<ParamSet> {
        Ok(params
            .iter()
            .map(|(path, t)| (path.clone(), HostTensor::zeros(t.shape())))
            .collect())
    }

    fn update(
        &self,
        grads: &ParamSet,
        mut velocity: ParamSet,
        params: &ParamSet,
    ) -> Result<(ParamSet, ParamSet)> {
        let mut updates = ParamSet::new();
        for (path, param) in params {
            let grad = grads
                .get(path)
                .ok_or_else(|| Error::MissingParameter(format!("gradient for {path}")))?;
            let v = velocity
                .get_mut(path)
                .ok_or_else(|| Error::MissingParameter(format!("optimizer state for {path}")))?;
            if grad.shape() != param.shape() || v.shape() != param.shape() {
                return Err(Error::InvalidShape(format!(
                    "gradient {:?} for parameter {:?} at {path}",
                    grad.shape(),
                    param.shape()
                )));
            }
            for (vi, gi) in v.data_mut().iter_mut().zip(grad.data()) {
                *vi = self.momentum * *vi + gi;
            }
            let step = v.data().iter().map(|vi| -self.learning_rate * vi).collect();
            updates.insert(path.clone(), HostTensor::new(param.shape(), step)?);
        }
        Ok((updates, velocity))
    }
}

/// `params += updates`.
///
/// # Errors
/// Returns an error if an update has no matching parameter or shape.
pub fn apply_updates(params: &mut ParamSet, updates: &ParamSet) -> Result<()> {
    for (path, update) in updates {
        let param = params
            .get_mut(path)
            .ok_or_else(|| Error::MissingParameter(path.clone()))?;
        if param.shape() != update.shape() {
            return Err(Error::InvalidShape(format!(
                "update {:?} for parameter {:?} at {path}",
                update.shape(),
                param.shape()
            )));
        }
        for (p, u) in param.data_mut().iter_mut().zip(update.data()) {
            *p += u;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(values: &[f32]) -> ParamSet {
        let mut set = ParamSet::new();
        set.insert(
            "w".to_string(),
            HostTensor::new(&[values.len()], values.to_vec()).unwrap(),
        );
        set
    }

    #[test]
    fn test_sgd_step() {
        let sgd = Sgd::new(0.1);
        let mut params = single(&[1.0, -1.0]);
        let state = sgd.init(&params).unwrap();
        let (updates, _) = sgd.update(&single(&[2.0, -4.0]), state, &params).unwrap();
        apply_updates(&mut params, &updates).unwrap();
        assert_eq!(params["w"].data(), &[0.8, -0.6]);
    }

    #[test]
    fn test_momentum_accumulates() {
        let sgd = Sgd {
            learning_rate: 1.0,
            momentum: 0.5,
        };
        let params = single(&[0.0]);
        let state = sgd.init(&params).unwrap();
        let (_, state) = sgd.update(&single(&[1.0]), state, &params).unwrap();
        let (updates, _) = sgd.update(&single(&[1.0]), state, &params).unwrap();
        assert_eq!(updates["w"].data(), &[-1.5]);
    }

    #[test]
    fn test_missing_gradient() {
        let sgd = Sgd::new(0.1);
        let params = single(&[1.0]);
        let state = sgd.init(&params).unwrap();
        assert!(matches!(
            sgd.update(&ParamSet::new(), state, &params),
            Err(Error::MissingParameter(_))
        ));
    }
}
