//! Joint tensors
//!
//! Joint tensors are a short query/key/value segment (e.g. text tokens)
//! replicated on every rank. The joint query joins the local query before
//! the exchange; the joint key/value skip the exchange and are handed to
//! the kernel sliced to the heads the rank holds.

use crate::params::AttentionParams;
use candle_core::Tensor;
use uniseq_comm::HeadRange;
use uniseq_types::{JointStrategy, Result, UniseqError};

/// Validated joint tensors of one forward call
#[derive(Debug, Clone)]
pub struct JointInputs {
    query: Tensor,
    key: Tensor,
    value: Tensor,
    strategy: JointStrategy,
}

impl JointInputs {
    /// Validate the joint arguments of a call
    ///
    /// Returns `None` when no joint tensor is given; the placement is only
    /// checked when all three are. Partial joint tensors and placements other
    /// than front/rear are input errors.
    pub fn resolve(
        query: Option<&Tensor>,
        key: Option<&Tensor>,
        value: Option<&Tensor>,
        strategy: &str,
    ) -> Result<Option<Self>> {
        match (query, key, value) {
            (None, None, None) => Ok(None),
            (Some(query), Some(key), Some(value)) => {
                let strategy: JointStrategy = strategy.parse()?;
                if strategy == JointStrategy::None {
                    return Err(UniseqError::input_validation(
                        "joint tensors given with joint_strategy none, supported joint strategy: [front, rear]",
                    ));
                }
                let (qb, qs, qh, qd) = query.dims4()?;
                let kv = key.dims4()?;
                if value.dims4()? != kv || kv.0 != qb || kv.1 != qs || kv.2 != qh || kv.3 != qd {
                    return Err(UniseqError::input_validation(format!(
                        "joint tensors disagree in shape: query {:?}, key {:?}, value {:?}",
                        query.dims(),
                        key.dims(),
                        value.dims()
                    )));
                }
                Ok(Some(Self {
                    query: query.clone(),
                    key: key.clone(),
                    value: value.clone(),
                    strategy,
                }))
            }
            _ => Err(UniseqError::input_validation(
                "joint_query, joint_key, and joint_value should be None or not None simultaneously",
            )),
        }
    }

    /// [`Self::resolve`] on the joint fields of `params`
    pub fn from_params(params: &AttentionParams) -> Result<Option<Self>> {
        Self::resolve(
            params.joint_query.as_ref(),
            params.joint_key.as_ref(),
            params.joint_value.as_ref(),
            &params.joint_strategy,
        )
    }

    pub fn strategy(&self) -> JointStrategy {
        self.strategy
    }

    /// Joint segment length
    pub fn len(&self) -> Result<usize> {
        Ok(self.query.dim(1)?)
    }

    /// Join the joint query to the local query along the sequence axis
    pub fn concat_query(&self, query: &Tensor) -> Result<Tensor> {
        let (b, _, h, d) = query.dims4()?;
        let (jb, _, jh, jd) = self.query.dims4()?;
        if (b, h, d) != (jb, jh, jd) {
            return Err(UniseqError::input_validation(format!(
                "joint query {:?} does not fit query {:?}",
                self.query.dims(),
                query.dims()
            )));
        }
        let joined = match self.strategy {
            JointStrategy::Front => Tensor::cat(&[&self.query, query], 1)?,
            _ => Tensor::cat(&[query, &self.query], 1)?,
        };
        Ok(joined)
    }

    /// Joint key/value restricted to `range` of heads
    pub fn slice_heads(&self, range: HeadRange) -> Result<(Tensor, Tensor)> {
        Ok((range.slice(&self.key, 2)?, range.slice(&self.value, 2)?))
    }
}
