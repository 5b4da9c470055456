//! Multi-head self-attention

use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};

use super::activation::softmax_inplace;
use super::linear::Linear;
use super::rotary::RotaryEmbedding;
use crate::error::{MlError, MlResult};

/// Bidirectional scaled dot-product attention with optional rotary q/k
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    hidden: usize,
    num_heads: usize,
    head_dim: usize,
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    rotary: Option<Arc<RotaryEmbedding>>,
}

/// Projection slot inside an attention layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Query,
    Key,
    Value,
    Output,
}

impl MultiHeadAttention {
    pub fn new(
        name: &str,
        hidden: usize,
        num_heads: usize,
        rotary: Option<Arc<RotaryEmbedding>>,
    ) -> MlResult<Self> {
        if num_heads == 0 || hidden % num_heads != 0 {
            return Err(MlError::Config(format!(
                "{name}: hidden {hidden} not divisible by {num_heads} heads"
            )));
        }
        let head_dim = hidden / num_heads;
        if let Some(rope) = &rotary {
            if rope.dim() != head_dim {
                return Err(MlError::Config(format!(
                    "{name}: rotary dim {} differs from head dim {head_dim}",
                    rope.dim()
                )));
            }
        }

        Ok(Self {
            hidden,
            num_heads,
            head_dim,
            q: Linear::new(format!("{name}.q"), hidden, hidden),
            k: Linear::new(format!("{name}.k"), hidden, hidden),
            v: Linear::new(format!("{name}.v"), hidden, hidden),
            out: Linear::new(format!("{name}.out"), hidden, hidden),
            rotary,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn load_projection(
        &mut self,
        which: Projection,
        weight: ArrayView2<f32>,
        bias: ArrayView1<f32>,
    ) -> MlResult<()> {
        let layer = match which {
            Projection::Query => &mut self.q,
            Projection::Key => &mut self.k,
            Projection::Value => &mut self.v,
            Projection::Output => &mut self.out,
        };
        layer.load_weights(weight, bias)
    }

    /// `[seq, hidden] -> [seq, hidden]`
    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let out = self.forward_batch(x.insert_axis(Axis(0)))?;
        Ok(out.index_axis_move(Axis(0), 0))
    }

    /// `[batch, seq, hidden] -> [batch, seq, hidden]`, each batch item attends independently
    pub fn forward_batch(&self, x: ArrayView3<f32>) -> MlResult<Array3<f32>> {
        let (batch, seq, hidden) = x.dim();
        if hidden != self.hidden {
            return Err(MlError::shape(
                format!("{} hidden features", self.hidden),
                format!("{hidden}"),
            ));
        }
        if let Some(rope) = &self.rotary {
            if seq > rope.max_seq_len() {
                return Err(MlError::PositionOverflow {
                    len: seq,
                    max: rope.max_seq_len(),
                });
            }
        }

        let rows = x
            .to_shape((batch * seq, hidden))
            .map_err(|e| MlError::shape(format!("[{}, {hidden}]", batch * seq), e.to_string()))?;
        let q = self.q.forward(rows.view())?;
        let k = self.k.forward(rows.view())?;
        let v = self.v.forward(rows.view())?;

        let scale = (self.head_dim as f32).sqrt();
        let mut context = Array2::<f32>::zeros((batch * seq, hidden));

        for b in 0..batch {
            let r0 = b * seq;
            let r1 = r0 + seq;
            for h in 0..self.num_heads {
                let c0 = h * self.head_dim;
                let c1 = c0 + self.head_dim;

                let mut qh = q.slice(s![r0..r1, c0..c1]).to_owned();
                let mut kh = k.slice(s![r0..r1, c0..c1]).to_owned();
                let vh = v.slice(s![r0..r1, c0..c1]);

                if let Some(rope) = &self.rotary {
                    rope.apply(qh.view_mut())?;
                    rope.apply(kh.view_mut())?;
                }

                let mut scores = qh.dot(&kh.t());
                scores.mapv_inplace(|v| v / scale);
                for row in scores.rows_mut() {
                    softmax_inplace(row);
                }

                context.slice_mut(s![r0..r1, c0..c1]).assign(&scores.dot(&vh));
            }
        }

        let projected = self.out.forward(context.view())?;
        projected
            .into_shape_with_order((batch, seq, hidden))
            .map_err(|e| MlError::shape(format!("[{batch}, {seq}, {hidden}]"), e.to_string()))
    }
}
