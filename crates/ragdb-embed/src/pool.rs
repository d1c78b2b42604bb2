use candle_core::{DType, Tensor};

use ragdb_core::error::{Error, Result};

/// Sentence vector from token states: mean over the tokens whose mask is set,
/// then unit length. `hidden` is `[batch, tokens, width]`, `mask` is
/// `[batch, tokens]` of 0/1 in any dtype. A row with no unmasked token pools
/// to zeros instead of dividing by zero.
pub fn masked_mean_l2(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, tokens, width) = hidden.dims3().map_err(pool_err)?;
    if mask.dims() != [batch, tokens] {
        return Err(Error::Encoding(format!(
            "attention mask shape {:?} does not match hidden states [{batch}, {tokens}, {width}]",
            mask.dims()
        )));
    }
    let run = || -> candle_core::Result<Tensor> {
        let weights = mask.to_device(hidden.device())?.to_dtype(hidden.dtype())?;
        let summed = hidden.broadcast_mul(&weights.unsqueeze(2)?)?.sum(1)?;
        let counts = weights.sum_keepdim(1)?.maximum(1.0)?;
        let mean = summed.broadcast_div(&counts)?;
        let eps = if hidden.dtype() == DType::F16 { 1e-6 } else { 1e-12 };
        let norms = (mean.sqr()?.sum_keepdim(1)?.sqrt()? + eps)?;
        mean.broadcast_div(&norms)
    };
    run().map_err(pool_err)
}

fn pool_err(e: candle_core::Error) -> Error { Error::Encoding(format!("pooling failed: {e}")) }
