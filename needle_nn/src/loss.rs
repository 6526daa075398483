//! Loss functions.

use needle_tensor::prelude::*;

use crate::activations::log_softmax;

/// Mean Squared Error loss: mean((pred - target)^2)
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = pred.sub(target)?;
    diff.mul(&diff)?.mean(None, false)
}

/// Binary Cross-Entropy loss with logits.
///
/// Computes: mean(max(logits, 0) - logits * targets + log(1 + exp(-|logits|)))
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let abs_logits = logits.maximum(&logits.neg()?)?;
    let log_term = abs_logits.neg()?.exp()?.add_scalar(1.0)?.log()?;
    logits
        .relu()?
        .sub(&logits.mul(targets)?)?
        .add(&log_term)?
        .mean(None, false)
}

/// Soft Cross-Entropy loss with target probabilities.
///
/// `logits` and `targets` are `[batch, num_classes]`; targets may be one-hot
/// or soft labels. Returns `-mean(sum(targets * log_softmax(logits)))`.
pub fn soft_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = log_softmax(logits)?;
    let class_axis = logits.ndim() - 1;
    targets
        .mul(&log_probs)?
        .sum(Some(&[class_axis]), false)?
        .neg()?
        .mean(None, false)
}

/// Cross-Entropy loss for class indices, `logits` being `[batch, num_classes]`.
pub fn cross_entropy(logits: &Tensor, labels: &[usize]) -> Result<Tensor> {
    if logits.ndim() != 2 {
        return Err(TensorError::invalid(format!(
            "cross_entropy expects [batch, classes] logits, got {}",
            logits.shape()
        )));
    }
    let targets = one_hot(labels, logits.shape().dim(1), logits)?;
    if targets.shape() != logits.shape() {
        return Err(TensorError::shape_mismatch(
            "cross_entropy",
            logits.shape(),
            targets.shape(),
        ));
    }
    soft_cross_entropy(logits, &targets)
}

/// One-hot rows for `labels`, with the dtype, device and mode of `like`.
pub fn one_hot(labels: &[usize], num_classes: usize, like: &Tensor) -> Result<Tensor> {
    let mut values = vec![0.0; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(TensorError::invalid(format!(
                "label {label} out of range for {num_classes} classes"
            )));
        }
        values[row * num_classes + label] = 1.0;
    }
    let array = NDArray::from_f64(
        &values,
        [labels.len(), num_classes],
        like.dtype(),
        like.device(),
    )?;
    Ok(Tensor::from_ndarray(array, false, like.mode()))
}
