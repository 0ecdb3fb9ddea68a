/// Masked cross-entropy with optional label smoothing
use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::{CaptionError, Result};

/// Probability mass moved off the gold class when smoothing
pub const LABEL_SMOOTHING_EPS: f64 = 0.1;

/// Loss and token counts for one batch
#[derive(Debug, Clone)]
pub struct Performance {
    /// Output of [`cal_loss`]: a mean without smoothing, a sum with it
    pub loss: Tensor,
    /// Loss averaged over non-padding tokens in both modes
    pub loss_per_word: Tensor,
    /// Number of non-padding gold tokens
    pub n_word: usize,
    /// Non-padding positions where the arg-max prediction is the gold token
    pub n_correct: usize,
}

impl Performance {
    pub fn loss_per_word_value(&self) -> Result<f64> {
        Ok(self.loss_per_word.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }
}

/// [batch, classes, seq] -> [batch * seq, classes]
fn flatten_scores(pred: &Tensor) -> Result<Tensor> {
    let (batch_size, n_class, seq_len) = pred.dims3()?;
    Ok(pred
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch_size * seq_len, n_class))?)
}

/// 1.0 where the gold token is not padding, as a float tensor [N]
fn non_pad_mask(gold: &[u32], trg_pad_idx: u32, like: &Tensor) -> Result<(Tensor, usize)> {
    let mask: Vec<f32> = gold
        .iter()
        .map(|&id| if id == trg_pad_idx { 0.0 } else { 1.0 })
        .collect();
    let n_word = mask.iter().filter(|&&m| m > 0.0).count();
    let mask = Tensor::from_vec(mask, gold.len(), like.device())?.to_dtype(like.dtype())?;
    Ok((mask, n_word))
}

/// Smoothed one-hot targets
///
/// The gold class gets `1 - eps`, every other class `eps / (n_class - 1)`,
/// so each row sums to 1.
///
/// # Arguments
/// * `gold` - Gold token ids [N] (u32)
/// * `n_class` - Number of classes, at least 2
/// * `eps` - Smoothing mass
///
/// # Returns
/// f32 tensor [N, n_class]
pub fn smoothed_targets(gold: &Tensor, n_class: usize, eps: f64) -> Result<Tensor> {
    if n_class < 2 {
        return Err(CaptionError::Loss(format!(
            "label smoothing needs at least 2 classes, got {}",
            n_class
        )));
    }

    let on_value = (1.0 - eps) as f32;
    let off_value = (eps / (n_class - 1) as f64) as f32;
    Ok(candle_nn::encoding::one_hot(
        gold.clone(),
        n_class,
        on_value,
        off_value,
    )?)
}

/// Cross-entropy between predicted scores and gold tokens
///
/// # Arguments
/// * `pred` - Raw class scores [batch, classes, seq]
/// * `gold` - Gold token ids [batch, seq] (u32)
/// * `trg_pad_idx` - Positions holding this id are ignored
/// * `smoothing` - Use label smoothing
///
/// # Returns
/// Scalar tensor. Without smoothing: mean over non-padding positions (0 when
/// every position is padding). With smoothing: sum over non-padding
/// positions; divide by the token count to get a mean.
pub fn cal_loss(pred: &Tensor, gold: &Tensor, trg_pad_idx: u32, smoothing: bool) -> Result<Tensor> {
    let scores = flatten_scores(pred)?;
    let gold = gold.flatten_all()?.contiguous()?;
    let (n_rows, n_class) = scores.dims2()?;

    if gold.dim(0)? != n_rows {
        return Err(CaptionError::Loss(format!(
            "{} predictions for {} gold tokens",
            n_rows,
            gold.dim(0)?
        )));
    }

    let gold_ids = gold.to_vec1::<u32>()?;
    let (mask, n_word) = non_pad_mask(&gold_ids, trg_pad_idx, &scores)?;
    let log_prb = log_softmax(&scores, D::Minus1)?;

    if smoothing {
        let one_hot = smoothed_targets(&gold, n_class, LABEL_SMOOTHING_EPS)?
            .to_dtype(log_prb.dtype())?;
        let loss = (one_hot * &log_prb)?.sum(1)?.neg()?;
        Ok((loss * mask)?.sum_all()?)
    } else {
        let nll = log_prb.gather(&gold.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?;
        let total = (nll * mask)?.sum_all()?;
        Ok((total / n_word.max(1) as f64)?)
    }
}

/// Loss plus word and accuracy counts for one batch
///
/// Same arguments as [`cal_loss`]. `loss_per_word` is what the epoch drivers
/// back-propagate, so both modes train at the same gradient scale.
pub fn cal_performance(
    pred: &Tensor,
    gold: &Tensor,
    trg_pad_idx: u32,
    smoothing: bool,
) -> Result<Performance> {
    let loss = cal_loss(pred, gold, trg_pad_idx, smoothing)?;

    let gold_ids = gold.flatten_all()?.to_vec1::<u32>()?;
    let predicted = flatten_scores(pred)?.argmax(D::Minus1)?.to_vec1::<u32>()?;

    let mut n_word = 0;
    let mut n_correct = 0;
    for (&gold_id, &pred_id) in gold_ids.iter().zip(predicted.iter()) {
        if gold_id == trg_pad_idx {
            continue;
        }
        n_word += 1;
        if gold_id == pred_id {
            n_correct += 1;
        }
    }

    let loss_per_word = if smoothing {
        (&loss / n_word.max(1) as f64)?
    } else {
        loss.clone()
    };

    Ok(Performance {
        loss,
        loss_per_word,
        n_word,
        n_correct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    /// [batch=1, classes=3, seq=2]
    fn two_position_pred(device: &Device) -> Tensor {
        Tensor::new(&[[[2.0f32, 0.5], [0.5, 1.0], [-1.0, 3.0]]], device).unwrap()
    }

    #[test]
    fn test_all_padding_gives_zero_loss() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let gold = Tensor::zeros((2, 4), DType::U32, &device)?;

        assert_eq!(scalar(&cal_loss(&pred, &gold, 0, false)?), 0.0);
        assert_eq!(scalar(&cal_loss(&pred, &gold, 0, true)?), 0.0);

        Ok(())
    }

    #[test]
    fn test_no_padding_matches_mean_cross_entropy() -> Result<()> {
        let device = Device::Cpu;
        let pred = two_position_pred(&device);
        let gold = Tensor::new(&[[1u32, 2]], &device)?;

        let loss = scalar(&cal_loss(&pred, &gold, 0, false)?);

        // candle's own (unmasked) mean cross-entropy on the same rows
        let rows = pred.transpose(1, 2)?.contiguous()?.reshape((2, 3))?;
        let expected = scalar(&candle_nn::loss::cross_entropy(&rows, &gold.flatten_all()?)?);

        assert!((loss - expected).abs() < 1e-6, "{} vs {}", loss, expected);

        Ok(())
    }

    #[test]
    fn test_padding_excluded_from_mean() -> Result<()> {
        let device = Device::Cpu;
        let pred = two_position_pred(&device);

        // Second position is padding: only position 0 (gold 1) counts
        let gold = Tensor::new(&[[1u32, 0]], &device)?;
        let loss = scalar(&cal_loss(&pred, &gold, 0, false)?);

        let logits = [2.0f32, 0.5, -1.0];
        let log_sum_exp = logits.iter().map(|x| x.exp()).sum::<f32>().ln();
        let expected = log_sum_exp - logits[1];

        assert!((loss - expected).abs() < 1e-5, "{} vs {}", loss, expected);

        Ok(())
    }

    #[test]
    fn test_smoothed_rows_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let gold = Tensor::new(&[0u32, 3, 9, 4], &device)?;

        let targets = smoothed_targets(&gold, 10, LABEL_SMOOTHING_EPS)?;
        let rows = targets.to_vec2::<f32>()?;

        for (row, gold_id) in rows.iter().zip([0usize, 3, 9, 4]) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {}", sum);
            assert!((row[gold_id] - 0.9).abs() < 1e-6);
        }

        Ok(())
    }

    #[test]
    fn test_smoothing_needs_two_classes() -> Result<()> {
        let device = Device::Cpu;
        let gold = Tensor::new(&[0u32], &device)?;

        assert!(matches!(
            smoothed_targets(&gold, 1, LABEL_SMOOTHING_EPS),
            Err(CaptionError::Loss(_))
        ));

        Ok(())
    }

    #[test]
    fn test_smoothed_loss_is_a_sum() -> Result<()> {
        let device = Device::Cpu;

        // Uniform scores: every class has log-prob ln(1/4)
        let pred = Tensor::zeros((1, 4, 3), DType::F32, &device)?;
        let gold = Tensor::new(&[[1u32, 2, 0]], &device)?;

        let loss = scalar(&cal_loss(&pred, &gold, 0, true)?);
        let expected = 2.0 * 4f32.ln();

        assert!((loss - expected).abs() < 1e-5, "{} vs {}", loss, expected);

        Ok(())
    }

    #[test]
    fn test_performance_counts_and_normalizes() -> Result<()> {
        let device = Device::Cpu;
        let pred = two_position_pred(&device);

        // Arg-max per position: class 0, then class 2
        let gold = Tensor::new(&[[1u32, 2]], &device)?;
        let perf = cal_performance(&pred, &gold, 0, true)?;

        assert_eq!(perf.n_word, 2);
        assert_eq!(perf.n_correct, 1);

        let summed = scalar(&perf.loss);
        let per_word = perf.loss_per_word_value()? as f32;
        assert!((summed / 2.0 - per_word).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::zeros((1, 4, 3), DType::F32, &device)?;
        let gold = Tensor::new(&[[1u32, 2]], &device)?;

        assert!(matches!(
            cal_loss(&pred, &gold, 0, false),
            Err(CaptionError::Loss(_))
        ));

        Ok(())
    }
}
