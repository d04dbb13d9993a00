use rand::Rng;

/// Sampling knobs threaded through from `GenerateOptions` (C9).
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    /// Nucleus sampling mass; `0.0` or `1.0` disables it.
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repeat_penalty: 1.0,
        }
    }
}

/// Sample a token from logits with temperature, top-k, top-p, and
/// repetition penalty. `temperature <= 0.0` short-circuits to greedy argmax
/// over the raw (pre-penalty) logits, matching the common "deterministic
/// decode" request.
pub fn sample_token(logits: &mut [f32], params: SamplingParams, recent_tokens: &[u32]) -> u32 {
    let vocab_size = logits.len();

    // Repetition penalty (llama.cpp style) applies regardless of temperature —
    // greedy decoding with repeat_penalty > 1 must still see the penalized
    // logits, not the raw ones.
    if params.repeat_penalty != 1.0 && !recent_tokens.is_empty() {
        for &token_id in recent_tokens {
            let idx = token_id as usize;
            if idx < vocab_size {
                if logits[idx] > 0.0 {
                    logits[idx] /= params.repeat_penalty;
                } else {
                    logits[idx] *= params.repeat_penalty;
                }
            }
        }
    }

    if params.temperature <= 0.0 {
        return argmax(logits);
    }

    let inv_temp = 1.0 / params.temperature;
    for logit in logits.iter_mut() {
        *logit *= inv_temp;
    }

    // Top-K via min-heap (O(V) instead of O(V log V) sort)
    if params.top_k > 0 && params.top_k < vocab_size {
        let mut heap: Vec<usize> = (0..params.top_k).collect();

        for i in (0..(params.top_k / 2)).rev() {
            sift_down(&mut heap, i, params.top_k, logits);
        }
        for i in params.top_k..vocab_size {
            if logits[i] > logits[heap[0]] {
                heap[0] = i;
                sift_down(&mut heap, 0, params.top_k, logits);
            }
        }

        let threshold = logits[heap[0]];
        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    // Softmax
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for logit in logits.iter_mut() {
        *logit = (*logit - max_val).exp();
        sum += *logit;
    }

    // Nucleus (top-p): keep the smallest prefix of descending-probability
    // tokens whose cumulative mass reaches `top_p`, zero everything else.
    if params.top_p > 0.0 && params.top_p < 1.0 && sum.is_finite() && sum > 0.0 {
        apply_top_p(logits, sum, params.top_p);
        sum = logits.iter().sum();
    }

    if !sum.is_finite() || sum <= 0.0 {
        // Every candidate got masked to zero probability (degenerate
        // top-k/top-p combination, or the whole row came back non-finite
        // from the kernel). Fall back to deterministic argmax over the
        // last finite signal we have rather than sampling from nothing.
        return argmax(logits);
    }

    let mut rng = rand::rng();
    let r = rng.random::<f32>() * sum;
    let mut cumsum = 0.0f32;
    for (i, &logit) in logits.iter().enumerate() {
        cumsum += logit;
        if cumsum >= r {
            return i as u32;
        }
    }

    (vocab_size - 1) as u32
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

fn apply_top_p(probs: &mut [f32], sum: f32, top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

    let target = top_p * sum;
    let mut cum = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, (_, p)) in indexed.iter().enumerate() {
        cum += p;
        if cum >= target {
            cutoff = i + 1;
            break;
        }
    }

    let mut keep = vec![false; probs.len()];
    for &(idx, _) in &indexed[..cutoff] {
        keep[idx] = true;
    }
    for (i, p) in probs.iter_mut().enumerate() {
        if !keep[i] {
            *p = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_is_deterministic_argmax() {
        let mut logits = vec![0.1, 5.0, -2.0, 3.0];
        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        assert_eq!(sample_token(&mut logits, params, &[]), 1);
    }

    #[test]
    fn top_k_one_always_picks_the_max() {
        let mut logits = vec![0.1, 5.0, -2.0, 3.0];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            repeat_penalty: 1.0,
        };
        for _ in 0..10 {
            let mut l = logits.clone();
            assert_eq!(sample_token(&mut l, params, &[]), 1);
        }
        let _ = &mut logits;
    }

    #[test]
    fn greedy_decode_still_applies_repetition_penalty() {
        let mut logits = vec![5.0, 4.9, -1.0];
        let params = SamplingParams {
            temperature: 0.0,
            repeat_penalty: 1.5,
            ..Default::default()
        };
        // Without the penalty token 0 wins; penalizing its recent repeat
        // should flip the greedy choice to token 1.
        assert_eq!(sample_token(&mut logits, params, &[0]), 1);
    }

    #[test]
    fn all_masked_falls_back_to_argmax() {
        let mut logits = vec![f32::NEG_INFINITY, f32::NEG_INFINITY, 2.0];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.0001,
            repeat_penalty: 1.0,
        };
        assert_eq!(sample_token(&mut logits, params, &[]), 2);
    }
}

fn sift_down(heap: &mut [usize], mut i: usize, n: usize, values: &[f32]) {
    loop {
        let mut min = i;
        let l = 2 * i + 1;
        let r = 2 * i + 2;
        if l < n && values[heap[l]] < values[heap[min]] {
            min = l;
        }
        if r < n && values[heap[r]] < values[heap[min]] {
            min = r;
        }
        if min == i {
            break;
        }
        heap.swap(i, min);
        i = min;
    }
}
