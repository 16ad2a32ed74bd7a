//! Deterministic beam search over a next-token log-probability callback.
//!
//! The search knows nothing about models: the caller hands in a closure that
//! maps a full token sequence (prompt included) to log-probabilities over the
//! vocabulary for the next position.

#[derive(Debug, Clone, Copy)]
pub struct BeamSearch {
    pub width: usize,
    /// Maximum total sequence length, prompt included.
    pub max_length: usize,
    pub eos_token_id: u32,
    /// Exponent applied to the generated length when ranking hypotheses.
    pub length_penalty: f32,
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Generated tokens, without the prompt or the end-of-sequence token.
    pub tokens: Vec<u32>,
    pub score: f32,
}

impl BeamSearch {
    pub fn new(width: usize, max_length: usize, eos_token_id: u32) -> Self {
        Self {
            width,
            max_length,
            eos_token_id,
            length_penalty: 1.0,
        }
    }

    pub fn with_length_penalty(mut self, length_penalty: f32) -> Self {
        self.length_penalty = length_penalty;
        self
    }

    fn normalize(&self, sum_log_probs: f32, generated: usize) -> f32 {
        sum_log_probs / (generated.max(1) as f32).powf(self.length_penalty)
    }

    fn keep(&self, finished: &mut Vec<Hypothesis>, hypothesis: Hypothesis) {
        finished.push(hypothesis);
        finished.sort_by(|a, b| b.score.total_cmp(&a.score));
        finished.truncate(self.width.max(1));
    }

    /// Runs the search and returns the best hypothesis' tokens.
    pub fn run<F, E>(&self, prompt: &[u32], next_log_probs: F) -> Result<Vec<u32>, E>
    where
        F: FnMut(&[u32]) -> Result<Vec<f32>, E>,
    {
        let best = self.hypotheses(prompt, next_log_probs)?.into_iter().next();
        Ok(best.map(|h| h.tokens).unwrap_or_default())
    }

    /// Runs the search and returns up to `width` hypotheses, best first.
    pub fn hypotheses<F, E>(&self, prompt: &[u32], mut next_log_probs: F) -> Result<Vec<Hypothesis>, E>
    where
        F: FnMut(&[u32]) -> Result<Vec<f32>, E>,
    {
        let width = self.width.max(1);
        let mut beams = vec![Beam {
            tokens: prompt.to_vec(),
            score: 0.0,
        }];
        let mut finished: Vec<Hypothesis> = Vec::with_capacity(width + 1);

        // All live beams share one length, so checking the first is enough.
        while beams
            .first()
            .is_some_and(|beam| beam.tokens.len() < self.max_length)
        {
            let generated = beams[0].tokens.len() - prompt.len();

            let mut candidates: Vec<(usize, u32, f32)> = Vec::with_capacity(beams.len() * 2 * width);
            for (idx, beam) in beams.iter().enumerate() {
                let log_probs = next_log_probs(&beam.tokens)?;
                for (token, log_prob) in top_k(&log_probs, 2 * width) {
                    candidates.push((idx, token, beam.score + log_prob));
                }
            }
            // stable: ties keep beam order, then token order
            candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

            let mut next = Vec::with_capacity(width);
            for (rank, (idx, token, score)) in candidates.into_iter().enumerate() {
                if token == self.eos_token_id {
                    if rank < width {
                        let hypothesis = Hypothesis {
                            tokens: beams[idx].tokens[prompt.len()..].to_vec(),
                            score: self.normalize(score, generated),
                        };
                        self.keep(&mut finished, hypothesis);
                    }
                    continue;
                }

                let mut tokens = Vec::with_capacity(beams[idx].tokens.len() + 1);
                tokens.extend_from_slice(&beams[idx].tokens);
                tokens.push(token);
                next.push(Beam { tokens, score });
                if next.len() == width {
                    break;
                }
            }
            beams = next;

            if finished.len() >= width {
                let worst = finished
                    .iter()
                    .map(|h| h.score)
                    .fold(f32::INFINITY, f32::min);
                let best_live = beams
                    .first()
                    .map(|beam| self.normalize(beam.score, generated + 1));
                if !best_live.is_some_and(|score| score > worst) {
                    break;
                }
            }
        }

        for beam in beams {
            let generated = beam.tokens.len() - prompt.len();
            let hypothesis = Hypothesis {
                score: self.normalize(beam.score, generated),
                tokens: beam.tokens[prompt.len()..].to_vec(),
            };
            self.keep(&mut finished, hypothesis);
        }

        Ok(finished)
    }
}

/// The `k` highest entries of `log_probs` as `(token, log_prob)`, best first.
fn top_k(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .map(|(token, &log_prob)| (token as u32, log_prob))
        .collect();

    let by_score = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k, by_score);
        indexed.truncate(k);
    }
    indexed.sort_by(by_score);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 0;
    const A: u32 = 1;
    const B: u32 = 2;
    const PROMPT: u32 = 9;

    fn ln(probs: &[f32]) -> Vec<f32> {
        probs.iter().map(|p| p.ln()).collect()
    }

    /// Greedy prefers `A` first, but `B EOS` is the more likely sentence.
    fn trap(tokens: &[u32]) -> Result<Vec<f32>, String> {
        let probs = match tokens.last() {
            Some(&PROMPT) => [0.05, 0.55, 0.40],
            Some(&A) => [0.35, 0.33, 0.32],
            Some(&B) => [0.90, 0.05, 0.05],
            other => return Err(format!("unexpected token {other:?}")),
        };
        Ok(ln(&probs))
    }

    #[test]
    fn wider_beam_finds_more_likely_sequence() {
        let search = BeamSearch::new(2, 8, EOS).with_length_penalty(0.0);
        let tokens = search.run(&[PROMPT], trap).unwrap();
        assert_eq!(tokens, vec![B]);
    }

    #[test]
    fn width_one_is_greedy() {
        let search = BeamSearch::new(1, 8, EOS).with_length_penalty(0.0);
        let tokens = search.run(&[PROMPT], trap).unwrap();
        assert_eq!(tokens, vec![A]);
    }

    #[test]
    fn hypotheses_are_ranked_best_first() {
        let search = BeamSearch::new(2, 8, EOS).with_length_penalty(0.0);
        let hyps = search.hypotheses(&[PROMPT], trap).unwrap();
        assert_eq!(hyps.len(), 2);
        assert_eq!(hyps[0].tokens, vec![B]);
        assert_eq!(hyps[1].tokens, vec![A]);
        assert!(hyps[0].score > hyps[1].score);
        assert!((hyps[0].score - (0.40f32 * 0.90).ln()).abs() < 1e-5);
    }

    #[test]
    fn stops_at_max_length_without_eos() {
        let search = BeamSearch::new(3, 5, EOS);
        let tokens = search
            .run(&[1], |_| Ok::<_, String>(ln(&[0.01, 0.04, 0.05, 0.1, 0.2, 0.6])))
            .unwrap();
        assert_eq!(tokens, vec![5; 4]);
    }

    #[test]
    fn callback_sees_prompt_and_errors_propagate() {
        let search = BeamSearch::new(3, 10, EOS);
        let mut seen = Vec::new();
        let result = search.run(&[7, 8], |tokens| {
            seen.push(tokens.to_vec());
            Err::<Vec<f32>, _>("model failed")
        });
        assert_eq!(result, Err("model failed"));
        assert_eq!(seen, vec![vec![7, 8]]);
    }

    #[test]
    fn prompt_at_max_length_generates_nothing() {
        let search = BeamSearch::new(3, 2, EOS);
        let tokens = search
            .run(&[4, 4], |_| Ok::<_, String>(ln(&[0.5, 0.5])))
            .unwrap();
        assert!(tokens.is_empty());
    }

    #[test]
    fn repeated_runs_agree() {
        let search = BeamSearch::new(3, 12, EOS);
        let flat = |tokens: &[u32]| {
            let step = tokens.len() as f32;
            Ok::<_, String>(ln(&[0.1, 0.3 + step * 0.01, 0.3, 0.3 - step * 0.01]))
        };
        let first = search.run(&[PROMPT], flat).unwrap();
        let second = search.run(&[PROMPT], flat).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn top_k_orders_and_truncates() {
        let picked = top_k(&[0.1, 0.7, 0.2, 0.7, -1.0], 3);
        assert_eq!(picked, vec![(1, 0.7), (3, 0.7), (2, 0.2)]);
        assert_eq!(top_k(&[0.5], 4), vec![(0, 0.5)]);
    }
}
