use std::collections::BTreeMap;

/// number of posterior entries kept per candidate key.
const POSTERIOR_HISTORY: usize = 10;

/// convergence thresholds on the best candidate's posterior trace.
const CONVERGENCE_PROBABILITY: f64 = 0.98;
const STABILITY_PROBABILITY: f64 = 0.50;
const STABILITY_TOLERANCE: f64 = 0.02;

/// Numerically stable softmax.
pub fn softmax(scores: &[f64]) -> Vec<f64> {
    let max_score = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp_scores: Vec<f64> = scores.iter().map(|s| (s - max_score).exp()).collect();
    let sum_exp: f64 = exp_scores.iter().sum();

    exp_scores.iter().map(|e| e / sum_exp).collect()
}

/// One round of the Bayesian update over the candidate scores.
///
/// `prior` carries one posterior vector per candidate from the previous
/// rounds, `likelihood` the raw match scores of this round. Candidates that
/// vanished from the likelihood are dropped, new candidates start a fresh
/// vector. Returns whether the best candidate has converged, together with
/// the updated posterior vectors.
pub fn bayesian_update(
    prior: &BTreeMap<String, Vec<f64>>,
    likelihood: &BTreeMap<String, f64>,
    alpha: f64,
) -> (bool, BTreeMap<String, Vec<f64>>) {
    if likelihood.is_empty() {
        return (false, BTreeMap::new());
    }

    // normalize the likelihood; the BTreeMap iterates key-sorted, which keeps
    // the pairing with the priors deterministic
    let keys: Vec<&String> = likelihood.keys().collect();
    let normalized = softmax(&likelihood.values().cloned().collect::<Vec<f64>>());

    // keep only priors still present in the likelihood; a new key starts a
    // singleton prior vector holding its current likelihood value
    let mut posteriors: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut unnormalized: Vec<f64> = Vec::with_capacity(keys.len());

    for (key, likelihood_value) in keys.iter().zip(normalized.iter()) {
        match prior.get(*key) {
            Some(vector) if !vector.is_empty() => {
                let last_posterior = *vector.last().unwrap();
                posteriors.insert((*key).clone(), vector.clone());
                unnormalized.push(last_posterior * likelihood_value.powf(alpha));
            }
            _ => {
                posteriors.insert((*key).clone(), vec![*likelihood_value]);
                unnormalized.push(*likelihood_value * likelihood_value.powf(alpha));
            }
        }
    }

    let total: f64 = unnormalized.iter().sum();

    for (vector, value) in posteriors.values_mut().zip(unnormalized.iter()) {
        let posterior = if total == 0.0 { 0.0 } else { value / total };
        vector.push(posterior);
        if vector.len() > POSTERIOR_HISTORY {
            vector.drain(..vector.len() - POSTERIOR_HISTORY);
        }
    }

    (is_converged(&posteriors), posteriors)
}

/// The best candidate counts as converged once its posterior is either
/// practically certain, or has settled above 0.5 for three rounds.
fn is_converged(posteriors: &BTreeMap<String, Vec<f64>>) -> bool {
    let best = posteriors
        .values()
        .filter(|vector| !vector.is_empty())
        .max_by(|a, b| {
            a.last()
                .unwrap()
                .partial_cmp(b.last().unwrap())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    let best = match best {
        Some(vector) => vector,
        None => return false,
    };

    let last = *best.last().unwrap();
    if last > CONVERGENCE_PROBABILITY {
        return true;
    }

    if last > STABILITY_PROBABILITY && best.len() >= 3 {
        let tail = &best[best.len() - 3..];
        let stable = tail
            .iter()
            .flat_map(|a| tail.iter().map(move |b| (a - b).abs()))
            .all(|difference| difference < STABILITY_TOLERANCE);
        if stable {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn likelihood(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn softmax_is_normalized_and_stable() {
        let result = softmax(&[1000.0, 1001.0, 1002.0]);
        let total: f64 = result.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(result[0] < result[1] && result[1] < result[2]);
    }

    #[test]
    fn posteriors_sum_to_one() {
        let prior = BTreeMap::new();
        let (_, posteriors) =
            bayesian_update(&prior, &likelihood(&[("a", 0.3), ("b", 0.5), ("c", 0.9)]), 1.0);

        let total: f64 = posteriors.values().map(|v| v.last().unwrap()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn update_is_deterministic() {
        let prior: BTreeMap<String, Vec<f64>> = [
            ("a".to_string(), vec![0.5]),
            ("b".to_string(), vec![0.5]),
        ]
        .into();
        let scores = likelihood(&[("a", 0.8), ("b", 0.2)]);

        let first = bayesian_update(&prior, &scores, 1.0);
        let second = bayesian_update(&prior, &scores, 1.0);
        assert_eq!(first, second);
    }

    #[test]
    fn dominant_candidate_converges_over_rounds() {
        let scores = likelihood(&[("a", 0.95), ("b", 0.05)]);
        let mut prior = BTreeMap::new();
        let mut converged = false;

        for _ in 0..20 {
            let result = bayesian_update(&prior, &scores, 1.0);
            converged = result.0;
            prior = result.1;
            if converged {
                break;
            }
        }

        assert!(converged);
        let best = prior.get("a").unwrap().last().unwrap();
        assert!(*best > 0.5);
    }

    #[test]
    fn vanished_candidates_are_dropped_and_new_ones_seeded() {
        let prior: BTreeMap<String, Vec<f64>> = [
            ("a".to_string(), vec![0.7]),
            ("b".to_string(), vec![0.3]),
        ]
        .into();

        let (_, posteriors) = bayesian_update(&prior, &likelihood(&[("a", 0.8), ("c", 0.4)]), 1.0);

        assert!(posteriors.contains_key("a"));
        assert!(posteriors.contains_key("c"));
        assert!(!posteriors.contains_key("b"));

        // the new key carries its likelihood seed plus this round's posterior
        let fresh = posteriors.get("c").unwrap();
        assert_eq!(fresh.len(), 2);
        assert!(fresh[0] > 0.0);
    }

    #[test]
    fn zero_likelihood_total_yields_zero_posteriors() {
        let prior: BTreeMap<String, Vec<f64>> = [("a".to_string(), vec![0.0])].into();
        let (converged, posteriors) = bayesian_update(&prior, &likelihood(&[("a", 0.5)]), 1.0);

        assert!(!converged);
        assert_eq!(posteriors.get("a").unwrap().last(), Some(&0.0));
    }

    #[test]
    fn stable_majority_converges_without_certainty() {
        // two candidates with steady scores: the better one levels off above
        // 0.5 but below 0.98 and must converge through the stability rule
        let scores = likelihood(&[("a", 0.60), ("b", 0.40)]);
        let mut prior: BTreeMap<String, Vec<f64>> = [
            ("a".to_string(), vec![0.55, 0.552, 0.553]),
            ("b".to_string(), vec![0.45, 0.448, 0.447]),
        ]
        .into();

        let (converged, posteriors) = bayesian_update(&prior, &scores, 0.0);
        prior = posteriors;
        assert!(converged, "posterior trace: {:?}", prior);
    }

    #[test]
    fn history_is_capped() {
        let scores = likelihood(&[("a", 0.9), ("b", 0.1)]);
        let mut prior = BTreeMap::new();
        for _ in 0..30 {
            prior = bayesian_update(&prior, &scores, 1.0).1;
        }
        assert!(prior.values().all(|v| v.len() <= POSTERIOR_HISTORY));
    }
}
