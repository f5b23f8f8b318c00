//! Default vector adjuster.
//!
//! Moves clicked vectors toward the session's query vector and non-clicked
//! vectors away, under the collection's metric. The iteration follows the
//! gradient of cubed similarity, so the update minimizes a monotone function
//! of `mean(non_clicked_sim³) − mean(clicked_sim³)` over a fixed number of
//! steps with a fixed step size.

use quiver_core::config::ImprovementConfig;
use quiver_core::traits::VectorAdjuster;
use quiver_core::types::{ImprovementInput, MetricType};

/// Gradient of `similarity(v, q)` with respect to `v`.
fn similarity_gradient(metric: MetricType, v: &[f32], q: &[f32]) -> Vec<f32> {
    match metric {
        MetricType::Dot => q.to_vec(),
        MetricType::Cosine => {
            let norm_v = norm(v);
            let norm_q = norm(q);
            if norm_v == 0.0 || norm_q == 0.0 {
                return vec![0.0; v.len()];
            }
            let cos = dot(v, q) / (norm_v * norm_q);
            v.iter()
                .zip(q.iter())
                .map(|(vi, qi)| qi / (norm_v * norm_q) - cos * vi / (norm_v * norm_v))
                .collect()
        }
        MetricType::Euclid => {
            // similarity = -|v - q|
            let distance = v
                .iter()
                .zip(q.iter())
                .map(|(vi, qi)| (vi - qi) * (vi - qi))
                .sum::<f32>()
                .sqrt();
            if distance == 0.0 {
                return vec![0.0; v.len()];
            }
            v.iter()
                .zip(q.iter())
                .map(|(vi, qi)| (qi - vi) / distance)
                .collect()
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Iterative cubed-similarity adjuster.
pub struct IterativeAdjuster {
    steps: usize,
    step_size: f32,
}

impl IterativeAdjuster {
    pub fn new(steps: usize, step_size: f32) -> Self {
        Self { steps, step_size }
    }

    pub fn from_config(config: &ImprovementConfig) -> Self {
        Self::new(config.steps, config.step_size)
    }

    fn step(&self, metric: MetricType, vector: &mut [f32], query: &[f32], toward: bool) {
        let similarity = metric.similarity(vector, query);
        // d(sim³)/dv = 3·sim²·dsim/dv; the square keeps the direction of
        // ascent regardless of the similarity's sign.
        let scale = 3.0 * similarity * similarity * self.step_size;
        let gradient = similarity_gradient(metric, vector, query);
        let sign = if toward { 1.0 } else { -1.0 };
        for (value, grad) in vector.iter_mut().zip(gradient.iter()) {
            *value += sign * scale * grad;
        }
    }
}

impl VectorAdjuster for IterativeAdjuster {
    fn adjust(&self, mut inputs: Vec<ImprovementInput>, metric: MetricType) -> Vec<ImprovementInput> {
        for input in &mut inputs {
            let query = input.query_vector.clone();
            for _ in 0..self.steps {
                for element in &mut input.clicked {
                    for vector in &mut element.vectors {
                        self.step(metric, vector, &query, true);
                    }
                }
                for element in &mut input.non_clicked {
                    for vector in &mut element.vectors {
                        self.step(metric, vector, &query, false);
                    }
                }
            }
        }
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::types::ImprovementElement;

    fn input(clicked: Vec<f32>, non_clicked: Vec<f32>, query: Vec<f32>) -> ImprovementInput {
        ImprovementInput {
            session_id: "s1".into(),
            query_vector: query,
            clicked: vec![ImprovementElement {
                object_id: "p".into(),
                vectors: vec![clicked],
                is_average: vec![false],
                user_id: Some("u".into()),
            }],
            non_clicked: vec![ImprovementElement {
                object_id: "n".into(),
                vectors: vec![non_clicked],
                is_average: vec![false],
                user_id: Some("u".into()),
            }],
        }
    }

    fn run(metric: MetricType) -> (f32, f32, f32, f32) {
        let query = vec![1.0, 0.0, 0.0];
        let clicked = vec![0.6, 0.8, 0.0];
        let non_clicked = vec![0.5, -0.5, 0.7];

        let before_clicked = metric.similarity(&clicked, &query);
        let before_non = metric.similarity(&non_clicked, &query);

        let adjuster = IterativeAdjuster::new(10, 0.05);
        let adjusted = adjuster.adjust(
            vec![input(clicked, non_clicked, query.clone())],
            metric,
        );

        let after_clicked = metric.similarity(&adjusted[0].clicked[0].vectors[0], &query);
        let after_non = metric.similarity(&adjusted[0].non_clicked[0].vectors[0], &query);
        (before_clicked, after_clicked, before_non, after_non)
    }

    #[test]
    fn cosine_moves_toward_and_away() {
        let (before_clicked, after_clicked, before_non, after_non) = run(MetricType::Cosine);
        assert!(after_clicked > before_clicked);
        assert!(after_non < before_non);
    }

    #[test]
    fn dot_moves_toward_and_away() {
        let (before_clicked, after_clicked, before_non, after_non) = run(MetricType::Dot);
        assert!(after_clicked > before_clicked);
        assert!(after_non < before_non);
    }

    #[test]
    fn euclid_moves_toward_and_away() {
        let (before_clicked, after_clicked, before_non, after_non) = run(MetricType::Euclid);
        assert!(after_clicked > before_clicked);
        assert!(after_non < before_non);
    }

    #[test]
    fn objective_decreases() {
        let metric = MetricType::Cosine;
        let query = vec![1.0, 0.0, 0.0];
        let adjuster = IterativeAdjuster::new(10, 0.05);

        let objective = |clicked: &[f32], non: &[f32]| {
            metric.similarity(non, &query).powi(3) - metric.similarity(clicked, &query).powi(3)
        };

        let before = objective(&[0.6, 0.8, 0.0], &[0.5, -0.5, 0.7]);
        let adjusted = adjuster.adjust(
            vec![input(
                vec![0.6, 0.8, 0.0],
                vec![0.5, -0.5, 0.7],
                query.clone(),
            )],
            metric,
        );
        let after = objective(
            &adjusted[0].clicked[0].vectors[0],
            &adjusted[0].non_clicked[0].vectors[0],
        );
        assert!(after < before);
    }
}
