use std::time::Instant;

use akashi_models::Decision;
use akashi_server::services::scorer::{GateOutcome, ScorerConfig};
use chrono::Utc;
use uuid::Uuid;

use crate::adapters::BenchTarget;
use crate::result::BenchmarkResult;

/// Benchmark adapter for the stage-1 candidate gate over synthetic decision
/// pairs with 1024-dimensional embeddings.
pub struct SignificanceGatingBench;

fn embedding(seed: u64) -> Vec<f32> {
    // Deterministic pseudo-embedding; no RNG dependency needed.
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..1024)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / u32::MAX as f32) - 0.5
        })
        .collect()
}

fn decision(agent: &str, topic_seed: u64, outcome_seed: u64) -> Decision {
    Decision {
        id: Uuid::new_v4(),
        run_id: Uuid::new_v4(),
        agent_id: agent.to_string(),
        org_id: Uuid::nil(),
        decision_type: "deployment".to_string(),
        outcome: format!("outcome-{}", outcome_seed),
        confidence: 0.85,
        reasoning: None,
        session_id: None,
        topic_embedding: Some(embedding(topic_seed)),
        outcome_embedding: Some(embedding(outcome_seed)),
        valid_from: Utc::now(),
    }
}

impl BenchTarget for SignificanceGatingBench {
    fn id(&self) -> String {
        "significance_gating".to_string()
    }

    fn run(&self) -> BenchmarkResult {
        let config = ScorerConfig::default();
        let pairs: Vec<(Decision, Decision)> = (0..64)
            .map(|i| {
                // Half the pairs share a topic seed and must clear the floor.
                let topic_b = if i % 2 == 0 { i } else { i + 1000 };
                (
                    decision("alice", i, i + 1),
                    decision("bob", topic_b, i + 2),
                )
            })
            .collect();

        let iterations = 200;
        let start = Instant::now();

        let mut evaluated = 0usize;
        for _ in 0..iterations {
            for (a, b) in &pairs {
                if matches!(config.gate(a, b, true), GateOutcome::Evaluate(_)) {
                    evaluated += 1;
                }
            }
        }

        let duration = start.elapsed();
        let comparisons = iterations * pairs.len();

        BenchmarkResult::new(
            self.id(),
            serde_json::json!({
                "comparisons": comparisons,
                "evaluated": evaluated,
                "total_duration_ms": duration.as_millis(),
                "throughput_pairs_per_sec": comparisons as f64 / duration.as_secs_f64(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significance_gating_bench() {
        let bench = SignificanceGatingBench;
        assert_eq!(bench.id(), "significance_gating");

        let result = bench.run();
        assert!(result.metrics.get("comparisons").is_some());
    }

    #[test]
    fn test_identical_topic_pairs_reach_the_llm() {
        let config = ScorerConfig::default();
        let a = decision("alice", 42, 1);
        let b = decision("bob", 42, 2);
        assert!(matches!(config.gate(&a, &b, true), GateOutcome::Evaluate(_)));
    }
}
