use std::time::Instant;

use akashi_server::services::idempotency::payload_hash;

use crate::adapters::BenchTarget;
use crate::result::BenchmarkResult;

/// Benchmark adapter for canonical payload hashing on the idempotency path.
pub struct PayloadHashingBench;

fn sample_payload(i: usize) -> serde_json::Value {
    serde_json::json!({
        "agent_id": format!("agent-{}", i % 16),
        "decision": {
            "decision_type": "security",
            "outcome": format!("rotate key {}", i),
            "confidence": 0.9,
            "alternatives": [
                {"outcome": "defer", "score": 0.3, "selected": false},
                {"outcome": "rotate", "score": 0.9, "selected": true},
            ],
        },
    })
}

impl BenchTarget for PayloadHashingBench {
    fn id(&self) -> String {
        "payload_hashing".to_string()
    }

    fn run(&self) -> BenchmarkResult {
        let iterations = 5_000;
        let start = Instant::now();

        let mut distinct_prefix = std::collections::HashSet::new();
        for i in 0..iterations {
            let hash = payload_hash(&sample_payload(i));
            distinct_prefix.insert(hash.as_bytes()[0]);
        }

        let duration = start.elapsed();

        BenchmarkResult::new(
            self.id(),
            serde_json::json!({
                "iterations": iterations,
                "distinct_first_bytes": distinct_prefix.len(),
                "total_duration_ms": duration.as_millis(),
                "throughput_ops_per_sec": iterations as f64 / duration.as_secs_f64(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hashing_bench() {
        let bench = PayloadHashingBench;
        assert_eq!(bench.id(), "payload_hashing");

        let result = bench.run();
        assert!(result.metrics.get("throughput_ops_per_sec").is_some());
    }

    #[test]
    fn test_hash_is_stable_across_runs() {
        let first = payload_hash(&sample_payload(7));
        let second = payload_hash(&sample_payload(7));
        assert_eq!(first, second);
    }
}
