use std::time::Instant;

use akashi_server::services::validator::parse_validator_response;

use crate::adapters::BenchTarget;
use crate::result::BenchmarkResult;

/// Benchmark adapter for the LLM verdict parser, across the normalization
/// forms it has to absorb (markdown bold, brackets, truncations, legacy
/// VERDICT lines).
pub struct VerdictParsingBench;

const SAMPLES: &[&str] = &[
    "RELATIONSHIP: contradiction\nCATEGORY: factual\nSEVERITY: high\nEXPLANATION: Outcomes are mutually exclusive.",
    "**RELATIONSHIP**: **[supersession]**\nCATEGORY: [temporal]\nSEVERITY: [medium]\nEXPLANATION: B replaces A.",
    "relationship :  REFINE \nseverity: LOW",
    "VERDICT: yes\nEXPLANATION: direct disagreement",
    "RELATIONSHIP: unrelated\nCATEGORY: vibes\nSEVERITY: extreme",
];

impl BenchTarget for VerdictParsingBench {
    fn id(&self) -> String {
        "verdict_parsing".to_string()
    }

    fn run(&self) -> BenchmarkResult {
        let iterations = 10_000;
        let start = Instant::now();

        let mut parsed = 0usize;
        for i in 0..iterations {
            let sample = SAMPLES[i % SAMPLES.len()];
            if parse_validator_response(sample).is_ok() {
                parsed += 1;
            }
        }

        let duration = start.elapsed();

        BenchmarkResult::new(
            self.id(),
            serde_json::json!({
                "iterations": iterations,
                "parsed_ok": parsed,
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
    fn test_verdict_parsing_bench() {
        let bench = VerdictParsingBench;
        assert_eq!(bench.id(), "verdict_parsing");

        let result = bench.run();
        assert_eq!(result.target_id, "verdict_parsing");
        // Every sample line set carries a usable relationship.
        assert_eq!(result.metrics["parsed_ok"], 10_000);
    }
}
