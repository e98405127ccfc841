use crate::result::BenchmarkResult;

/// Generate a markdown report from benchmark results
pub fn generate_report(results: &[BenchmarkResult]) -> String {
    let mut report = String::new();

    report.push_str("# Akashi Benchmark Results\n\n");
    report.push_str(&format!("Generated at: {}\n\n", chrono::Utc::now().to_rfc3339()));
    report.push_str(&format!("Total benchmarks: {}\n\n", results.len()));

    for result in results {
        report.push_str(&format!("## {}\n\n", result.target_id));
        report.push_str(&format!("Ran at: {}\n\n", result.timestamp.to_rfc3339()));
        report.push_str("```json\n");
        report.push_str(&serde_json::to_string_pretty(&result.metrics).unwrap_or_default());
        report.push_str("\n```\n\n");
    }

    report
}

/// Generate a compact summary from benchmark results
pub fn generate_summary(results: &[BenchmarkResult]) -> String {
    let mut summary = format!("Total Benchmarks: {}\n", results.len());
    for result in results {
        let throughput = result
            .metrics
            .get("throughput_ops_per_sec")
            .or_else(|| result.metrics.get("throughput_pairs_per_sec"))
            .and_then(|v| v.as_f64())
            .map(|v| format!("{:.0} ops/s", v))
            .unwrap_or_else(|| "-".to_string());
        summary.push_str(&format!("  {}: {}\n", result.target_id, throughput));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<BenchmarkResult> {
        vec![BenchmarkResult::new(
            "verdict_parsing".to_string(),
            serde_json::json!({"throughput_ops_per_sec": 1234.5}),
        )]
    }

    #[test]
    fn test_generate_report() {
        let report = generate_report(&sample());
        assert!(report.contains("# Akashi Benchmark Results"));
        assert!(report.contains("verdict_parsing"));
    }

    #[test]
    fn test_generate_summary() {
        let summary = generate_summary(&sample());
        assert!(summary.contains("Total Benchmarks: 1"));
        assert!(summary.contains("1234 ops/s") || summary.contains("1235 ops/s"));
    }
}
