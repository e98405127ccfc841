use serde::{Deserialize, Serialize};

/// Result of one benchmark run: the target's id, whatever metrics it chose
/// to report, and when it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub target_id: String,

    /// Free-form metrics object; adapters decide the keys.
    pub metrics: serde_json::Value,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BenchmarkResult {
    pub fn new(target_id: String, metrics: serde_json::Value) -> Self {
        Self {
            target_id,
            metrics,
            timestamp: chrono::Utc::now(),
        }
    }
}
