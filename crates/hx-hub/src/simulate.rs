//! # Demo Data
//!
//! Synthetic analyses for local runs: `--demo-rows` at startup and
//! `POST /api/simulate`.

use chrono::{DateTime, Duration, Utc};
use hx_core::{AnalysisResult, AnalysisType, HallucinationFinding, RiskLevel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Upper bound for one simulate request.
pub const MAX_SIMULATED: usize = 10_000;
/// Widest window, in days, a request may span.
pub const MAX_DAYS: i64 = 3650;

const SECONDS_PER_DAY: i64 = 86_400;

const SNIPPETS: [&str; 6] = [
    "The Eiffel Tower was completed in 1889 for the World's Fair.",
    "Water boils at 100 degrees Celsius at sea level.",
    "The Great Wall of China is visible from the Moon with the naked eye.",
    "Quarterly revenue grew 14% year over year according to the filing.",
    "Einstein received the Nobel Prize for the theory of relativity.",
    "The patient should double the dose if symptoms persist.",
];

const CLAIMS: [(&str, &str); 3] = [
    ("factual", "Contradicted by every primary source consulted"),
    ("numerical", "Figure does not match the cited document"),
    ("attribution", "Quote cannot be traced to the named person"),
];

pub fn risk_for(accuracy: f64) -> RiskLevel {
    match accuracy {
        a if a >= 85.0 => RiskLevel::Low,
        a if a >= 65.0 => RiskLevel::Medium,
        a if a >= 40.0 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}

pub struct AnalysisGenerator {
    rng: StdRng,
}

impl AnalysisGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// `count` analyses for `user_id`, spread over the `days` days before `now`.
    /// `days` is clamped to `1..=MAX_DAYS`.
    pub fn generate(
        &mut self,
        user_id: &str,
        count: usize,
        days: i64,
        now: DateTime<Utc>,
    ) -> Vec<AnalysisResult> {
        let batch_id = format!("batch-{}", uuid::Uuid::new_v4().as_simple());
        let span_secs = days
            .clamp(1, MAX_DAYS)
            .checked_mul(SECONDS_PER_DAY)
            .unwrap_or(SECONDS_PER_DAY);
        (0..count.min(MAX_SIMULATED))
            .map(|i| self.one(user_id, &batch_id, i, span_secs, now))
            .collect()
    }

    fn one(
        &mut self,
        user_id: &str,
        batch_id: &str,
        index: usize,
        span_secs: i64,
        now: DateTime<Utc>,
    ) -> AnalysisResult {
        let accuracy = (self.rng.gen_range(20.0..100.0_f64) * 100.0).round() / 100.0;
        let snippet = SNIPPETS[self.rng.gen_range(0..SNIPPETS.len())];
        let age = Duration::seconds(self.rng.gen_range(0..span_secs));

        let findings = if accuracy < 85.0 {
            self.rng.gen_range(1..=3)
        } else {
            0
        };
        let hallucinations = (0..findings)
            .map(|_| {
                let (kind, explanation) = CLAIMS[self.rng.gen_range(0..CLAIMS.len())];
                HallucinationFinding {
                    text: snippet.to_string(),
                    kind: kind.to_string(),
                    confidence: (self.rng.gen_range(0.5..1.0_f64) * 100.0).round() / 100.0,
                    explanation: explanation.to_string(),
                }
            })
            .collect();

        let analysis_type = match self.rng.gen_range(0..10) {
            0..=5 => AnalysisType::Single,
            6..=8 => AnalysisType::Batch,
            _ => AnalysisType::Scheduled,
        };

        AnalysisResult {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            content: snippet.to_string(),
            full_content: Some(snippet.repeat(3)),
            timestamp: now.checked_sub_signed(age).unwrap_or(now),
            accuracy,
            risk_level: risk_for(accuracy),
            hallucinations,
            verification_sources: self.rng.gen_range(1..=8),
            processing_time_ms: self.rng.gen_range(150..4_000),
            analysis_type,
            batch_id: (analysis_type == AnalysisType::Batch).then(|| batch_id.to_string()),
            scan_id: (analysis_type == AnalysisType::Scheduled)
                .then(|| format!("scan-{:04}", index % 7)),
            filename: (analysis_type != AnalysisType::Single)
                .then(|| format!("document-{index:04}.txt")),
        }
    }
}
