//! # Stage: Insights Aggregator
//!
//! ## Responsibility
//! Turn already-fetched patterns, issue trends and fix success rates into a
//! per-type confidence table and a list of advisory recommendations.
//!
//! ## Guarantees
//! - Pure: no I/O, no clock, deterministic output order
//! - Recommendations are emitted in a fixed order: pattern confidence,
//!   trending issues, then fix strategies
//!
//! ## NOT Responsible For
//! - Fetching data (see `PatternStore::get_comprehensive_insights`)
//! - Making thresholds configurable; they are fixed heuristics

use std::collections::BTreeMap;

use crate::models::{FixSuccessRate, InsightsSummary, IssueTrends, TeamPattern, TypeConfidence};

/// A pattern at or above this confidence counts as high-confidence.
pub const HIGH_CONFIDENCE: f64 = 0.8;

/// Pattern types averaging below this get a review recommendation.
pub const REVIEW_BELOW_AVERAGE: f64 = 0.6;

/// Share of high-confidence patterns above which enforcement is suggested.
pub const ENFORCE_ABOVE_SHARE: f64 = 0.8;

/// Fix types succeeding less often than this get a review recommendation.
pub const FIX_SUCCESS_FLOOR: f64 = 0.7;

/// Trending issues carried into the summary.
pub const TOP_TRENDING: usize = 3;

/// Average and high-confidence count per pattern type, ordered by type.
pub fn confidence_by_type(patterns: &[TeamPattern]) -> Vec<TypeConfidence> {
    let mut groups: BTreeMap<&str, (u64, f64, u64)> = BTreeMap::new();
    for p in patterns {
        let entry = groups.entry(p.pattern_type.as_str()).or_insert((0, 0.0, 0));
        entry.0 += 1;
        entry.1 += p.confidence;
        if p.confidence >= HIGH_CONFIDENCE {
            entry.2 += 1;
        }
    }
    groups
        .into_iter()
        .map(|(pattern_type, (count, sum, high))| TypeConfidence {
            pattern_type: pattern_type.to_string(),
            count,
            average_confidence: sum / count as f64,
            high_confidence_count: high,
        })
        .collect()
}

pub fn summarize(
    patterns: &[TeamPattern],
    trends: &IssueTrends,
    fix_rates: &[FixSuccessRate],
) -> InsightsSummary {
    let confidence = confidence_by_type(patterns);
    let mut recommendations = Vec::new();

    for t in &confidence {
        if t.average_confidence < REVIEW_BELOW_AVERAGE {
            recommendations.push(format!(
                "Review {} patterns: average confidence {:.2} is low",
                t.pattern_type, t.average_confidence
            ));
        } else if t.high_confidence_count as f64 / t.count as f64 > ENFORCE_ABOVE_SHARE {
            recommendations.push(format!(
                "Enforce {} patterns more strictly: {} of {} are high-confidence",
                t.pattern_type, t.high_confidence_count, t.count
            ));
        }
    }

    let top_trending: Vec<_> = trends.top_issues.iter().take(TOP_TRENDING).cloned().collect();
    if let Some(top) = top_trending.first() {
        recommendations.push(format!(
            "Focus on {} issues: the top trending rule has occurred {} times",
            top.issue_type, top.frequency
        ));
    }

    for rate in fix_rates {
        if rate.success_rate < FIX_SUCCESS_FLOOR {
            recommendations.push(format!(
                "Review {} fix strategy: success rate {:.0}%",
                rate.fix_type,
                rate.success_rate * 100.0
            ));
        }
    }

    InsightsSummary {
        confidence_by_type: confidence,
        top_trending,
        recommendations,
    }
}
