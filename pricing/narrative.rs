//! # Narrative Composition
//!
//! Turns a ranked `AttributionResult` into a short plain-language explanation.
//! `compose` is pure: the same attribution and charge always give byte-identical
//! text. It is also the fallback for any external `NarrativeService`, which is
//! used only when it is configured, succeeds, and produces output that names
//! enough of the top drivers.

use crate::attribution::{AttributionResult, FeatureContribution};
use crate::schema::{AGE, BMI, CHILDREN, REGION, SEX, SMOKER};
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BULLET_COUNT: usize = 5;
pub const TOP_FEATURE_COUNT: usize = 5;

const FILLER_BULLET: &str =
    "Smaller remaining features had limited impact compared with the top drivers.";
const CAVEATS: [&str; 2] = [
    "This explanation is for this prediction only.",
    "Contributions reflect model behavior, not causation.",
];
const GENERIC_TOKENS: [&str; 4] = [
    "predicted charge",
    "predicted charges",
    "base value",
    "estimate amount",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NarrativeError {
    #[error("No narrative service is configured.")]
    NotConfigured,
    #[error("Narrative service failed: {0}")]
    Service(String),
    #[error("Narrative service output was too generic; the deterministic explanation was used.")]
    LowSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increases,
    Decreases,
    Mixed,
}

impl Direction {
    fn of(contribution: f64) -> Self {
        if contribution > 0.0 {
            Direction::Increases
        } else if contribution < 0.0 {
            Direction::Decreases
        } else {
            Direction::Mixed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    High,
    Medium,
    Low,
}

impl Strength {
    fn for_rank(rank: usize) -> Self {
        match rank {
            0 => Strength::High,
            1 | 2 => Strength::Medium,
            _ => Strength::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopFeature {
    pub feature: String,
    pub direction: Direction,
    pub strength: Strength,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narrative {
    pub headline: String,
    pub bullets: Vec<String>,
    pub caveats: Vec<String>,
    pub top_features: Vec<TopFeature>,
}

/// Where the narrative attached to an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeSource {
    External,
    Fallback,
}

/// An external text generator. Implementations own their transport, timeouts
/// and retries; any error they return triggers the deterministic fallback.
pub trait NarrativeService: Send + Sync {
    fn narrate(
        &self,
        attribution: &AttributionResult,
        charges: f64,
    ) -> Result<Narrative, NarrativeError>;
}

/// Whole dollars with thousands separators, e.g. `$12,345`. The sign is dropped.
pub fn format_dollars(amount: f64) -> String {
    let digits = format!("{:.0}", amount.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    grouped.push('$');
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

fn ranked(attribution: &AttributionResult) -> Vec<&FeatureContribution> {
    let mut ranked: Vec<&FeatureContribution> = attribution.contributions.iter().collect();
    ranked.sort_by(|a, b| b.abs_contribution.total_cmp(&a.abs_contribution));
    ranked
}

/// Names of the strongest `TOP_FEATURE_COUNT` contributions.
pub fn top_feature_names(attribution: &AttributionResult) -> Vec<String> {
    ranked(attribution)
        .into_iter()
        .take(TOP_FEATURE_COUNT)
        .map(|c| c.feature.clone())
        .collect()
}

fn theme(feature: &str) -> &'static str {
    match feature {
        SMOKER | BMI => "lifestyle-driven",
        AGE => "age-driven",
        REGION => "region-driven",
        SEX => "demographic",
        CHILDREN => "household-driven",
        _ => "mixed",
    }
}

fn feature_bullet(item: &FeatureContribution) -> String {
    let delta = format_dollars(item.contribution);
    if item.contribution > 0.0 {
        format!(
            "{} ({}) increased the estimate by about {delta}.",
            item.feature, item.value
        )
    } else if item.contribution < 0.0 {
        format!(
            "{} ({}) decreased the estimate by about {delta}.",
            item.feature, item.value
        )
    } else {
        format!("{} ({}) had minimal effect on this estimate.", item.feature, item.value)
    }
}

/// Builds the deterministic explanation for one estimate.
pub fn compose(attribution: &AttributionResult, charges: f64) -> Narrative {
    let ranked = ranked(attribution);
    let gap = charges - attribution.baseline;
    let relation = if gap >= 0.0 { "above" } else { "below" };

    let drivers = ranked.iter().take(2).map(|c| c.feature.as_str()).join(", ");
    let drivers = if drivers.is_empty() {
        "the top features".to_string()
    } else {
        drivers
    };

    let headline = format!(
        "Estimate is {relation} baseline by {}, mainly driven by {drivers}.",
        format_dollars(gap)
    );

    let mut bullets: Vec<String> = ranked.iter().take(3).map(|c| feature_bullet(c)).collect();

    let remaining = &ranked[ranked.len().min(3)..];
    if !remaining.is_empty() {
        let net: f64 = remaining.iter().map(|c| c.contribution).sum();
        let direction = if net >= 0.0 { "upward" } else { "downward" };
        bullets.push(format!(
            "The remaining features combined for a net {direction} nudge of about {}.",
            format_dollars(net)
        ));
    }

    let dominant = ranked.first().map_or("mixed", |c| theme(&c.feature));
    bullets.push(format!(
        "Overall, this estimate sits {} {relation} the baseline average, primarily shaped by {drivers} ({dominant}).",
        format_dollars(gap)
    ));

    while bullets.len() < BULLET_COUNT {
        bullets.push(FILLER_BULLET.to_string());
    }
    bullets.truncate(BULLET_COUNT);

    let top_features = ranked
        .iter()
        .take(TOP_FEATURE_COUNT)
        .enumerate()
        .map(|(rank, c)| TopFeature {
            feature: c.feature.clone(),
            direction: Direction::of(c.contribution),
            strength: Strength::for_rank(rank),
        })
        .collect();

    Narrative {
        headline,
        bullets,
        caveats: CAVEATS.iter().map(|c| c.to_string()).collect(),
        top_features,
    }
}

/// Collapses internal whitespace, drops empty and case-insensitively repeated
/// bullets, and keeps at most `BULLET_COUNT`.
pub fn clean_bullets<S: AsRef<str>>(bullets: &[S]) -> Vec<String> {
    bullets
        .iter()
        .map(|b| b.as_ref().split_whitespace().join(" "))
        .filter(|b| !b.is_empty())
        .unique_by(|b| b.to_lowercase())
        .take(BULLET_COUNT)
        .collect()
}

/// Whether externally generated bullets are too generic to show.
///
/// Low-signal when there are fewer than two bullets, fewer than two bullets name
/// one of `top_features`, or every bullet is boilerplate naming no feature.
pub fn is_low_signal<S: AsRef<str>, F: AsRef<str>>(bullets: &[S], top_features: &[F]) -> bool {
    if bullets.len() < 2 {
        return true;
    }
    let features: Vec<String> = top_features
        .iter()
        .map(|f| f.as_ref().to_lowercase())
        .collect();

    let mut with_feature = 0;
    let mut generic_only = 0;
    for bullet in bullets {
        let lowered = bullet.as_ref().to_lowercase();
        if features.iter().any(|f| lowered.contains(f.as_str())) {
            with_feature += 1;
        } else if GENERIC_TOKENS.iter().any(|t| lowered.contains(t)) {
            generic_only += 1;
        }
    }

    with_feature < 2 || generic_only == bullets.len()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNarrative {
    pub narrative: Narrative,
    pub source: NarrativeSource,
    /// Why the external service was not used, when it was not.
    pub error: Option<NarrativeError>,
}

impl ResolvedNarrative {
    fn fallback(attribution: &AttributionResult, charges: f64, error: NarrativeError) -> Self {
        warn!("Narrative fallback applied: {error}");
        Self {
            narrative: compose(attribution, charges),
            source: NarrativeSource::Fallback,
            error: Some(error),
        }
    }
}

/// Uses `service` when it yields a usable narrative, otherwise `compose`.
pub fn resolve(
    service: Option<&dyn NarrativeService>,
    attribution: &AttributionResult,
    charges: f64,
) -> ResolvedNarrative {
    let Some(service) = service else {
        return ResolvedNarrative::fallback(attribution, charges, NarrativeError::NotConfigured);
    };

    let mut narrative = match service.narrate(attribution, charges) {
        Ok(narrative) => narrative,
        Err(error) => return ResolvedNarrative::fallback(attribution, charges, error),
    };
    narrative.bullets = clean_bullets(&narrative.bullets);

    if is_low_signal(&narrative.bullets, &top_feature_names(attribution)) {
        return ResolvedNarrative::fallback(attribution, charges, NarrativeError::LowSignal);
    }

    ResolvedNarrative {
        narrative,
        source: NarrativeSource::External,
        error: None,
    }
}
