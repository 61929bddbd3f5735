//! # Request Cycle
//!
//! `PricingEngine` runs one estimate end to end against a shared, read-only
//! `TransformState`:
//!
//! 1. report extrapolation against the fitted ranges,
//! 2. transform, predict and map back to dollars,
//! 3. attribute (exact hook when the predictor declares one, sampling otherwise),
//!    bring the result into dollars and fold it onto raw features,
//! 4. narrate through the configured service or the deterministic composer.
//!
//! Steps 1 and 2 are fatal to the request. Steps 3 and 4 never are: their
//! failures are reported in the `Estimate` error fields next to the charge.

use crate::attribution::sampling::SamplingAttributor;
use crate::attribution::{AttributionError, AttributionResult, ContributionValues, aggregate};
use crate::extrapolation::{ExtrapolationWarning, check_extrapolation};
use crate::narrative::{self, Narrative, NarrativeService, NarrativeSource};
use crate::predictor::{Predictor, PredictorError, RawAttribution};
use crate::schema::RawInput;
use crate::settings::{DEFAULT_EXPLAIN_TOP_K, Settings};
use crate::transform::{FeatureMatrix, TransformError, TransformState};
use log::{debug, warn};
use ndarray::Array1;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Model-space attribution totals below this are not rescaled into dollars.
const MIN_RESCALE_TOTAL: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to transform the request: {0}")]
    Transform(#[from] TransformError),
    #[error("Prediction failed: {0}")]
    Predictor(#[from] PredictorError),
    #[error("Predictor returned {0} values for a single request row.")]
    PredictionShape(usize),
}

/// Everything the caller serializes for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub charges: f64,
    pub model_version: Option<String>,
    pub extrapolation_warnings: Vec<ExtrapolationWarning>,
    pub attribution: Option<AttributionResult>,
    pub narrative: Option<Narrative>,
    pub narrative_source: Option<NarrativeSource>,
    pub explainability_error: Option<String>,
    pub narrative_error: Option<String>,
}

pub struct PricingEngine {
    state: Arc<TransformState>,
    predictor: Arc<dyn Predictor>,
    narrator: Option<Arc<dyn NarrativeService>>,
    sampler: SamplingAttributor,
    top_k: usize,
}

impl PricingEngine {
    pub fn new(state: Arc<TransformState>, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            state,
            predictor,
            narrator: None,
            sampler: SamplingAttributor::default(),
            top_k: DEFAULT_EXPLAIN_TOP_K,
        }
    }

    /// Engine configured from `settings` (top-K and sampling parameters).
    pub fn from_settings(
        state: Arc<TransformState>,
        predictor: Arc<dyn Predictor>,
        settings: &Settings,
    ) -> Self {
        Self::new(state, predictor)
            .with_top_k(settings.explain_top_k)
            .with_sampler(SamplingAttributor::new(
                settings.attribution_samples,
                settings.attribution_seed,
            ))
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn NarrativeService>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn with_sampler(mut self, sampler: SamplingAttributor) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn estimate(&self, input: &RawInput) -> Result<Estimate, PipelineError> {
        let extrapolation_warnings = check_extrapolation(input, &self.state);
        for warning in &extrapolation_warnings {
            debug!("Extrapolation: {warning}");
        }

        let features = self.state.transform_input(input)?;
        let raw = self.predictor.predict(features.values.view())?;
        if raw.len() != 1 {
            return Err(PipelineError::PredictionShape(raw.len()));
        }
        let charges = self.state.inverse_transform_target(raw.view())[0];

        let mut estimate = Estimate {
            charges,
            model_version: self.predictor.version().map(str::to_string),
            extrapolation_warnings,
            attribution: None,
            narrative: None,
            narrative_source: None,
            explainability_error: None,
            narrative_error: None,
        };

        match self.explain(input, &features, charges) {
            Ok(attribution) => {
                let narrator = self.narrator.as_deref();
                let resolved = narrative::resolve(narrator, &attribution, charges);
                estimate.narrative = Some(resolved.narrative);
                estimate.narrative_source = Some(resolved.source);
                estimate.narrative_error = resolved.error.map(|e| e.to_string());
                estimate.attribution = Some(attribution);
            }
            Err(error) => {
                warn!("Attribution failed; returning the estimate without an explanation: {error}");
                estimate.explainability_error = Some(error.to_string());
            }
        }

        Ok(estimate)
    }

    /// Independent estimates for many rows, computed in parallel. Results keep
    /// the input order.
    pub fn estimate_batch(&self, inputs: &[RawInput]) -> Vec<Result<Estimate, PipelineError>> {
        inputs.par_iter().map(|input| self.estimate(input)).collect()
    }

    fn explain(
        &self,
        input: &RawInput,
        features: &FeatureMatrix,
        charges: f64,
    ) -> Result<AttributionResult, AttributionError> {
        let exact = self.predictor.exact_attribution().and_then(|hook| {
            hook.attribute(features.values.view())
                .map_err(|e| debug!("Exact attribution failed, sampling instead: {e}"))
                .ok()
        });
        let raw = match exact {
            Some(raw) => match self.exact_in_dollars(raw, features.columns.len(), charges)? {
                Some(dollars) => dollars,
                None => self.sample(input)?,
            },
            None => self.sample(input)?,
        };
        aggregate(
            input,
            &features.columns,
            &raw.values,
            raw.baseline,
            self.top_k,
        )
    }

    fn sample(&self, input: &RawInput) -> Result<RawAttribution, AttributionError> {
        self.sampler
            .attribute(&self.state, self.predictor.as_ref(), input)
    }

    /// Exact hooks report in model-output units. The baseline is mapped through
    /// the inverse target transform and the contributions are rescaled to span
    /// `charges - baseline`, which keeps their ranking and signs. Returns `None`
    /// when the model-space total is too small to rescale.
    fn exact_in_dollars(
        &self,
        raw: RawAttribution,
        width: usize,
        charges: f64,
    ) -> Result<Option<RawAttribution>, AttributionError> {
        let row = raw.values.first_row(width)?;
        let total = row.sum();
        let baseline = self
            .state
            .inverse_transform_target(Array1::from_elem(1, raw.baseline).view())[0];
        if !baseline.is_finite() || total.abs() < MIN_RESCALE_TOTAL {
            debug!("Exact attribution total {total} is not rescalable to dollars, sampling instead");
            return Ok(None);
        }
        let ratio = (charges - baseline) / total;
        Ok(Some(RawAttribution {
            values: ContributionValues::Vector(row * ratio),
            baseline,
        }))
    }
}
