//! # Multi-Shot Pipeline
//!
//! Turns an [`IntentRequest`] — an ordered sequence of shots with creative
//! intent — into routed generations, one variant per target provider per
//! shot, with optional cross-shot consistency validation.
//!
//! The pipeline owns orchestration only. Computer-vision analysis, prompt
//! compilation and identity-embedding extraction are injected collaborators
//! behind small traits; the pipeline never looks inside their outputs
//! beyond what routing needs.
//!
//! Per shot: analyze the source image, compile a provider-specific prompt,
//! assemble a [`UnifiedRequest`] (caller-locked controls win over derived
//! controls, which win over compiler defaults), and route it. Shots run in
//! parallel up to the request's concurrency degree; results come back in
//! shot order. Cancelling the outer request cancels every pending shot.
//!
//! When a consistency policy is present, identity embeddings of adjacent
//! successful shots are compared pairwise. A pair scoring below the
//! threshold marks both shots `partial_success` and records the offending
//! pair; if the policy allows regeneration, the later shot of the pair is
//! regenerated once with a consistency hint appended to its intent.

use crate::error::{ErrorCode, ErrorDetails, RouterError};
use crate::models::{
    ConsistencyPolicy, IntentRequest, ResponseStatus, Shot, UnifiedRequest, UnifiedResponse,
};
use crate::router::GenerationRouter;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Features produced by the external image analyzer. Opaque to the
/// pipeline; the prompt compiler is the only consumer.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFeatures {
    pub features: Map<String, Value>,
}

/// Output of the external prompt compiler for one (shot, provider) pair.
#[derive(Debug, Clone)]
pub struct CompiledPrompt {
    pub text: String,
    /// Provider-qualified model chosen by the compiler.
    pub model: String,
    /// Compiler-suggested generation controls; lowest merge precedence.
    pub controls: Map<String, Value>,
}

/// External scene/movement analysis, `image → features`.
#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, image_ref: &str) -> Result<AnalysisFeatures, ErrorDetails>;
}

/// External prompt compilation, `(intent, features, provider) → prompt`.
#[async_trait::async_trait]
pub trait PromptCompiler: Send + Sync {
    async fn compile(
        &self,
        intent: &str,
        features: &AnalysisFeatures,
        provider: &str,
    ) -> Result<CompiledPrompt, ErrorDetails>;
}

/// External identity/style embedding, `frame → float vector`.
#[async_trait::async_trait]
pub trait ConsistencyExtractor: Send + Sync {
    async fn embed(&self, frame_ref: &str) -> Result<Vec<f32>, ErrorDetails>;
}

/// All variants generated for one shot, in target-provider order.
#[derive(Debug, Clone)]
pub struct ShotOutcome {
    pub shot_id: String,
    pub scene_id: String,
    pub variants: Vec<UnifiedResponse>,
}

impl ShotOutcome {
    /// First usable variant, preferring full successes.
    pub fn primary(&self) -> Option<&UnifiedResponse> {
        self.variants
            .iter()
            .find(|v| v.status == ResponseStatus::Success)
            .or_else(|| {
                self.variants
                    .iter()
                    .find(|v| v.status == ResponseStatus::PartialSuccess)
            })
    }

    fn primary_mut(&mut self) -> Option<&mut UnifiedResponse> {
        let index = self
            .variants
            .iter()
            .position(|v| v.status == ResponseStatus::Success)
            .or_else(|| {
                self.variants
                    .iter()
                    .position(|v| v.status == ResponseStatus::PartialSuccess)
            })?;
        self.variants.get_mut(index)
    }
}

/// Pairwise consistency score between two adjacent shots.
#[derive(Debug, Clone)]
pub struct PairScore {
    pub first_shot: String,
    pub second_shot: String,
    pub score: f32,
}

/// Aggregated pipeline result, in shot order.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub shots: Vec<ShotOutcome>,
    /// Present when a consistency policy was evaluated.
    pub consistency: Option<Vec<PairScore>>,
}

impl PipelineResponse {
    pub fn all_succeeded(&self) -> bool {
        self.shots.iter().all(|s| {
            s.variants
                .iter()
                .any(|v| v.status == ResponseStatus::Success)
        })
    }
}

/// Orchestrates analysis, compilation, routing and consistency validation.
pub struct ShotPipeline {
    router: Arc<GenerationRouter>,
    analyzer: Arc<dyn Analyzer>,
    compiler: Arc<dyn PromptCompiler>,
    extractor: Option<Arc<dyn ConsistencyExtractor>>,
}

impl ShotPipeline {
    pub fn new(
        router: Arc<GenerationRouter>,
        analyzer: Arc<dyn Analyzer>,
        compiler: Arc<dyn PromptCompiler>,
    ) -> Self {
        Self {
            router,
            analyzer,
            compiler,
            extractor: None,
        }
    }

    /// Enable cross-shot consistency validation.
    pub fn with_extractor(mut self, extractor: Arc<dyn ConsistencyExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub async fn run(&self, intent: IntentRequest) -> Result<PipelineResponse, RouterError> {
        self.run_with_cancellation(intent, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancellation(
        &self,
        intent: IntentRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, RouterError> {
        let concurrency = intent.concurrency.max(1);
        let timeout_ms = intent.timeout_ms;
        let scope = cancel.child_token();

        // `buffered` preserves shot order while letting up to `concurrency`
        // shots generate at once.
        let mut shots = stream::iter(intent.shots.iter().map(|shot| {
            let scope = scope.clone();
            async move { self.run_shot(shot, timeout_ms, &scope).await }
        }))
        .buffered(concurrency)
        .collect::<Vec<ShotOutcome>>()
        .await;

        let consistency = match &intent.consistency {
            Some(policy) if self.extractor.is_some() => Some(
                self.validate_consistency(&mut shots, &intent.shots, policy, timeout_ms, &scope)
                    .await,
            ),
            Some(_) => {
                tracing::warn!("consistency policy set but no extractor configured, skipping");
                None
            }
            None => None,
        };

        Ok(PipelineResponse {
            shots,
            consistency,
        })
    }

    /// One variant per target provider, in declared order.
    async fn run_shot(
        &self,
        shot: &Shot,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> ShotOutcome {
        let features = match self.analyzer.analyze(&shot.image_ref).await {
            Ok(features) => features,
            Err(error) => {
                tracing::warn!(shot = %shot.shot_id, error = %error.message, "image analysis failed");
                return ShotOutcome {
                    shot_id: shot.shot_id.clone(),
                    scene_id: shot.scene_id.clone(),
                    variants: shot
                        .target_providers
                        .iter()
                        .map(|p| shot_failure(shot, p, error.clone()))
                        .collect(),
                };
            }
        };

        let mut variants = Vec::with_capacity(shot.target_providers.len());
        for provider in &shot.target_providers {
            if cancel.is_cancelled() {
                variants.push(shot_failure(
                    shot,
                    provider,
                    ErrorDetails::new(ErrorCode::Timeout, "request cancelled before completion"),
                ));
                continue;
            }
            let request = match self.assemble(shot, &features, provider, timeout_ms).await {
                Ok(request) => request,
                Err(error) => {
                    variants.push(shot_failure(shot, provider, error));
                    continue;
                }
            };
            match self
                .router
                .execute_with_cancellation(request, cancel.child_token())
                .await
            {
                Ok(response) => variants.push(response),
                Err(error) => variants.push(shot_failure(
                    shot,
                    provider,
                    ErrorDetails::new(ErrorCode::InvalidRequest, error.to_string()),
                )),
            }
        }

        ShotOutcome {
            shot_id: shot.shot_id.clone(),
            scene_id: shot.scene_id.clone(),
            variants,
        }
    }

    /// Compile and merge one routed request for `(shot, provider)`.
    async fn assemble(
        &self,
        shot: &Shot,
        features: &AnalysisFeatures,
        provider: &str,
        timeout_ms: u64,
    ) -> Result<UnifiedRequest, ErrorDetails> {
        let compiled = self
            .compiler
            .compile(&shot.intent_text, features, provider)
            .await?;

        let mut parameters = merge_controls(
            &compiled.controls,
            &shot.derived_controls,
            &shot.locked_controls,
        );
        parameters
            .entry("image_ref".to_string())
            .or_insert_with(|| Value::from(shot.image_ref.clone()));
        // A locked model pin beats the compiler's choice.
        let model = match parameters.remove("model") {
            Some(Value::String(model)) => model,
            _ => compiled.model,
        };

        let mut request = UnifiedRequest::new(provider, model, compiled.text)
            .with_timeout_ms(timeout_ms)
            .with_metadata("shot_id", shot.shot_id.clone())
            .with_metadata("scene_id", shot.scene_id.clone());
        request.parameters = parameters;
        Ok(request)
    }

    /// Score adjacent successful shots and mark violations.
    async fn validate_consistency(
        &self,
        shots: &mut [ShotOutcome],
        originals: &[Shot],
        policy: &ConsistencyPolicy,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Vec<PairScore> {
        let Some(extractor) = self.extractor.as_ref() else {
            return Vec::new();
        };

        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(shots.len());
        for shot in shots.iter() {
            let url = shot.primary().and_then(|v| v.first_url().map(String::from));
            let embedding = match url {
                Some(url) => extractor.embed(&url).await.ok(),
                None => None,
            };
            embeddings.push(embedding);
        }

        let mut scores = Vec::new();
        let mut violating: Vec<usize> = Vec::new();
        for i in 1..shots.len() {
            let (Some(a), Some(b)) = (&embeddings[i - 1], &embeddings[i]) else {
                continue;
            };
            let score = pair_score(a, b);
            if score < policy.threshold {
                let (head, tail) = shots.split_at_mut(i);
                mark_violation(&mut head[i - 1], &mut tail[0], score, i);
                violating.push(i);
            }
            scores.push(PairScore {
                first_shot: shots[i - 1].shot_id.clone(),
                second_shot: shots[i].shot_id.clone(),
                score,
            });
        }

        if policy.regenerate && !violating.is_empty() {
            self.regenerate_shots(
                shots, originals, &mut scores, &embeddings, &violating, policy, timeout_ms, cancel,
            )
            .await;
        }

        scores
    }

    /// One regeneration attempt per violating shot, with a consistency hint
    /// appended to the intent. Kept only when it clears the threshold.
    #[allow(clippy::too_many_arguments)]
    async fn regenerate_shots(
        &self,
        shots: &mut [ShotOutcome],
        originals: &[Shot],
        scores: &mut [PairScore],
        embeddings: &[Option<Vec<f32>>],
        violating: &[usize],
        policy: &ConsistencyPolicy,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) {
        let Some(extractor) = self.extractor.as_ref() else {
            return;
        };

        for &index in violating {
            if cancel.is_cancelled() {
                break;
            }
            let Some(reference) = embeddings[index - 1].as_ref() else {
                continue;
            };
            let Some(original) = originals.iter().find(|s| s.shot_id == shots[index].shot_id)
            else {
                continue;
            };
            let mut retry_shot = original.clone();
            retry_shot.intent_text.push_str(
                " Maintain the established subject appearance and visual style from the previous shot.",
            );

            tracing::info!(shot = %retry_shot.shot_id, "regenerating shot for consistency");
            let regenerated = self.run_shot(&retry_shot, timeout_ms, cancel).await;
            let Some(url) = regenerated
                .primary()
                .and_then(|v| v.first_url().map(String::from))
            else {
                continue;
            };
            let Ok(new_embedding) = extractor.embed(&url).await else {
                continue;
            };
            let new_score = pair_score(reference, &new_embedding);
            if new_score >= policy.threshold {
                shots[index] = regenerated;
                if let Some(pair) = scores
                    .iter_mut()
                    .find(|p| p.second_shot == shots[index].shot_id)
                {
                    pair.score = new_score;
                }
            }
        }
    }
}

/// Merge generation controls: locked over derived over compiler defaults.
pub fn merge_controls(
    defaults: &Map<String, Value>,
    derived: &Map<String, Value>,
    locked: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (k, v) in derived {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in locked {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Cosine similarity clamped into `[0, 1]`.
pub fn pair_score(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

fn mark_violation(first: &mut ShotOutcome, second: &mut ShotOutcome, score: f32, pair_index: usize) {
    let first_id = first.shot_id.clone();
    let second_id = second.shot_id.clone();
    for outcome in [first, second] {
        if let Some(variant) = outcome.primary_mut() {
            variant.status = ResponseStatus::PartialSuccess;
            variant.metadata.extra.insert(
                "consistency_violation".to_string(),
                json!({
                    "pair": [first_id.clone(), second_id.clone()],
                    "pair_index": pair_index,
                    "score": score,
                }),
            );
        }
    }
}

fn shot_failure(shot: &Shot, provider: &str, error: ErrorDetails) -> UnifiedResponse {
    let request = UnifiedRequest::new(provider, "unknown", shot.intent_text.clone());
    let mut response = UnifiedResponse::failure(&request, provider, error);
    response
        .metadata
        .extra
        .insert("shot_id".to_string(), Value::from(shot.shot_id.clone()));
    response
        .metadata
        .extra
        .insert("scene_id".to_string(), Value::from(shot.scene_id.clone()));
    response
}
