//! Top-level wiring: the request/response envelopes external callers speak
//! (`NPE-REQUEST-1.0`/`NPE-RESPONSE-1.0`), `KernelConfig` (the single place
//! the signing key, clock, canonicalization profile, scoring weights, and
//! default budgets are composed — nothing here is read from process-wide
//! state), and `Kernel`, which drives one request through the episode
//! executor, the proposer dispatcher, and the candidate ranker in sequence.

use std::sync::Arc;

use coh_budget::CoherenceBudget;
pub use coh_canon::Profile;
use coh_clock::Clock;
pub use coh_executor::{EpisodeExecutor, EpisodeRequest, EpisodeResult};
pub use coh_gates::{Constraint, ConstraintKind, Enforcement, Gate, GateManager};
use coh_hash::{typed_hash, Hash, HashKind};
pub use coh_proposers::{Budgets, Candidate, Dispatcher, Proposer, RegistryManifest};
use coh_receipts::ReceiptStore;
pub use coh_rank::ScoreWeights;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const SPEC_REQUEST: &str = "NPE-REQUEST-1.0";
const SPEC_RESPONSE: &str = "NPE-RESPONSE-1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Propose,
    Repair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub proof_hash: Hash,
    pub gate_stack_id: String,
    pub registry_hash: Hash,
    pub failing_gates: Vec<String>,
}

/// Free-form request payload. `context`/`constraints` are JSON values rather
/// than typed structures because the wire envelope leaves their inner shape
/// to the caller; `episode_request_from` below is what imposes structure on
/// them for the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInputs {
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub constraints: Option<Vec<Value>>,
    #[serde(default)]
    pub goals: Option<Vec<String>>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

#[derive(Debug, Clone)]
pub struct NPERequestDraft {
    pub request_type: RequestType,
    pub domain: String,
    pub determinism_tier: String,
    pub seed: u64,
    pub budgets: Budgets,
    pub inputs: RequestInputs,
}

#[derive(Serialize)]
struct RequestCore<'a> {
    spec: &'a str,
    request_type: RequestType,
    domain: &'a str,
    determinism_tier: &'a str,
    seed: u64,
    budgets: &'a Budgets,
    inputs: &'a RequestInputs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NPERequest {
    pub spec: String,
    pub request_id: Hash,
    pub request_type: RequestType,
    pub domain: String,
    pub determinism_tier: String,
    pub seed: u64,
    pub budgets: Budgets,
    pub inputs: RequestInputs,
}

pub fn finalize_request(draft: NPERequestDraft, profile: Profile) -> Result<NPERequest, KernelError> {
    let core = RequestCore {
        spec: SPEC_REQUEST,
        request_type: draft.request_type,
        domain: &draft.domain,
        determinism_tier: &draft.determinism_tier,
        seed: draft.seed,
        budgets: &draft.budgets,
        inputs: &draft.inputs,
    };
    let request_id = typed_hash(&HashKind::Request, &core, profile)?;
    Ok(NPERequest {
        spec: SPEC_REQUEST.to_string(),
        request_id,
        request_type: draft.request_type,
        domain: draft.domain,
        determinism_tier: draft.determinism_tier,
        seed: draft.seed,
        budgets: draft.budgets,
        inputs: draft.inputs,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone)]
pub struct NPEResponseDraft {
    pub request_id: Hash,
    pub domain: String,
    pub determinism_tier: String,
    pub seed: u64,
    pub corpus_snapshot_hash: Hash,
    pub registry_hash: Hash,
    pub candidates: Vec<Candidate>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct ResponseCore<'a> {
    spec: &'a str,
    request_id: Hash,
    domain: &'a str,
    determinism_tier: &'a str,
    seed: u64,
    corpus_snapshot_hash: Hash,
    registry_hash: Hash,
    candidates: &'a [Candidate],
    diagnostics: &'a [Diagnostic],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NPEResponse {
    pub spec: String,
    pub response_id: Hash,
    pub request_id: Hash,
    pub domain: String,
    pub determinism_tier: String,
    pub seed: u64,
    pub corpus_snapshot_hash: Hash,
    pub registry_hash: Hash,
    pub candidates: Vec<Candidate>,
    pub diagnostics: Vec<Diagnostic>,
}

fn finalize_response(draft: NPEResponseDraft, profile: Profile) -> Result<NPEResponse, KernelError> {
    let core = ResponseCore {
        spec: SPEC_RESPONSE,
        request_id: draft.request_id,
        domain: &draft.domain,
        determinism_tier: &draft.determinism_tier,
        seed: draft.seed,
        corpus_snapshot_hash: draft.corpus_snapshot_hash,
        registry_hash: draft.registry_hash,
        candidates: &draft.candidates,
        diagnostics: &draft.diagnostics,
    };
    let response_id = typed_hash(&HashKind::Response, &core, profile)?;
    Ok(NPEResponse {
        spec: SPEC_RESPONSE.to_string(),
        response_id,
        request_id: draft.request_id,
        domain: draft.domain,
        determinism_tier: draft.determinism_tier,
        seed: draft.seed,
        corpus_snapshot_hash: draft.corpus_snapshot_hash,
        registry_hash: draft.registry_hash,
        candidates: draft.candidates,
        diagnostics: draft.diagnostics,
    })
}

/// The kernel-level error taxonomy, minus the receipt/phase-level variants
/// already carried verbatim inside `coh_executor::ExecutorError` and
/// `coh_receipts::ReceiptError` — wrapping those here would just be a second
/// name for the same failure.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("required field missing: {0}")]
    MissingField(String),
    #[error(transparent)]
    Canon(#[from] coh_canon::CanonError),
    #[error(transparent)]
    Hash(#[from] coh_hash::TypedHashError),
    #[error(transparent)]
    Receipt(#[from] coh_receipts::ReceiptError),
    #[error(transparent)]
    Executor(#[from] coh_executor::ExecutorError),
    #[error(transparent)]
    Proposer(#[from] coh_proposers::ProposerError),
    #[error("budget exceeded: {kind} used {used} > limit {limit}")]
    BudgetExceeded { kind: String, used: u64, limit: u64 },
    #[error("processing timed out after {elapsed_ms}ms")]
    ProcessingTimeout { elapsed_ms: i64 },
    #[error("registry load error: {0}")]
    RegistryLoadError(String),
}

impl KernelError {
    /// Maps an error onto a process exit code for an embedder wrapping this
    /// crate in a hosted CLI (`std::process::exit` takes an `i32`).
    pub fn exit_code(&self) -> i32 {
        match self {
            KernelError::InvalidRequest(_) | KernelError::MissingField(_) => 1,
            KernelError::ProcessingTimeout { .. } => 2,
            KernelError::BudgetExceeded { .. } => 3,
            KernelError::RegistryLoadError(_) => 5,
            KernelError::Canon(_)
            | KernelError::Hash(_)
            | KernelError::Receipt(_)
            | KernelError::Executor(_)
            | KernelError::Proposer(_) => 4,
        }
    }
}

/// Everything `Kernel::new` needs, composed in one place per the "explicit
/// config instead of mutable globals" design note — nothing downstream
/// reads a wall clock, a process-wide RNG, or a global signing key.
pub struct KernelConfig {
    pub signing_key: Vec<u8>,
    pub clock: Arc<dyn Clock>,
    pub profile: Profile,
    pub initial_coherence: f64,
    pub coherence_floor: f64,
    pub coherence_degrade_step: f64,
    pub coherence_recover_step: f64,
    pub warn_degrade_step: f64,
    pub scoring_weights: ScoreWeights,
    pub enforcement: Enforcement,
    pub strict_mode: bool,
    pub default_max_reconstruction_steps: u32,
    pub corpus_snapshot_hash: Hash,
    pub gates: Vec<Gate>,
}

impl KernelConfig {
    pub fn new(signing_key: Vec<u8>, clock: Arc<dyn Clock>) -> Self {
        Self {
            signing_key,
            clock,
            profile: Profile::Permissive,
            initial_coherence: 1.0,
            coherence_floor: 0.1,
            coherence_degrade_step: 0.05,
            coherence_recover_step: 0.02,
            warn_degrade_step: 0.02,
            scoring_weights: ScoreWeights::default(),
            enforcement: Enforcement::Strict,
            strict_mode: false,
            default_max_reconstruction_steps: 10,
            corpus_snapshot_hash: Hash::ZERO,
            gates: vec![
                Gate::EvidenceSufficiency { threshold: 0.7, min_count: 1, strict: true },
                Gate::CoherenceCheck { threshold: 0.7, strict: true },
            ],
        }
    }
}

/// Builds the phase-neutral `GateContext` an episode runs against out of a
/// request's free-form `inputs`. The request envelope leaves `context`'s
/// inner shape to the caller, so this function is the one place that
/// decision is made: `evidence`, `evidence_scores`, `required_claims`, and
/// `conclusions` are read from well-known keys under `inputs.context`, and
/// `inputs.constraints` entries of the shape `{"kind": "must"|"must_not",
/// "value": "..."}` become gate constraints; anything else in
/// `context`/`constraints` is ignored.
fn episode_request_from(request: &NPERequest, default_max_reconstruction_steps: u32) -> EpisodeRequest {
    let context = request.inputs.context.as_ref();

    let string_array = |key: &str| -> Vec<String> {
        context
            .and_then(|c| c.get(key))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };

    let evidence_scores = context
        .and_then(|c| c.get("evidence_scores"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect());

    let constraints = request
        .inputs
        .constraints
        .as_ref()
        .map(|entries| entries.iter().filter_map(constraint_from_value).collect())
        .unwrap_or_default();

    EpisodeRequest {
        goal: request.inputs.goals.as_ref().and_then(|g| g.first()).cloned().unwrap_or_default(),
        evidence: string_array("evidence"),
        evidence_scores,
        required_claims: string_array("required_claims"),
        conclusions: string_array("conclusions"),
        constraints,
        max_reconstruction_steps: default_max_reconstruction_steps,
    }
}

fn constraint_from_value(v: &Value) -> Option<Constraint> {
    let kind = match v.get("kind")?.as_str()? {
        "must" => ConstraintKind::Must,
        "must_not" => ConstraintKind::MustNot,
        _ => return None,
    };
    Some(Constraint { kind, value: v.get("value")?.as_str()?.to_string() })
}

/// Owns the episode executor, the receipt store, the coherence budget, and
/// the proposer dispatcher for one session, and drives a request through
/// all three in sequence.
pub struct Kernel {
    config: KernelConfig,
    registry: RegistryManifest,
    executor: EpisodeExecutor,
    receipts: ReceiptStore,
    budget: CoherenceBudget,
    dispatcher: Dispatcher,
}

impl Kernel {
    pub fn new(config: KernelConfig, registry: RegistryManifest) -> Self {
        let gate_manager = GateManager::new(config.gates.clone(), config.enforcement, true);
        let executor = EpisodeExecutor::new(gate_manager, config.clock.clone())
            .with_warn_degrade_step(config.warn_degrade_step)
            .with_strict_mode(config.strict_mode);
        let receipts = ReceiptStore::new(&config.signing_key, config.clock.clone(), config.profile);
        let budget = CoherenceBudget::with_params(
            config.initial_coherence,
            config.coherence_floor,
            config.coherence_degrade_step,
            config.coherence_recover_step,
        );
        let dispatcher = Dispatcher::new(registry.clone(), config.clock.clone());
        Self { config, registry, executor, receipts, budget, dispatcher }
    }

    pub fn register_proposer(&mut self, id: impl Into<String>, proposer: Arc<dyn Proposer>) {
        self.dispatcher.register(id, proposer);
    }

    /// Recomputes and verifies every receipt and chain-digest link for one
    /// episode. Integrity failures (not gate failures — those already live
    /// in the episode's own receipts) are what this surfaces.
    pub fn verify_episode(&self, episode_id: &str) -> Result<(), KernelError> {
        Ok(self.receipts.verify_episode_chain(episode_id)?)
    }

    /// Runs one episode, then — only if it succeeded — dispatches proposers
    /// and ranks their candidates. A failed episode still yields a response,
    /// just with an empty candidate list and a diagnostic explaining why;
    /// gate failures are never raised as `KernelError`.
    pub async fn handle(&mut self, request: NPERequest) -> Result<NPEResponse, KernelError> {
        tracing::info!(request_id = %request.request_id, domain = %request.domain, "handling request");
        let episode_request = episode_request_from(&request, self.config.default_max_reconstruction_steps);
        let episode_result = self.executor.run(&mut self.receipts, &mut self.budget, episode_request)?;
        if !episode_result.success {
            tracing::warn!(episode_id = %episode_result.episode_id, "episode did not succeed, skipping dispatch");
        }

        let mut diagnostics = vec![Diagnostic {
            level: if episode_result.success { DiagnosticLevel::Info } else { DiagnosticLevel::Warn },
            message: format!(
                "episode {} {}",
                episode_result.episode_id,
                if episode_result.success { "succeeded" } else { "failed" }
            ),
            details: serde_json::json!({
                "final_phase": format!("{:?}", episode_result.final_phase),
                "coherence": episode_result.coherence_status,
            }),
        }];

        let candidates = if episode_result.success {
            let context = request.inputs.context.clone().unwrap_or(Value::Null);
            let (raw_candidates, _proposer_meta, accounting) =
                self.dispatcher.dispatch_all(&request.domain, &context, request.budgets).await;

            if accounting.wall_ms_used > request.budgets.max_wall_ms {
                diagnostics.push(Diagnostic {
                    level: DiagnosticLevel::Warn,
                    message: "dispatch exceeded the wall-clock budget and was truncated".to_string(),
                    details: serde_json::json!({
                        "wall_ms_used": accounting.wall_ms_used,
                        "limit": request.budgets.max_wall_ms,
                    }),
                });
            }

            coh_rank::rank(raw_candidates, &self.config.scoring_weights, request.budgets.max_candidates)
        } else {
            Vec::new()
        };

        let registry_hash = self.registry.registry_hash(self.config.profile)?;

        let draft = NPEResponseDraft {
            request_id: request.request_id,
            domain: request.domain,
            determinism_tier: request.determinism_tier,
            seed: request.seed,
            corpus_snapshot_hash: self.config.corpus_snapshot_hash,
            registry_hash,
            candidates,
            diagnostics,
        };

        finalize_response(draft, self.config.profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use coh_clock::FixedClock;
    use std::collections::BTreeMap;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::ticking_from(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
            chrono::Duration::milliseconds(1),
        ))
    }

    fn empty_registry() -> RegistryManifest {
        RegistryManifest {
            spec: "NPE-REGISTRY-1.0".to_string(),
            registry_name: "test-registry".to_string(),
            registry_version: 1,
            domain: BTreeMap::new(),
            proposers: BTreeMap::new(),
        }
    }

    fn request(goal: &str) -> NPERequest {
        let inputs = RequestInputs {
            goals: Some(vec![goal.to_string()]),
            context: Some(serde_json::json!({
                "evidence": ["e1", "e2", "e3"],
                "evidence_scores": [0.9, 0.9, 0.9],
                "required_claims": ["e1", "e2"],
            })),
            ..Default::default()
        };
        finalize_request(
            NPERequestDraft {
                request_type: RequestType::Propose,
                domain: "gr".to_string(),
                determinism_tier: "d0".to_string(),
                seed: 7,
                budgets: Budgets::default(),
                inputs,
            },
            Profile::Permissive,
        )
        .unwrap()
    }

    #[test]
    fn request_id_is_a_function_of_its_own_fields() {
        let r1 = request("g");
        let r2 = request("g");
        assert_eq!(r1.request_id, r2.request_id);
    }

    // The diagnostic message embeds the episode id; this test pulls it back
    // out rather than threading episode_id through the response envelope,
    // which doesn't carry that field.
    fn episode_id_from(response: &NPEResponse) -> String {
        response.diagnostics[0]
            .message
            .strip_prefix("episode ")
            .and_then(|s| s.split(' ').next())
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn happy_request_succeeds_and_yields_a_verifiable_episode() {
        let mut config = KernelConfig::new(b"kernel-test-key-0123456789".to_vec(), clock());
        config.initial_coherence = 0.5;
        let mut kernel = Kernel::new(config, empty_registry());

        let response = kernel.handle(request("g")).await.unwrap();

        assert!(kernel.verify_episode(&episode_id_from(&response)).is_ok());

        let recomputed = finalize_response(
            NPEResponseDraft {
                request_id: response.request_id,
                domain: response.domain.clone(),
                determinism_tier: response.determinism_tier.clone(),
                seed: response.seed,
                corpus_snapshot_hash: response.corpus_snapshot_hash,
                registry_hash: response.registry_hash,
                candidates: response.candidates.clone(),
                diagnostics: response.diagnostics.clone(),
            },
            Profile::Permissive,
        )
        .unwrap();
        assert_eq!(response.response_id, recomputed.response_id);
    }

    #[tokio::test]
    async fn failed_episode_still_yields_a_response_with_empty_candidates() {
        let mut config = KernelConfig::new(b"kernel-test-key-0123456789".to_vec(), clock());
        config.gates = vec![Gate::EvidenceSufficiency { threshold: 0.8, min_count: 5, strict: true }];
        config.initial_coherence = 0.5;
        let mut kernel = Kernel::new(config, empty_registry());

        let response = kernel.handle(request("g")).await.unwrap();

        assert!(response.candidates.is_empty());
        assert_eq!(response.diagnostics[0].level, DiagnosticLevel::Warn);
    }
}
