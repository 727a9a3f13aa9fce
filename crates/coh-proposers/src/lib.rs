//! Candidates, resource budgets, the proposer registry, and deterministic
//! dispatch. A proposer is an external collaborator — it may be synchronous
//! or asynchronous depending on the embedding — so this is the one crate in
//! the workspace where a suspension point is legitimate; everything else
//! here (budget arithmetic, registry normalization, candidate-hash
//! computation) stays pure.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use coh_canon::Profile;
use coh_clock::Clock;
use coh_hash::{typed_hash_bytes, Hash, HashKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    pub max_wall_ms: u64,
    pub max_candidates: usize,
    pub max_evidence_items: usize,
    pub max_search_expansions: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self { max_wall_ms: 1000, max_candidates: 16, max_evidence_items: 100, max_search_expansions: 50 }
    }
}

/// Running tally of resource consumption against a `Budgets` ceiling. All
/// checks here are advisory, per the concurrency model: the dispatcher
/// truncates at return time rather than interrupting an in-flight
/// proposer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetAccounting {
    pub wall_ms_used: u64,
    pub candidates_generated: usize,
    pub evidence_retrieved: usize,
    pub search_expansions: usize,
    pub proposer_wall_ms: HashMap<String, u64>,
}

impl BudgetAccounting {
    pub fn add_wall_time(&mut self, ms: u64) {
        self.wall_ms_used += ms;
    }

    pub fn add_candidates(&mut self, count: usize) {
        self.candidates_generated += count;
    }

    pub fn add_evidence(&mut self, count: usize) {
        self.evidence_retrieved += count;
    }

    pub fn add_search_expansions(&mut self, count: usize) {
        self.search_expansions += count;
    }

    pub fn add_proposer_time(&mut self, proposer_id: &str, ms: u64) {
        *self.proposer_wall_ms.entry(proposer_id.to_string()).or_insert(0) += ms;
    }

    pub fn is_within_budget(&self, budget: &Budgets) -> bool {
        self.wall_ms_used <= budget.max_wall_ms
            && self.candidates_generated <= budget.max_candidates
            && self.evidence_retrieved <= budget.max_evidence_items
            && self.search_expansions <= budget.max_search_expansions
    }
}

pub struct BudgetEnforcer {
    budget: Budgets,
    accounting: BudgetAccounting,
}

impl BudgetEnforcer {
    pub fn new(budget: Budgets) -> Self {
        Self { budget, accounting: BudgetAccounting::default() }
    }

    pub fn budget(&self) -> &Budgets {
        &self.budget
    }

    pub fn accounting(&self) -> &BudgetAccounting {
        &self.accounting
    }

    pub fn within_budget(&self) -> bool {
        self.accounting.is_within_budget(&self.budget)
    }

    pub fn check_time_budget(&self, additional_ms: u64) -> bool {
        self.accounting.wall_ms_used + additional_ms <= self.budget.max_wall_ms
    }

    pub fn check_candidates_budget(&self, additional: usize) -> bool {
        self.accounting.candidates_generated + additional <= self.budget.max_candidates
    }

    pub fn record_time(&mut self, ms: u64, proposer_id: Option<&str>) {
        self.accounting.add_wall_time(ms);
        if let Some(id) = proposer_id {
            self.accounting.add_proposer_time(id, ms);
        }
    }

    pub fn record_candidates(&mut self, count: usize) {
        self.accounting.add_candidates(count);
    }

    pub fn record_evidence(&mut self, count: usize) {
        self.accounting.add_evidence(count);
    }

    pub fn record_search_expansions(&mut self, count: usize) {
        self.accounting.add_search_expansions(count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    Repair,
    Plan,
    SolverConfig,
    Explain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub source_type: String,
    pub source_ref: String,
    pub content_hash: String,
    #[serde(default)]
    pub taint_tags: Vec<String>,
    #[serde(default)]
    pub scope: Value,
    #[serde(default)]
    pub filters_applied: Vec<String>,
    pub relevance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub risk: f64,
    pub utility: f64,
    pub cost: f64,
    pub confidence: f64,
}

impl Default for Scores {
    fn default() -> Self {
        Self { risk: 0.5, utility: 0.5, cost: 0.5, confidence: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerMeta {
    pub proposer_id: String,
    pub invocation_order: u32,
    pub execution_time_ms: u64,
    pub budget_consumed: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_hash: Hash,
    pub candidate_type: CandidateType,
    pub domain: String,
    pub input_state_hash: String,
    pub constraints_hash: String,
    pub payload_format: String,
    pub payload_hash: Hash,
    pub payload: Value,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    pub scores: Scores,
    pub proposer_meta: Option<ProposerMeta>,
    pub suggested_gate_stack: Option<Vec<String>>,
}

/// Fields a proposer fills in before the hashes are known. Passed to
/// `finalize_candidate`, which stamps `payload_hash` and `candidate_hash`.
#[derive(Debug, Clone)]
pub struct CandidateDraft {
    pub candidate_type: CandidateType,
    pub domain: String,
    pub input_state_hash: String,
    pub constraints_hash: String,
    pub payload_format: String,
    pub payload: Value,
    pub evidence: Vec<EvidenceItem>,
    pub scores: Scores,
    pub suggested_gate_stack: Option<Vec<String>>,
}

#[derive(Serialize)]
struct CandidateCore<'a> {
    candidate_type: CandidateType,
    domain: &'a str,
    input_state_hash: &'a str,
    constraints_hash: &'a str,
    payload_format: &'a str,
    payload_hash: Hash,
    payload: &'a Value,
    evidence: &'a [EvidenceItem],
    scores: Scores,
    suggested_gate_stack: &'a Option<Vec<String>>,
}

/// Stamps `payload_hash = typed_hash(Candidate, payload)` and
/// `candidate_hash = typed_hash(Candidate, envelope_minus_candidate_hash)` —
/// the id is a hash of the rest of the envelope, not a field in it.
pub fn finalize_candidate(draft: CandidateDraft, profile: Profile) -> Result<Candidate, ProposerError> {
    let payload_bytes = coh_canon::to_canonical_bytes(&draft.payload, profile)?;
    let payload_hash = typed_hash_bytes(&HashKind::Candidate, &payload_bytes);

    let core = CandidateCore {
        candidate_type: draft.candidate_type,
        domain: &draft.domain,
        input_state_hash: &draft.input_state_hash,
        constraints_hash: &draft.constraints_hash,
        payload_format: &draft.payload_format,
        payload_hash,
        payload: &draft.payload,
        evidence: &draft.evidence,
        scores: draft.scores,
        suggested_gate_stack: &draft.suggested_gate_stack,
    };
    let core_bytes = coh_canon::to_canonical_bytes(&core, profile)?;
    let candidate_hash = typed_hash_bytes(&HashKind::Candidate, &core_bytes);

    Ok(Candidate {
        candidate_hash,
        candidate_type: draft.candidate_type,
        domain: draft.domain,
        input_state_hash: draft.input_state_hash,
        constraints_hash: draft.constraints_hash,
        payload_format: draft.payload_format,
        payload_hash,
        payload: draft.payload,
        evidence: draft.evidence,
        scores: draft.scores,
        proposer_meta: None,
        suggested_gate_stack: draft.suggested_gate_stack,
    })
}

#[derive(Error, Debug)]
pub enum ProposerError {
    #[error("canonicalization failed: {0}")]
    Canon(#[from] coh_canon::CanonError),
    #[error("proposer {id} is not registered with the dispatcher")]
    UnknownProposer { id: String },
    #[error("proposer {id} raised: {cause}")]
    ProposerFailed { id: String, cause: String },
    #[error("registry load error: {0}")]
    RegistryLoadError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub enabled: bool,
    pub proposer_order: Vec<String>,
    #[serde(default)]
    pub budgets: Option<Budgets>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerConfig {
    pub module_ref: String,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    pub candidate_types: Vec<CandidateType>,
    #[serde(default)]
    pub max_outputs: Option<usize>,
    #[serde(default)]
    pub budgets: Option<Budgets>,
}

fn default_entrypoint() -> String {
    "propose".to_string()
}

/// The proposer manifest: `spec`, `registry_name`, `registry_version`, a
/// per-domain `{enabled, proposer_order, budgets}` table, and a per-proposer
/// `{module_ref, entrypoint, candidate_types, max_outputs, budgets}` table.
/// `BTreeMap` keeps both tables in sorted key order for free, which is half
/// of the "normalized manifest" the registry hash is computed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub spec: String,
    pub registry_name: String,
    pub registry_version: u32,
    pub domain: BTreeMap<String, DomainConfig>,
    pub proposers: BTreeMap<String, ProposerConfig>,
}

impl RegistryManifest {
    /// Sorts the per-domain proposer-order and per-proposer candidate-type
    /// arrays (the remaining half of normalization beyond key order).
    pub fn normalized(&self) -> RegistryManifest {
        let mut m = self.clone();
        for domain_cfg in m.domain.values_mut() {
            domain_cfg.proposer_order.sort();
        }
        for proposer_cfg in m.proposers.values_mut() {
            proposer_cfg.candidate_types.sort_by_key(|t| format!("{t:?}"));
        }
        m
    }

    pub fn registry_hash(&self, profile: Profile) -> Result<Hash, ProposerError> {
        let normalized = self.normalized();
        let bytes = coh_canon::to_canonical_bytes(&normalized, profile)?;
        Ok(typed_hash_bytes(&HashKind::Registry, &bytes))
    }

    pub fn domain_budget(&self, domain: &str) -> Option<Budgets> {
        self.domain.get(domain).and_then(|d| d.budgets)
    }
}

#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(
        &self,
        context: &Value,
        budget: &Budgets,
        registry: &RegistryManifest,
    ) -> Result<Vec<Candidate>, ProposerError>;
}

/// Deterministically dispatches a domain's `proposer_order` against a
/// registered set of proposers, tagging every resulting candidate with its
/// invocation order. Proposer failures are localized: they zero out that
/// proposer's contribution and do not abort the remaining order.
pub struct Dispatcher {
    registry: RegistryManifest,
    proposers: HashMap<String, Arc<dyn Proposer>>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(registry: RegistryManifest, clock: Arc<dyn Clock>) -> Self {
        Self { registry, proposers: HashMap::new(), clock }
    }

    pub fn register(&mut self, id: impl Into<String>, proposer: Arc<dyn Proposer>) {
        self.proposers.insert(id.into(), proposer);
    }

    fn sub_budget_for(&self, proposer_id: &str, request_budget: &Budgets) -> Budgets {
        let Some(cfg) = self.registry.proposers.get(proposer_id) else {
            return *request_budget;
        };
        let registry_budget = cfg.budgets.unwrap_or(*request_budget);
        Budgets {
            max_wall_ms: registry_budget.max_wall_ms.min(request_budget.max_wall_ms),
            max_candidates: cfg
                .max_outputs
                .unwrap_or(request_budget.max_candidates)
                .min(request_budget.max_candidates),
            max_evidence_items: registry_budget.max_evidence_items.min(request_budget.max_evidence_items),
            max_search_expansions: registry_budget
                .max_search_expansions
                .min(request_budget.max_search_expansions),
        }
    }

    /// Runs every proposer in `domain`'s `proposer_order`, in order,
    /// checking the residual time budget before each invocation. Returns
    /// the pooled candidates (each tagged with `proposer_meta`), the
    /// per-invocation metadata, and the final accounting.
    pub async fn dispatch_all(
        &self,
        domain: &str,
        context: &Value,
        request_budget: Budgets,
    ) -> (Vec<Candidate>, Vec<ProposerMeta>, BudgetAccounting) {
        let order = self
            .registry
            .domain
            .get(domain)
            .map(|d| d.proposer_order.clone())
            .unwrap_or_default();

        let mut enforcer = BudgetEnforcer::new(request_budget);
        let mut all_candidates = Vec::new();
        let mut all_meta = Vec::new();

        for (invocation_order, proposer_id) in order.iter().enumerate() {
            if !enforcer.check_time_budget(0) {
                tracing::warn!(domain, "time budget exhausted, truncating dispatch");
                break;
            }

            let sub_budget = self.sub_budget_for(proposer_id, &request_budget);
            let invocation_order = invocation_order as u32;

            let Some(proposer) = self.proposers.get(proposer_id) else {
                tracing::warn!(proposer_id, "proposer not registered with dispatcher");
                all_meta.push(ProposerMeta {
                    proposer_id: proposer_id.clone(),
                    invocation_order,
                    execution_time_ms: 0,
                    budget_consumed: HashMap::new(),
                });
                continue;
            };

            let started_at = self.clock.now();
            let outcome = proposer.propose(context, &sub_budget, &self.registry).await;
            let elapsed_ms = (self.clock.now() - started_at).num_milliseconds().max(0) as u64;

            let mut budget_consumed = HashMap::new();
            budget_consumed.insert("wall_ms".to_string(), elapsed_ms);

            match outcome {
                Ok(mut candidates) => {
                    budget_consumed.insert("candidates".to_string(), candidates.len() as u64);
                    let meta = ProposerMeta {
                        proposer_id: proposer_id.clone(),
                        invocation_order,
                        execution_time_ms: elapsed_ms,
                        budget_consumed,
                    };
                    for candidate in &mut candidates {
                        candidate.proposer_meta = Some(meta.clone());
                    }
                    enforcer.record_time(elapsed_ms, Some(proposer_id));
                    enforcer.record_candidates(candidates.len());
                    all_candidates.extend(candidates);
                    all_meta.push(meta);
                }
                Err(cause) => {
                    tracing::warn!(proposer_id, %cause, "proposer failed, continuing with next");
                    enforcer.record_time(elapsed_ms, Some(proposer_id));
                    all_meta.push(ProposerMeta {
                        proposer_id: proposer_id.clone(),
                        invocation_order,
                        execution_time_ms: elapsed_ms,
                        budget_consumed,
                    });
                }
            }
        }

        (all_candidates, all_meta, enforcer.accounting().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_clock::FixedClock;
    use serde_json::json;

    struct AlwaysOneRepair;

    #[async_trait]
    impl Proposer for AlwaysOneRepair {
        async fn propose(
            &self,
            _context: &Value,
            _budget: &Budgets,
            _registry: &RegistryManifest,
        ) -> Result<Vec<Candidate>, ProposerError> {
            let draft = CandidateDraft {
                candidate_type: CandidateType::Repair,
                domain: "gr".to_string(),
                input_state_hash: "sha256:aa".to_string(),
                constraints_hash: "sha256:bb".to_string(),
                payload_format: "json".to_string(),
                payload: json!({"repair_type": "parameter_adjustment"}),
                evidence: vec![],
                scores: Scores::default(),
                suggested_gate_stack: None,
            };
            Ok(vec![finalize_candidate(draft, Profile::Permissive)?])
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Proposer for AlwaysFails {
        async fn propose(
            &self,
            _context: &Value,
            _budget: &Budgets,
            _registry: &RegistryManifest,
        ) -> Result<Vec<Candidate>, ProposerError> {
            Err(ProposerError::ProposerFailed { id: "flaky".to_string(), cause: "boom".to_string() })
        }
    }

    fn registry() -> RegistryManifest {
        let mut domain = BTreeMap::new();
        domain.insert(
            "gr".to_string(),
            DomainConfig { enabled: true, proposer_order: vec!["flaky".to_string(), "repair_one".to_string()], budgets: None },
        );
        let mut proposers = BTreeMap::new();
        proposers.insert(
            "repair_one".to_string(),
            ProposerConfig {
                module_ref: "builtin::repair_one".to_string(),
                entrypoint: "propose".to_string(),
                candidate_types: vec![CandidateType::Repair],
                max_outputs: Some(4),
                budgets: None,
            },
        );
        proposers.insert(
            "flaky".to_string(),
            ProposerConfig {
                module_ref: "builtin::flaky".to_string(),
                entrypoint: "propose".to_string(),
                candidate_types: vec![CandidateType::Repair],
                max_outputs: None,
                budgets: None,
            },
        );
        RegistryManifest { spec: "COH-REGISTRY-1.0".to_string(), registry_name: "test".to_string(), registry_version: 1, domain, proposers }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::ticking_from(
            chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc),
            chrono::Duration::milliseconds(5),
        ))
    }

    #[tokio::test]
    async fn dispatch_continues_past_a_failing_proposer() {
        let mut dispatcher = Dispatcher::new(registry(), clock());
        dispatcher.register("flaky", Arc::new(AlwaysFails));
        dispatcher.register("repair_one", Arc::new(AlwaysOneRepair));

        let (candidates, meta, _accounting) = dispatcher.dispatch_all("gr", &json!({}), Budgets::default()).await;

        assert_eq!(candidates.len(), 1);
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[0].proposer_id, "flaky");
        assert_eq!(meta[1].proposer_id, "repair_one");
    }

    #[tokio::test]
    async fn candidates_are_tagged_with_invocation_order() {
        let mut dispatcher = Dispatcher::new(registry(), clock());
        dispatcher.register("flaky", Arc::new(AlwaysFails));
        dispatcher.register("repair_one", Arc::new(AlwaysOneRepair));

        let (candidates, _meta, _accounting) = dispatcher.dispatch_all("gr", &json!({}), Budgets::default()).await;

        assert_eq!(candidates[0].proposer_meta.as_ref().unwrap().invocation_order, 1);
    }

    #[test]
    fn registry_hash_is_stable_across_key_reordering() {
        let r1 = registry();
        let mut domain2 = BTreeMap::new();
        // Build with a differently-ordered proposer_order; normalization
        // should erase the difference.
        domain2.insert(
            "gr".to_string(),
            DomainConfig { enabled: true, proposer_order: vec!["repair_one".to_string(), "flaky".to_string()], budgets: None },
        );
        let mut r2 = r1.clone();
        r2.domain = domain2;

        assert_eq!(r1.registry_hash(Profile::Permissive).unwrap(), r2.registry_hash(Profile::Permissive).unwrap());
    }

    #[test]
    fn finalize_candidate_hash_excludes_itself() {
        let draft = CandidateDraft {
            candidate_type: CandidateType::Plan,
            domain: "gr".to_string(),
            input_state_hash: "sha256:aa".to_string(),
            constraints_hash: "sha256:bb".to_string(),
            payload_format: "json".to_string(),
            payload: json!({"steps": []}),
            evidence: vec![],
            scores: Scores::default(),
            suggested_gate_stack: None,
        };
        let c = finalize_candidate(draft, Profile::Permissive).unwrap();
        assert_ne!(c.candidate_hash, c.payload_hash);
    }
}
