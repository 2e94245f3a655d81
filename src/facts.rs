//! Domain vocabularies and the fact extractor: turns a document version's
//! spans into claims, metrics, constraints and risks, scoped to a profile,
//! an extraction level (1-4) and a business process context.
//!
//! The vocabulary defines *what* can be extracted at a given level; the
//! extractor calls out to an LLM to do the extracting and persists the
//! result as a new extraction run. Level is additive — a level-2 vocabulary
//! is the level-1 vocabulary plus more, so a level-2 run naturally surfaces
//! a superset of what a level-1 run would. Re-running at the same
//! (version, profile, process_context) replaces the facts tied to the
//! previous run rather than accumulating duplicates; the prior run's rows
//! stay in the table as history but callers should resolve "current facts"
//! through [`latest_completed_run`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::ExtractionConfig;
use crate::models::{CertaintyLevel, Profile, SourceReliability};

pub const SCHEMA_VERSION: &str = "1";
pub const VOCABULARY_VERSION: &str = "1";

// ═══════════════════════════════════════════════════════════════════════
// Vocabulary
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub unit_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub required_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimPredicateDef {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub subject_types: Vec<String>,
    pub object_types: Vec<String>,
    pub required_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCategoryDef {
    pub name: String,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub indicators: Vec<String>,
    pub required_level: i32,
}

/// A domain-specific vocabulary. Each profile implements this to bound
/// what the extractor is allowed to surface at a given level.
pub trait Vocabulary: Send + Sync {
    fn profile_code(&self) -> &str;
    fn profile_name(&self) -> &str;
    fn metrics(&self, level: i32) -> Vec<MetricDefinition>;
    fn claim_predicates(&self, level: i32) -> Vec<ClaimPredicateDef>;
    /// Risks typically don't surface at level 1; callers pass `level` and
    /// implementations are free to return nothing below their floor.
    fn risk_categories(&self, level: i32) -> Vec<RiskCategoryDef>;

    fn metric_by_name(&self, name: &str) -> Option<MetricDefinition> {
        let needle = name.to_lowercase();
        self.metrics(4)
            .into_iter()
            .find(|m| m.name == needle || m.aliases.iter().any(|a| a.to_lowercase() == needle))
    }

    fn predicate_by_name(&self, name: &str) -> Option<ClaimPredicateDef> {
        let needle = name.to_lowercase();
        self.claim_predicates(4).into_iter().find(|p| p.name == needle)
    }

    /// Context fed into the extraction prompt: the vocabulary available at
    /// `level`, serialized so it can be dropped straight into a system
    /// message.
    fn prompt_context(&self, level: i32) -> serde_json::Value {
        json!({
            "profile": self.profile_code(),
            "profile_name": self.profile_name(),
            "level": level,
            "metrics": self.metrics(level),
            "claim_predicates": self.claim_predicates(level),
            "risk_categories": self.risk_categories(level),
        })
    }
}

fn by_level<T>(items: Vec<(T, i32)>, level: i32) -> Vec<T> {
    items.into_iter().filter(|(_, req)| *req <= level).map(|(item, _)| item).collect()
}

/// Cross-domain baseline vocabulary, applicable to any document.
pub struct GeneralVocabulary;

impl Vocabulary for GeneralVocabulary {
    fn profile_code(&self) -> &str {
        "general"
    }

    fn profile_name(&self) -> &str {
        "General"
    }

    fn metrics(&self, level: i32) -> Vec<MetricDefinition> {
        let rows = [
            ("revenue", "Revenue", "Total revenue or sales", "currency", &["sales", "total_revenue", "net_revenue"][..], 1),
            ("profit", "Profit", "Net profit or net income", "currency", &["net_income", "earnings", "bottom_line"][..], 1),
            ("headcount", "Headcount", "Total number of employees", "count", &["employees", "staff_count", "fte"][..], 1),
            ("gross_margin", "Gross Margin", "Gross profit as percentage of revenue", "percentage", &["gm"][..], 2),
            ("operating_margin", "Operating Margin", "Operating income as percentage of revenue", "percentage", &["op_margin"][..], 2),
            ("ebitda", "EBITDA", "Earnings before interest, taxes, depreciation, and amortization", "currency", &["adjusted_ebitda"][..], 2),
            ("cash", "Cash", "Cash and cash equivalents", "currency", &["cash_on_hand", "cash_balance"][..], 2),
            ("debt", "Total Debt", "Total debt obligations", "currency", &["total_debt", "outstanding_debt"][..], 3),
            ("assets", "Total Assets", "Total assets on balance sheet", "currency", &["total_assets"][..], 3),
            ("liabilities", "Total Liabilities", "Total liabilities on balance sheet", "currency", &["total_liabilities"][..], 3),
            ("equity", "Shareholders' Equity", "Total shareholders' equity", "currency", &["shareholders_equity", "book_value"][..], 3),
            ("working_capital", "Working Capital", "Current assets minus current liabilities", "currency", &["net_working_capital"][..], 4),
            ("capex", "Capital Expenditure", "Capital expenditure", "currency", &["capital_expenditure"][..], 4),
        ];
        let defs = rows
            .into_iter()
            .map(|(name, display, desc, unit, aliases, req)| {
                (
                    MetricDefinition {
                        name: name.to_string(),
                        display_name: display.to_string(),
                        description: desc.to_string(),
                        unit_type: unit.to_string(),
                        aliases: aliases.iter().map(|s| s.to_string()).collect(),
                        required_level: req,
                    },
                    req,
                )
            })
            .collect();
        by_level(defs, level)
    }

    fn claim_predicates(&self, level: i32) -> Vec<ClaimPredicateDef> {
        let rows: Vec<(&str, &str, &str, &[&str], &[&str], i32)> = vec![
            ("has_certification", "Has Certification", "Entity holds a certification", &["company", "organization", "product"], &["certification"], 1),
            ("is_compliant_with", "Is Compliant With", "Entity is compliant with a regulation or standard", &["company", "organization", "product"], &["regulation", "standard", "framework"], 1),
            ("operates_in", "Operates In", "Entity operates in a region or market", &["company", "organization"], &["region", "market", "jurisdiction"], 1),
            ("has_policy", "Has Policy", "Entity has a specific policy in place", &["company", "organization"], &["policy"], 2),
            ("underwent_audit", "Underwent Audit", "Entity underwent an audit", &["company", "organization", "process"], &["audit_type"], 2),
            ("has_contract_with", "Has Contract With", "Entity has a contractual relationship", &["company", "organization"], &["company", "organization"], 2),
            ("owns_ip", "Owns IP", "Entity owns intellectual property", &["company", "organization", "person"], &["patent", "trademark", "copyright"], 3),
            ("has_liability", "Has Liability", "Entity has a legal or financial liability", &["company", "organization"], &["liability_type"], 3),
            ("experienced_incident", "Experienced Incident", "Entity experienced a security or operational incident", &["company", "organization"], &["incident_type"], 3),
            ("related_party_transaction", "Related Party Transaction", "Entity engaged in a related party transaction", &["company", "organization", "person"], &["transaction"], 4),
            ("has_contingency", "Has Contingency", "Entity has a contingent liability or asset", &["company", "organization"], &["contingency"], 4),
        ];
        let defs = rows
            .into_iter()
            .map(|(name, display, desc, subj, obj, req)| {
                (
                    ClaimPredicateDef {
                        name: name.to_string(),
                        display_name: display.to_string(),
                        description: desc.to_string(),
                        subject_types: subj.iter().map(|s| s.to_string()).collect(),
                        object_types: obj.iter().map(|s| s.to_string()).collect(),
                        required_level: req,
                    },
                    req,
                )
            })
            .collect();
        by_level(defs, level)
    }

    fn risk_categories(&self, level: i32) -> Vec<RiskCategoryDef> {
        if level < 2 {
            return Vec::new();
        }
        let rows: Vec<(&str, &str, &str, &[&str], i32)> = vec![
            ("financial_risk", "Financial Risk", "Risks related to financial position or performance", &["declining revenue", "cash burn", "debt covenants", "liquidity concerns"], 2),
            ("compliance_risk", "Compliance Risk", "Risks related to regulatory compliance", &["regulatory violations", "audit findings", "pending investigations"], 2),
            ("operational_risk", "Operational Risk", "Risks related to day-to-day operations", &["key person dependency", "supply chain disruption", "system outages"], 2),
            ("legal_risk", "Legal Risk", "Risks related to litigation or legal exposure", &["pending litigation", "contract disputes", "regulatory action"], 3),
            ("reputational_risk", "Reputational Risk", "Risks to brand or public standing", &["negative press", "customer complaints", "public controversy"], 3),
            ("market_risk", "Market Risk", "Risks from competitive or market shifts", &["new entrants", "pricing pressure", "demand decline"], 4),
        ];
        let defs = rows
            .into_iter()
            .map(|(name, display, desc, indicators, req)| {
                (
                    RiskCategoryDef {
                        name: name.to_string(),
                        display_name: display.to_string(),
                        description: desc.to_string(),
                        indicators: indicators.iter().map(|s| s.to_string()).collect(),
                        required_level: req,
                    },
                    req,
                )
            })
            .collect();
        by_level(defs, level)
    }
}

/// Data-driven vocabulary for a profile whose metrics/predicates/risks are
/// just tables, not behavior. The `vc`, `pharma` and `insurance` profiles
/// are represented this way instead of three more hand-written structs
/// nearly identical to [`GeneralVocabulary`] — see `DESIGN.md`.
pub struct TableVocabulary {
    code: &'static str,
    name: &'static str,
    metrics: Vec<MetricDefinition>,
    predicates: Vec<ClaimPredicateDef>,
    risks: Vec<RiskCategoryDef>,
}

impl Vocabulary for TableVocabulary {
    fn profile_code(&self) -> &str {
        self.code
    }

    fn profile_name(&self) -> &str {
        self.name
    }

    fn metrics(&self, level: i32) -> Vec<MetricDefinition> {
        self.metrics.iter().filter(|m| m.required_level <= level).cloned().collect()
    }

    fn claim_predicates(&self, level: i32) -> Vec<ClaimPredicateDef> {
        self.predicates.iter().filter(|p| p.required_level <= level).cloned().collect()
    }

    fn risk_categories(&self, level: i32) -> Vec<RiskCategoryDef> {
        self.risks.iter().filter(|r| r.required_level <= level).cloned().collect()
    }
}

fn metric(name: &str, display: &str, desc: &str, unit: &str, aliases: &[&str], level: i32) -> MetricDefinition {
    MetricDefinition {
        name: name.to_string(),
        display_name: display.to_string(),
        description: desc.to_string(),
        unit_type: unit.to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        required_level: level,
    }
}

fn predicate(name: &str, display: &str, desc: &str, subj: &[&str], obj: &[&str], level: i32) -> ClaimPredicateDef {
    ClaimPredicateDef {
        name: name.to_string(),
        display_name: display.to_string(),
        description: desc.to_string(),
        subject_types: subj.iter().map(|s| s.to_string()).collect(),
        object_types: obj.iter().map(|s| s.to_string()).collect(),
        required_level: level,
    }
}

fn risk(name: &str, display: &str, desc: &str, indicators: &[&str], level: i32) -> RiskCategoryDef {
    RiskCategoryDef {
        name: name.to_string(),
        display_name: display.to_string(),
        description: desc.to_string(),
        indicators: indicators.iter().map(|s| s.to_string()).collect(),
        required_level: level,
    }
}

fn vc_vocabulary() -> TableVocabulary {
    TableVocabulary {
        code: "vc",
        name: "Venture Capital",
        metrics: vec![
            metric("arr", "ARR", "Annual recurring revenue", "currency", &["annual_recurring_revenue"], 1),
            metric("mrr", "MRR", "Monthly recurring revenue", "currency", &["monthly_recurring_revenue"], 1),
            metric("burn_rate", "Burn Rate", "Net cash outflow per month", "currency", &["monthly_burn", "cash_burn"], 1),
            metric("runway_months", "Runway", "Months of cash remaining at current burn", "duration", &["runway"], 2),
            metric("cac", "CAC", "Customer acquisition cost", "currency", &["customer_acquisition_cost"], 2),
            metric("ltv", "LTV", "Customer lifetime value", "currency", &["customer_lifetime_value"], 2),
            metric("net_dollar_retention", "Net Dollar Retention", "Revenue retained and expanded from existing customers", "percentage", &["ndr", "net_revenue_retention"], 3),
            metric("post_money_valuation", "Post-Money Valuation", "Valuation after the financing round", "currency", &["post_money"], 4),
        ],
        predicates: vec![
            predicate("raised_round", "Raised Round", "Company raised a financing round", &["company"], &["round_type"], 1),
            predicate("has_investor", "Has Investor", "Company has a named investor", &["company"], &["investor"], 1),
            predicate("has_board_seat", "Has Board Seat", "Party holds a board seat", &["investor", "person"], &["company"], 2),
            predicate("has_liquidation_preference", "Has Liquidation Preference", "Investor holds a liquidation preference", &["investor"], &["company"], 3),
            predicate("has_anti_dilution", "Has Anti-Dilution", "Investor holds anti-dilution protection", &["investor"], &["company"], 4),
        ],
        risks: vec![
            risk("cap_table_risk", "Cap Table Risk", "Risks from ownership concentration or complex preference stacks", &["founder dilution", "preference stacking", "option pool shortfall"], 2),
            risk("market_timing_risk", "Market Timing Risk", "Risks from raising into an unfavorable market", &["down round", "extended fundraising cycle"], 3),
            risk("key_investor_risk", "Key Investor Risk", "Risks from a lead investor's capacity or commitment", &["follow-on uncertainty", "investor churn"], 4),
        ],
    }
}

fn pharma_vocabulary() -> TableVocabulary {
    TableVocabulary {
        code: "pharma",
        name: "Pharmaceutical",
        metrics: vec![
            metric("enrollment_count", "Enrollment Count", "Number of patients enrolled", "count", &["patients_enrolled"], 1),
            metric("trial_phase", "Trial Phase", "Clinical trial phase", "count", &["phase"], 1),
            metric("efficacy_rate", "Efficacy Rate", "Observed efficacy percentage", "percentage", &["response_rate"], 2),
            metric("adverse_event_rate", "Adverse Event Rate", "Rate of reported adverse events", "percentage", &["ae_rate"], 2),
            metric("dropout_rate", "Dropout Rate", "Patient trial dropout percentage", "percentage", &["attrition_rate"], 3),
            metric("time_to_endpoint", "Time to Endpoint", "Median time to primary endpoint", "duration", &["median_time_to_event"], 4),
        ],
        predicates: vec![
            predicate("has_indication", "Has Indication", "Drug/therapy targets an indication", &["drug", "therapy"], &["indication"], 1),
            predicate("received_designation", "Received Designation", "Therapy received a regulatory designation", &["drug", "therapy"], &["designation"], 1),
            predicate("met_endpoint", "Met Endpoint", "Trial met its primary or secondary endpoint", &["trial"], &["endpoint"], 2),
            predicate("has_comparator", "Has Comparator", "Trial is measured against a comparator arm", &["trial"], &["comparator"], 3),
            predicate("filed_with_regulator", "Filed With Regulator", "Sponsor filed an application with a regulator", &["company"], &["regulator"], 4),
        ],
        risks: vec![
            risk("trial_risk", "Trial Risk", "Risks to trial completion or validity", &["slow enrollment", "protocol deviations", "site dropout"], 2),
            risk("safety_risk", "Safety Risk", "Risks from adverse events or tolerability", &["serious adverse events", "black box warning"], 2),
            risk("regulatory_risk", "Regulatory Risk", "Risks from regulatory review outcomes", &["complete response letter", "clinical hold"], 3),
            risk("ip_exclusivity_risk", "IP Exclusivity Risk", "Risks to patent life or market exclusivity", &["patent cliff", "generic entry"], 4),
        ],
    }
}

fn insurance_vocabulary() -> TableVocabulary {
    TableVocabulary {
        code: "insurance",
        name: "Insurance",
        metrics: vec![
            metric("loss_ratio", "Loss Ratio", "Incurred losses as a percentage of earned premium", "percentage", &["incurred_loss_ratio"], 1),
            metric("combined_ratio", "Combined Ratio", "Loss ratio plus expense ratio", "percentage", &["combined_operating_ratio"], 1),
            metric("written_premium", "Written Premium", "Gross or net premium written", "currency", &["gross_written_premium", "gwp"], 1),
            metric("retention_rate", "Retention Rate", "Policy renewal retention percentage", "percentage", &["policy_retention"], 2),
            metric("reserve_adequacy", "Reserve Adequacy", "Ratio of held reserves to estimated ultimate losses", "ratio", &["reserve_to_ultimate"], 3),
            metric("catastrophe_exposure", "Catastrophe Exposure", "Estimated probable maximum loss from catastrophe events", "currency", &["pml"], 4),
        ],
        predicates: vec![
            predicate("has_coverage", "Has Coverage", "Policy provides a specific coverage", &["policy"], &["coverage_type"], 1),
            predicate("has_exclusion", "Has Exclusion", "Policy excludes a specific peril or circumstance", &["policy"], &["exclusion_type"], 1),
            predicate("has_reinsurance_with", "Has Reinsurance With", "Carrier cedes risk to a reinsurer", &["carrier"], &["reinsurer"], 2),
            predicate("subject_to_sublimit", "Subject to Sublimit", "Coverage is capped by a sublimit", &["policy"], &["coverage_type"], 3),
            predicate("flagged_for_fraud", "Flagged for Fraud", "Claim was flagged during fraud review", &["claim"], &["fraud_indicator"], 4),
        ],
        risks: vec![
            risk("underwriting_risk", "Underwriting Risk", "Risks from mispriced or poorly selected risk", &["adverse selection", "rate inadequacy"], 2),
            risk("catastrophe_risk", "Catastrophe Risk", "Risks from correlated catastrophic events", &["concentration in peril zone", "inadequate reinsurance"], 2),
            risk("reserve_risk", "Reserve Risk", "Risks from under-reserving for incurred losses", &["adverse development", "reserve strengthening"], 3),
            risk("regulatory_capital_risk", "Regulatory Capital Risk", "Risks to solvency capital requirements", &["rating agency downgrade", "capital shortfall"], 4),
        ],
    }
}

pub fn vocabulary_for_profile(profile: Profile) -> Box<dyn Vocabulary> {
    match profile {
        Profile::General => Box::new(GeneralVocabulary),
        Profile::Vc => Box::new(vc_vocabulary()),
        Profile::Pharma => Box::new(pharma_vocabulary()),
        Profile::Insurance => Box::new(insurance_vocabulary()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// LLM seam
// ═══════════════════════════════════════════════════════════════════════

/// A vendor capable of returning a JSON object for a system/user prompt
/// pair. Mirrors [`crate::embedding::Embedder`]'s role as a provider seam:
/// the extraction logic below never talks to a vendor directly.
#[async_trait]
pub trait FactLlm: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete_json(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<serde_json::Value>;
}

pub struct OpenAiFactLlm {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiFactLlm {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl FactLlm for OpenAiFactLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_json(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<serde_json::Value> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0.0,
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("openai chat completion failed ({status}): {text}");
        }

        let value: serde_json::Value = resp.json().await?;
        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("unexpected openai response shape"))?;

        Ok(serde_json::from_str(content)?)
    }
}

/// Build the configured fact-extraction vendor, or `None` if no credential
/// is configured (callers should record this as a warning, not a hard
/// failure — an evidence repository without an LLM key still stores and
/// searches documents fine).
pub fn build_fact_llm(config: &ExtractionConfig) -> Option<Box<dyn FactLlm>> {
    let key = config.openai_api_key.clone()?;
    match config.llm_provider.as_str() {
        "openai" => {
            let model = config.llm_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            Some(Box::new(OpenAiFactLlm::new(key, model)))
        }
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extraction
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Default)]
struct RawFact {
    #[serde(default)]
    span_refs: Vec<String>,
    #[serde(default)]
    evidence_quote: Option<String>,
    #[serde(default = "default_certainty")]
    certainty: String,
}

fn default_certainty() -> String {
    "probable".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct RawClaim {
    #[serde(flatten)]
    base: RawFact,
    subject: serde_json::Value,
    predicate: String,
    object: serde_json::Value,
    #[serde(default)]
    source_reliability: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMetric {
    #[serde(flatten)]
    base: RawFact,
    entity_id: Option<String>,
    metric_name: String,
    value_numeric: Option<f64>,
    value_raw: Option<String>,
    unit: Option<String>,
    currency: Option<String>,
    period_start: Option<String>,
    period_end: Option<String>,
    as_of: Option<String>,
    period_type: Option<String>,
    method: Option<String>,
    #[serde(default)]
    source_reliability: Option<String>,
    #[serde(default)]
    quality_flags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConstraint {
    #[serde(flatten)]
    base: RawFact,
    constraint_type: String,
    #[serde(default)]
    applies_to: serde_json::Value,
    statement: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRisk {
    #[serde(flatten)]
    base: RawFact,
    risk_type: String,
    #[serde(default)]
    severity: Option<String>,
    statement: String,
    rationale: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ExtractionResponse {
    #[serde(default)]
    claims: Vec<RawClaim>,
    #[serde(default)]
    metrics: Vec<RawMetric>,
    #[serde(default)]
    constraints: Vec<RawConstraint>,
    #[serde(default)]
    risks: Vec<RawRisk>,
}

fn parse_certainty(raw: &str) -> CertaintyLevel {
    match raw {
        "definite" => CertaintyLevel::Definite,
        "possible" => CertaintyLevel::Possible,
        "speculative" => CertaintyLevel::Speculative,
        _ => CertaintyLevel::Probable,
    }
}

fn parse_source_reliability(raw: Option<&str>) -> SourceReliability {
    match raw {
        Some("audited") => SourceReliability::Audited,
        Some("official") => SourceReliability::Official,
        Some("internal") => SourceReliability::Internal,
        Some("third_party") => SourceReliability::ThirdParty,
        _ => SourceReliability::Unknown,
    }
}

/// Keep only the span refs that actually belong to this version, so a
/// hallucinated span id never becomes a dangling foreign key.
fn resolve_span_refs(raw: &[String], known: &std::collections::HashSet<Uuid>) -> Vec<Uuid> {
    raw.iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .filter(|id| known.contains(id))
        .collect()
}

struct SpanRow {
    id: Uuid,
    text_content: String,
}

async fn load_spans(pool: &SqlitePool, version_id: Uuid, tenant_id: Uuid) -> anyhow::Result<Vec<SpanRow>> {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: String,
        text_content: String,
    }
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT id, text_content FROM spans WHERE version_id = ? AND tenant_id = ? ORDER BY created_at ASC",
    )
    .bind(version_id.to_string())
    .bind(tenant_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|r| Uuid::parse_str(&r.id).ok().map(|id| SpanRow { id, text_content: r.text_content }))
        .collect())
}

fn build_prompt(vocabulary: &dyn Vocabulary, level: i32, process_context: &str, spans: &[SpanRow]) -> (String, String) {
    let context = vocabulary.prompt_context(level);
    let system = format!(
        "You are a structured fact extractor for the {} domain at extraction level {level}. \
         Extract only claims, metrics, constraints and risks supported by the provided spans, \
         using the controlled vocabulary below. Every fact must cite the span ids its evidence \
         comes from in `span_refs`. Never invent a span id. Respond with a single JSON object \
         with keys claims, metrics, constraints, risks (each a list, possibly empty).\n\nVocabulary:\n{}",
        vocabulary.profile_name(),
        serde_json::to_string_pretty(&context).unwrap_or_default(),
    );

    let mut user = format!("Business process context: {process_context}\n\nSpans:\n");
    for span in spans {
        user.push_str(&format!("[{}] {}\n", span.id, truncate(&span.text_content, 2000)));
    }
    (system, user)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

pub struct ExtractionOutcome {
    pub run_id: Uuid,
    pub claim_count: usize,
    pub metric_count: usize,
    pub constraint_count: usize,
    pub risk_count: usize,
    pub warnings: Vec<String>,
}

/// Run structured fact extraction over a version's spans at the given
/// profile/level/process context, and persist the result as a new
/// extraction run. Fails the run (status `failed`) rather than returning
/// `Err` when the vendor call itself fails, so a flaky LLM doesn't wedge
/// the pipeline — callers inspect `status` via [`latest_completed_run`].
pub async fn run_extraction(
    pool: &SqlitePool,
    llm: Option<&dyn FactLlm>,
    tenant_id: Uuid,
    version_id: Uuid,
    profile: Profile,
    level: i32,
    process_context: &str,
) -> anyhow::Result<ExtractionOutcome> {
    let level = level.clamp(1, 4);
    let run_id = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();
    let profile_str = serde_json::to_value(profile)?.as_str().unwrap().to_string();

    sqlx::query(
        "INSERT INTO extraction_runs \
         (id, version_id, tenant_id, extractor_name, extractor_version, status, profile, level, \
          process_context, schema_version, vocabulary_version, counts, warnings, created_at) \
         VALUES (?, ?, ?, 'fact_extractor', '1', 'running', ?, ?, ?, ?, ?, '{}', '[]', ?)",
    )
    .bind(run_id.to_string())
    .bind(version_id.to_string())
    .bind(tenant_id.to_string())
    .bind(&profile_str)
    .bind(level)
    .bind(process_context)
    .bind(SCHEMA_VERSION)
    .bind(VOCABULARY_VERSION)
    .bind(&now)
    .execute(pool)
    .await?;

    let spans = load_spans(pool, version_id, tenant_id).await?;
    let known_span_ids: std::collections::HashSet<Uuid> = spans.iter().map(|s| s.id).collect();
    let vocabulary = vocabulary_for_profile(profile);

    let mut warnings = Vec::new();

    let response = if spans.is_empty() {
        warnings.push("no spans available for this version; extraction skipped".to_string());
        ExtractionResponse::default()
    } else if let Some(llm) = llm {
        let (system, user) = build_prompt(vocabulary.as_ref(), level, process_context, &spans);
        match llm.complete_json(&system, &user).await {
            Ok(value) => match serde_json::from_value::<ExtractionResponse>(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warnings.push(format!("malformed extraction response, discarded: {e}"));
                    ExtractionResponse::default()
                }
            },
            Err(e) => {
                warnings.push(format!("extraction vendor call failed: {e}"));
                ExtractionResponse::default()
            }
        }
    } else {
        warnings.push("no fact-extraction credential configured; run produced no facts".to_string());
        ExtractionResponse::default()
    };

    let mut claim_count = 0usize;
    for raw in &response.claims {
        let span_refs = resolve_span_refs(&raw.base.span_refs, &known_span_ids);
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO claims \
             (id, extraction_run_id, tenant_id, version_id, subject, predicate, object, \
              certainty, source_reliability, process_context, span_refs, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(run_id.to_string())
        .bind(tenant_id.to_string())
        .bind(version_id.to_string())
        .bind(raw.subject.to_string())
        .bind(&raw.predicate)
        .bind(raw.object.to_string())
        .bind(serde_json::to_value(parse_certainty(&raw.base.certainty))?.as_str().unwrap())
        .bind(serde_json::to_value(parse_source_reliability(raw.source_reliability.as_deref()))?.as_str().unwrap())
        .bind(process_context)
        .bind(serde_json::to_string(&span_refs)?)
        .bind(&now)
        .execute(pool)
        .await?;
        claim_count += 1;
    }

    let mut metric_count = 0usize;
    for raw in &response.metrics {
        let span_refs = resolve_span_refs(&raw.base.span_refs, &known_span_ids);
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO metrics \
             (id, extraction_run_id, tenant_id, version_id, entity, name, value_numeric, unit, \
              currency, period_start, period_end, as_of, period_type, calculation_method, \
              quality_flags, certainty, source_reliability, process_context, span_refs, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(run_id.to_string())
        .bind(tenant_id.to_string())
        .bind(version_id.to_string())
        .bind(raw.entity_id.clone().unwrap_or_default())
        .bind(&raw.metric_name)
        .bind(raw.value_numeric)
        .bind(&raw.unit)
        .bind(&raw.currency)
        .bind(&raw.period_start)
        .bind(&raw.period_end)
        .bind(&raw.as_of)
        .bind(&raw.period_type)
        .bind(&raw.method)
        .bind(serde_json::to_string(&raw.quality_flags)?)
        .bind(serde_json::to_value(parse_certainty(&raw.base.certainty))?.as_str().unwrap())
        .bind(serde_json::to_value(parse_source_reliability(raw.source_reliability.as_deref()))?.as_str().unwrap())
        .bind(process_context)
        .bind(serde_json::to_string(&span_refs)?)
        .bind(&now)
        .execute(pool)
        .await?;
        metric_count += 1;
        let _ = raw.value_raw.as_ref();
    }

    let mut constraint_count = 0usize;
    for raw in &response.constraints {
        let span_refs = resolve_span_refs(&raw.base.span_refs, &known_span_ids);
        let id = Uuid::new_v4();
        let applies_to = raw.applies_to.clone();
        let modifies_claim_ids: Vec<String> = applies_to
            .get("claim_ids")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let modifies_metric_ids: Vec<String> = applies_to
            .get("metric_ids")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        sqlx::query(
            "INSERT INTO constraints \
             (id, extraction_run_id, tenant_id, version_id, kind, description, \
              modifies_claim_ids, modifies_metric_ids, certainty, process_context, span_refs, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(run_id.to_string())
        .bind(tenant_id.to_string())
        .bind(version_id.to_string())
        .bind(&raw.constraint_type)
        .bind(&raw.statement)
        .bind(serde_json::to_string(&modifies_claim_ids)?)
        .bind(serde_json::to_string(&modifies_metric_ids)?)
        .bind(serde_json::to_value(parse_certainty(&raw.base.certainty))?.as_str().unwrap())
        .bind(process_context)
        .bind(serde_json::to_string(&span_refs)?)
        .bind(&now)
        .execute(pool)
        .await?;
        constraint_count += 1;
    }

    let mut risk_count = 0usize;
    for raw in &response.risks {
        let span_refs = resolve_span_refs(&raw.base.span_refs, &known_span_ids);
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO risks \
             (id, extraction_run_id, tenant_id, version_id, risk_type, severity, statement, \
              rationale, process_context, span_refs, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(run_id.to_string())
        .bind(tenant_id.to_string())
        .bind(version_id.to_string())
        .bind(&raw.risk_type)
        .bind(raw.severity.clone().unwrap_or_else(|| "medium".to_string()))
        .bind(&raw.statement)
        .bind(&raw.rationale)
        .bind(process_context)
        .bind(serde_json::to_string(&span_refs)?)
        .bind(&now)
        .execute(pool)
        .await?;
        risk_count += 1;
    }

    let counts = json!({
        "claims": claim_count,
        "metrics": metric_count,
        "constraints": constraint_count,
        "risks": risk_count,
    });
    let finished = Utc::now().to_rfc3339();
    sqlx::query(
        "UPDATE extraction_runs SET status = 'completed', counts = ?, warnings = ?, finished_at = ?, started_at = ? WHERE id = ?",
    )
    .bind(counts.to_string())
    .bind(serde_json::to_string(&warnings)?)
    .bind(&finished)
    .bind(&now)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;

    Ok(ExtractionOutcome {
        run_id,
        claim_count,
        metric_count,
        constraint_count,
        risk_count,
        warnings,
    })
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExtractionRunRow {
    pub id: String,
    pub profile: Option<String>,
    pub level: Option<i32>,
    pub process_context: Option<String>,
    pub status: String,
}

/// The most recently completed run for a (version, profile, process
/// context) triple. Facts tied to this run's id are the "current" facts;
/// older runs' rows remain for history but are superseded.
pub async fn latest_completed_run(
    pool: &SqlitePool,
    version_id: Uuid,
    profile: Profile,
    process_context: &str,
) -> anyhow::Result<Option<Uuid>> {
    let profile_str = serde_json::to_value(profile)?.as_str().unwrap().to_string();
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM extraction_runs \
         WHERE version_id = ? AND profile = ? AND process_context = ? AND status = 'completed' \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(version_id.to_string())
    .bind(&profile_str)
    .bind(process_context)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(id,)| Uuid::parse_str(&id).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_vocabulary_is_monotone_by_level() {
        let vocab = GeneralVocabulary;
        let l1 = vocab.metrics(1).len();
        let l2 = vocab.metrics(2).len();
        let l4 = vocab.metrics(4).len();
        assert!(l1 <= l2 && l2 <= l4);
        assert!(vocab.risk_categories(1).is_empty());
        assert!(!vocab.risk_categories(2).is_empty());
    }

    #[test]
    fn metric_lookup_resolves_by_alias() {
        let vocab = GeneralVocabulary;
        let found = vocab.metric_by_name("net_income").expect("alias should resolve");
        assert_eq!(found.name, "profit");
    }

    #[test]
    fn table_vocabulary_profiles_are_distinct() {
        let vc = vc_vocabulary();
        let pharma = pharma_vocabulary();
        assert_ne!(vc.profile_code(), pharma.profile_code());
        assert!(!vc.metrics(4).is_empty());
        assert!(!pharma.risk_categories(4).is_empty());
    }

    #[test]
    fn resolve_span_refs_drops_unknown_ids() {
        let known_id = Uuid::new_v4();
        let mut known = std::collections::HashSet::new();
        known.insert(known_id);
        let raw = vec![known_id.to_string(), Uuid::new_v4().to_string(), "not-a-uuid".to_string()];
        let resolved = resolve_span_refs(&raw, &known);
        assert_eq!(resolved, vec![known_id]);
    }

    #[test]
    fn malformed_response_parses_to_default_without_panicking() {
        let value = json!({"claims": "not-a-list"});
        let parsed = serde_json::from_value::<ExtractionResponse>(value);
        assert!(parsed.is_err());
    }
}
