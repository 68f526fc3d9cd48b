//! Stage identifiers, typed stage outputs, and their validation.
//!
//! Model output is checked in two steps before anything is persisted: a
//! declarative shape check that collects every missing field and cardinality
//! violation, then a typed decode plus cross-field rules.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Stage ids
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    ProblemAnalysis,
    ToolResearch,
    ToolCuration,
    ReportGeneration,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::ProblemAnalysis,
        StageId::ToolResearch,
        StageId::ToolCuration,
        StageId::ReportGeneration,
    ];

    pub fn number(self) -> u8 {
        match self {
            Self::ProblemAnalysis => 1,
            Self::ToolResearch => 2,
            Self::ToolCuration => 3,
            Self::ReportGeneration => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n).checked_sub(1)?).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProblemAnalysis => "problem_analysis",
            Self::ToolResearch => "tool_research",
            Self::ToolCuration => "tool_curation",
            Self::ReportGeneration => "report_generation",
        }
    }

    /// The stage whose validated output this stage consumes.
    pub fn previous(self) -> Option<Self> {
        Self::from_number(self.number() - 1)
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// Stage 3 and 4 completions are much larger, so they get more time.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::ProblemAnalysis => Duration::from_secs(60),
            Self::ToolResearch => Duration::from_secs(90),
            Self::ToolCuration | Self::ReportGeneration => Duration::from_secs(180),
        }
    }

    pub fn max_completion_tokens(self) -> u32 {
        match self {
            Self::ProblemAnalysis => 4_000,
            Self::ToolResearch => 8_000,
            Self::ToolCuration => 6_000,
            Self::ReportGeneration => 8_000,
        }
    }

    /// Static caller tag used for usage attribution.
    pub fn caller(self) -> &'static str {
        match self {
            Self::ProblemAnalysis => "runner::problem_analysis",
            Self::ToolResearch => "runner::tool_research",
            Self::ToolCuration => "runner::tool_curation",
            Self::ReportGeneration => "runner::report_generation",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage{} ({})", self.number(), self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let number = s.strip_prefix("stage").unwrap_or(&s);
        if let Some(stage) = number.parse::<u8>().ok().and_then(Self::from_number) {
            return Ok(stage);
        }
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

// =============================================================================
// Lenient scalar decoding
// =============================================================================

mod lenient {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub(super) fn scalar_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let value = Value::deserialize(d)?;
        scalar_text(&value).ok_or_else(|| D::Error::custom(format!("expected text, got {value}")))
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(scalar_text(&value).filter(|s| !s.is_empty()))
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let value = Value::deserialize(d)?;
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items
                .iter()
                .filter_map(scalar_text)
                .filter(|s| !s.is_empty())
                .collect()),
            Value::String(s) => Ok(s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()),
            other => Err(D::Error::custom(format!("expected a list, got {other}"))),
        }
    }

    pub fn priority<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        let value = Value::deserialize(d)?;
        let parsed = match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().trim_start_matches('#').parse::<u64>().ok(),
            _ => None,
        };
        parsed
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| D::Error::custom(format!("expected a priority number, got {value}")))
    }
}

// =============================================================================
// Stage 1: problem analysis
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessContext {
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub business_name: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub industry: String,
    #[serde(deserialize_with = "lenient::string")]
    pub company_size: String,
    #[serde(deserialize_with = "lenient::string")]
    pub budget: String,
    #[serde(deserialize_with = "lenient::string_list")]
    pub current_systems: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub tech_comfort: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub primary_goals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    #[serde(deserialize_with = "lenient::string")]
    pub problem_title: String,
    #[serde(deserialize_with = "lenient::string")]
    pub problem_description: String,
    /// Weekly time cost, as the model phrased it.
    #[serde(deserialize_with = "lenient::string")]
    pub hours_per_week: String,
    /// Monthly financial cost, as the model phrased it.
    #[serde(deserialize_with = "lenient::string")]
    pub monthly_cost: String,
    /// Keywords handed to tool research.
    #[serde(deserialize_with = "lenient::string_list")]
    pub search_keywords: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemAnalysis {
    pub business_context: BusinessContext,
    pub top_opportunities: Vec<Opportunity>,
}

// =============================================================================
// Stage 2: tool research
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseStudyDetail {
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub company: Option<String>,
    #[serde(
        default,
        alias = "result",
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseStudy {
    Summary(String),
    Detailed(CaseStudyDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCandidate {
    #[serde(deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub pricing: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case_studies: Vec<CaseStudy>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub roi_estimate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionResearch {
    #[serde(deserialize_with = "lenient::string")]
    pub problem_title: String,
    pub tools: Vec<ToolCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResearch {
    pub recommended_solutions: Vec<SolutionResearch>,
}

// =============================================================================
// Stage 3: tool curation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedTool {
    #[serde(deserialize_with = "lenient::priority")]
    pub priority: u8,
    #[serde(deserialize_with = "lenient::string")]
    pub tool_name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub problem_addressed: String,
    #[serde(deserialize_with = "lenient::string")]
    pub pricing: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub why_selected: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_roi: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub implementation_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhereToStart {
    #[serde(deserialize_with = "lenient::string")]
    pub tool_name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub rationale: String,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub first_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuratedTools {
    #[serde(deserialize_with = "lenient::string")]
    pub executive_summary: String,
    pub selected_tools: Vec<SelectedTool>,
    pub where_to_start: WhereToStart,
}

impl CuratedTools {
    /// The tool ranked first; validated outputs always have one.
    pub fn priority_one(&self) -> Option<&SelectedTool> {
        self.selected_tools.iter().find(|t| t.priority == 1)
    }
}

// =============================================================================
// Stage 4: report generation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyProblem {
    #[serde(deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(deserialize_with = "lenient::string")]
    pub description: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub impact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSolution {
    #[serde(deserialize_with = "lenient::string")]
    pub tool_name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub problem_solved: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub pricing: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_roi: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub implementation_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedOutcomes {
    #[serde(deserialize_with = "lenient::string")]
    pub time_saved: String,
    #[serde(deserialize_with = "lenient::string")]
    pub cost_savings: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub roi_timeline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToAction {
    #[serde(deserialize_with = "lenient::string")]
    pub headline: String,
    #[serde(deserialize_with = "lenient::string")]
    pub message: String,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    #[serde(deserialize_with = "lenient::string")]
    pub executive_summary: String,
    pub key_problems: Vec<KeyProblem>,
    pub recommended_solutions: Vec<ReportSolution>,
    pub projected_outcomes: ProjectedOutcomes,
    pub where_to_start: WhereToStart,
    pub call_to_action: CallToAction,
}

// =============================================================================
// Tagged stage output
// =============================================================================

/// A validated stage output. Only values of this type are ever persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    ProblemAnalysis(ProblemAnalysis),
    ToolResearch(ToolResearch),
    ToolCuration(CuratedTools),
    ReportGeneration(FinalReport),
}

impl StageOutput {
    pub fn stage(&self) -> StageId {
        match self {
            Self::ProblemAnalysis(_) => StageId::ProblemAnalysis,
            Self::ToolResearch(_) => StageId::ToolResearch,
            Self::ToolCuration(_) => StageId::ToolCuration,
            Self::ReportGeneration(_) => StageId::ReportGeneration,
        }
    }

    /// Canonical JSON form written to the store.
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Self::ProblemAnalysis(v) => serde_json::to_value(v),
            Self::ToolResearch(v) => serde_json::to_value(v),
            Self::ToolCuration(v) => serde_json::to_value(v),
            Self::ReportGeneration(v) => serde_json::to_value(v),
        };
        // Plain structs with string keys always encode.
        encoded.unwrap_or(Value::Null)
    }
}

/// Validated outputs of earlier stages, as inputs to a later one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorOutputs {
    pub problem_analysis: Option<ProblemAnalysis>,
    pub tool_research: Option<ToolResearch>,
    pub curated_tools: Option<CuratedTools>,
}

impl PriorOutputs {
    pub fn insert(&mut self, output: StageOutput) {
        match output {
            StageOutput::ProblemAnalysis(v) => self.problem_analysis = Some(v),
            StageOutput::ToolResearch(v) => self.tool_research = Some(v),
            StageOutput::ToolCuration(v) => self.curated_tools = Some(v),
            StageOutput::ReportGeneration(_) => {}
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Model output that does not match the stage's contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{stage} output failed validation: {}", .violations.join("; "))]
pub struct SchemaError {
    pub stage: StageId,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Cardinality {
    Exactly(usize),
    NonEmpty,
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    /// String, number or boolean; strings must not be blank.
    Text,
    /// List of scalars, or a comma separated string.
    TextList { non_empty: bool },
    Object(&'static [Field]),
    List(Cardinality, &'static [Field]),
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    shape: Shape,
}

const fn field(name: &'static str, shape: Shape) -> Field {
    Field { name, shape }
}

const BUSINESS_CONTEXT: &[Field] = &[
    field("industry", Shape::Text),
    field("companySize", Shape::Text),
    field("budget", Shape::Text),
    field("currentSystems", Shape::TextList { non_empty: false }),
];

const OPPORTUNITY: &[Field] = &[
    field("problemTitle", Shape::Text),
    field("problemDescription", Shape::Text),
    field("hoursPerWeek", Shape::Text),
    field("monthlyCost", Shape::Text),
    field("searchKeywords", Shape::TextList { non_empty: true }),
];

const PROBLEM_ANALYSIS: &[Field] = &[
    field("businessContext", Shape::Object(BUSINESS_CONTEXT)),
    field(
        "topOpportunities",
        Shape::List(Cardinality::Exactly(3), OPPORTUNITY),
    ),
];

const TOOL_CANDIDATE: &[Field] = &[field("name", Shape::Text), field("pricing", Shape::Text)];

const SOLUTION_RESEARCH: &[Field] = &[
    field("problemTitle", Shape::Text),
    field("tools", Shape::List(Cardinality::NonEmpty, TOOL_CANDIDATE)),
];

const TOOL_RESEARCH: &[Field] = &[field(
    "recommendedSolutions",
    Shape::List(Cardinality::NonEmpty, SOLUTION_RESEARCH),
)];

const SELECTED_TOOL: &[Field] = &[
    field("priority", Shape::Text),
    field("toolName", Shape::Text),
    field("problemAddressed", Shape::Text),
    field("pricing", Shape::Text),
];

const WHERE_TO_START: &[Field] = &[field("toolName", Shape::Text), field("rationale", Shape::Text)];

const CURATED_TOOLS: &[Field] = &[
    field("executiveSummary", Shape::Text),
    field(
        "selectedTools",
        Shape::List(Cardinality::Exactly(3), SELECTED_TOOL),
    ),
    field("whereToStart", Shape::Object(WHERE_TO_START)),
];

const KEY_PROBLEM: &[Field] = &[field("title", Shape::Text), field("description", Shape::Text)];

const REPORT_SOLUTION: &[Field] = &[
    field("toolName", Shape::Text),
    field("problemSolved", Shape::Text),
];

const PROJECTED_OUTCOMES: &[Field] = &[
    field("timeSaved", Shape::Text),
    field("costSavings", Shape::Text),
];

const CALL_TO_ACTION: &[Field] = &[field("headline", Shape::Text), field("message", Shape::Text)];

const FINAL_REPORT: &[Field] = &[
    field("executiveSummary", Shape::Text),
    field("keyProblems", Shape::List(Cardinality::Exactly(3), KEY_PROBLEM)),
    field(
        "recommendedSolutions",
        Shape::List(Cardinality::NonEmpty, REPORT_SOLUTION),
    ),
    field("projectedOutcomes", Shape::Object(PROJECTED_OUTCOMES)),
    field("whereToStart", Shape::Object(WHERE_TO_START)),
    field("callToAction", Shape::Object(CALL_TO_ACTION)),
];

fn schema_for(stage: StageId) -> &'static [Field] {
    match stage {
        StageId::ProblemAnalysis => PROBLEM_ANALYSIS,
        StageId::ToolResearch => TOOL_RESEARCH,
        StageId::ToolCuration => CURATED_TOOLS,
        StageId::ReportGeneration => FINAL_REPORT,
    }
}

fn check_object(value: &Value, fields: &[Field], path: &str, violations: &mut Vec<String>) {
    let Some(map) = value.as_object() else {
        violations.push(format!("{} must be an object", display_path(path)));
        return;
    };
    for f in fields {
        let child_path = if path.is_empty() {
            f.name.to_string()
        } else {
            format!("{path}.{}", f.name)
        };
        match map.get(f.name) {
            None | Some(Value::Null) => violations.push(format!("missing field `{child_path}`")),
            Some(child) => check_shape(child, f.shape, &child_path, violations),
        }
    }
}

fn check_shape(value: &Value, shape: Shape, path: &str, violations: &mut Vec<String>) {
    match shape {
        Shape::Text => match lenient::scalar_text(value) {
            Some(text) if !text.is_empty() => {}
            Some(_) => violations.push(format!("`{path}` is blank")),
            None => violations.push(format!("`{path}` must be text")),
        },
        Shape::TextList { non_empty } => {
            let count = match value {
                Value::Array(items) => {
                    if items.iter().any(|item| lenient::scalar_text(item).is_none()) {
                        violations.push(format!("`{path}` must be a list of text"));
                        return;
                    }
                    items.len()
                }
                Value::String(s) => s.split(',').filter(|p| !p.trim().is_empty()).count(),
                _ => {
                    violations.push(format!("`{path}` must be a list of text"));
                    return;
                }
            };
            if non_empty && count == 0 {
                violations.push(format!("`{path}` must not be empty"));
            }
        }
        Shape::Object(fields) => check_object(value, fields, path, violations),
        Shape::List(cardinality, fields) => {
            let Some(items) = value.as_array() else {
                violations.push(format!("`{path}` must be an array"));
                return;
            };
            match cardinality {
                Cardinality::Exactly(n) if items.len() != n => violations.push(format!(
                    "`{path}` must contain exactly {n} items, found {}",
                    items.len()
                )),
                Cardinality::NonEmpty if items.is_empty() => {
                    violations.push(format!("`{path}` must not be empty"))
                }
                _ => {}
            }
            for (i, item) in items.iter().enumerate() {
                check_object(item, fields, &format!("{path}[{i}]"), violations);
            }
        }
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "output".to_string()
    } else {
        format!("`{path}`")
    }
}

fn same_tool(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn decode<T: serde::de::DeserializeOwned>(stage: StageId, value: &Value) -> Result<T, SchemaError> {
    T::deserialize(value).map_err(|e| SchemaError {
        stage,
        violations: vec![e.to_string()],
    })
}

fn curation_rules(curated: &CuratedTools) -> Vec<String> {
    let mut violations = Vec::new();
    let mut priorities: Vec<u8> = curated.selected_tools.iter().map(|t| t.priority).collect();
    priorities.sort_unstable();
    if priorities != [1, 2, 3] {
        violations.push(format!(
            "`selectedTools` priorities must be exactly 1, 2 and 3, found {priorities:?}"
        ));
    }
    if let Some(first) = curated.priority_one() {
        if !same_tool(&first.tool_name, &curated.where_to_start.tool_name) {
            violations.push(format!(
                "`whereToStart.toolName` is `{}` but the priority-1 tool is `{}`",
                curated.where_to_start.tool_name, first.tool_name
            ));
        }
    }
    violations
}

fn report_rules(report: &FinalReport, curated: &CuratedTools) -> Vec<String> {
    let mut violations = Vec::new();
    if let Some(first) = curated.priority_one() {
        if !same_tool(&first.tool_name, &report.where_to_start.tool_name) {
            violations.push(format!(
                "`whereToStart.toolName` is `{}` but the curated priority-1 tool is `{}`",
                report.where_to_start.tool_name, first.tool_name
            ));
        }
    }
    for (i, solution) in report.recommended_solutions.iter().enumerate() {
        let known = curated
            .selected_tools
            .iter()
            .any(|t| same_tool(&t.tool_name, &solution.tool_name));
        if !known {
            violations.push(format!(
                "`recommendedSolutions[{i}].toolName` `{}` is not one of the curated tools",
                solution.tool_name
            ));
        }
    }
    violations
}

/// Validate a parsed model output for `stage`.
///
/// `prior` supplies earlier outputs for cross-stage rules; the report stage
/// is checked against the curated tools when they are present.
pub fn validate(
    stage: StageId,
    value: &Value,
    prior: &PriorOutputs,
) -> Result<StageOutput, SchemaError> {
    let mut violations = Vec::new();
    check_object(value, schema_for(stage), "", &mut violations);
    if !violations.is_empty() {
        return Err(SchemaError { stage, violations });
    }

    let (output, violations) = match stage {
        StageId::ProblemAnalysis => (
            StageOutput::ProblemAnalysis(decode(stage, value)?),
            Vec::new(),
        ),
        StageId::ToolResearch => (StageOutput::ToolResearch(decode(stage, value)?), Vec::new()),
        StageId::ToolCuration => {
            let curated: CuratedTools = decode(stage, value)?;
            let violations = curation_rules(&curated);
            (StageOutput::ToolCuration(curated), violations)
        }
        StageId::ReportGeneration => {
            let report: FinalReport = decode(stage, value)?;
            let violations = prior
                .curated_tools
                .as_ref()
                .map(|curated| report_rules(&report, curated))
                .unwrap_or_default();
            (StageOutput::ReportGeneration(report), violations)
        }
    };

    if violations.is_empty() {
        Ok(output)
    } else {
        Err(SchemaError { stage, violations })
    }
}

// =============================================================================
// TESTS
// =============================================================================
