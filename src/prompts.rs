//! Prompt templates for the four pipeline stages.
//!
//! Pure rendering: intake data and validated prior outputs in, prompt text
//! out. Provider-agnostic, no I/O.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::stages::{PriorOutputs, StageId};

/// Placeholder text for any intake field that is absent or blank.
pub const NOT_SPECIFIED: &str = "not specified";

// =============================================================================
// Errors
// =============================================================================

/// Intake data or stage inputs that cannot produce a prompt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("intake payload is empty")]
    Empty,

    #[error("intake payload is not valid JSON: {0}")]
    Unparsable(String),

    #[error("intake payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("{stage} requires the validated output of {requires}")]
    MissingPriorOutput { stage: StageId, requires: StageId },

    #[error("{stage} cannot use the stored output of {requires}: {reason}")]
    InvalidStoredOutput {
        stage: StageId,
        requires: StageId,
        reason: String,
    },

    #[error(
        "{stage} cannot be supplied now; next stage is {}",
        .next.map(|s| s.to_string()).unwrap_or_else(|| "none (report complete)".to_string())
    )]
    StageOutOfOrder {
        stage: StageId,
        next: Option<StageId>,
    },
}

// =============================================================================
// Intake data
// =============================================================================

/// Intake questionnaire keys, paired with their template placeholder.
const INTAKE_FIELDS: [(&str, &str); 13] = [
    ("businessName", "business_name"),
    ("industry", "industry"),
    ("companySize", "company_size"),
    ("annualRevenue", "annual_revenue"),
    ("currentSystems", "current_systems"),
    ("biggestChallenges", "biggest_challenges"),
    ("weeklyTimeBreakdown", "weekly_time_breakdown"),
    ("monthlyCostBreakdown", "monthly_cost_breakdown"),
    ("budget", "budget"),
    ("timeline", "timeline"),
    ("goals", "goals"),
    ("techComfort", "tech_comfort"),
    ("additionalContext", "additional_context"),
];

/// The questionnaire a report was created from. Any JSON object is accepted;
/// unknown keys are kept and ignored, missing keys render as
/// [`NOT_SPECIFIED`].
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeData {
    fields: Map<String, Value>,
}

impl IntakeData {
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        if raw.trim().is_empty() {
            return Err(InputError::Empty);
        }
        let value: Value =
            serde_json::from_str(raw).map_err(|e| InputError::Unparsable(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, InputError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Null => Err(InputError::Empty),
            Value::Bool(_) => Err(InputError::NotAnObject("a boolean")),
            Value::Number(_) => Err(InputError::NotAnObject("a number")),
            Value::String(_) => Err(InputError::NotAnObject("a string")),
            Value::Array(_) => Err(InputError::NotAnObject("an array")),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn business_name(&self) -> Option<&str> {
        self.get("businessName")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Raw JSON form, as persisted with the report.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Render one field for a prompt, escaped.
    pub fn render_field(&self, key: &str) -> String {
        let kind = match key {
            "weeklyTimeBreakdown" => Some(BucketKind::Hours),
            "monthlyCostBreakdown" => Some(BucketKind::Cost),
            _ => None,
        };
        match self.get(key) {
            None => NOT_SPECIFIED.to_string(),
            Some(value) => render_value(value, kind),
        }
    }
}

// =============================================================================
// Bucket labels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Hours per week.
    Hours,
    /// Dollars per month.
    Cost,
}

const HOURS_BUCKETS: [(&str, f64); 6] = [
    ("0-2hrs", 1.0),
    ("2-5hrs", 3.5),
    ("5-10hrs", 7.5),
    ("10-20hrs", 15.0),
    ("20-40hrs", 30.0),
    ("40+hrs", 45.0),
];

const COST_BUCKETS: [(&str, f64); 6] = [
    ("$0-100", 50.0),
    ("$100-500", 300.0),
    ("$500-1k", 750.0),
    ("$1k-5k", 3_000.0),
    ("$5k-10k", 7_500.0),
    ("$10k+", 12_500.0),
];

static RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(k\b)?\s*(?:-|–|to)\s*\$?\s*(\d+(?:\.\d+)?)\s*(k\b)?")
        .expect("valid range regex")
});

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(k\b)?").expect("valid number regex"));

fn normalise_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn scaled(digits: &str, thousands: bool) -> Option<f64> {
    let n: f64 = digits.parse().ok()?;
    Some(if thousands { n * 1_000.0 } else { n })
}

/// Representative number for a bucket label.
///
/// Known labels map to fixed midpoints. Anything else falls back to the
/// midpoint of an `a-b` range in the label, then to a single number.
pub fn bucket_value(kind: BucketKind, label: &str) -> Option<f64> {
    let table: &[(&str, f64)] = match kind {
        BucketKind::Hours => &HOURS_BUCKETS,
        BucketKind::Cost => &COST_BUCKETS,
    };
    let wanted = normalise_label(label);
    if let Some((_, v)) = table.iter().find(|(k, _)| normalise_label(k) == wanted) {
        return Some(*v);
    }

    let cleaned = label.replace(',', "");
    if let Some(caps) = RANGE.captures(&cleaned) {
        let hi = scaled(&caps[3], caps.get(4).is_some())?;
        let mut lo = scaled(&caps[1], caps.get(2).is_some())?;
        // "1-5k" means 1k-5k, but "500-2k" means 500-2000.
        if caps.get(2).is_none() && caps.get(4).is_some() && lo * 1_000.0 <= hi {
            lo *= 1_000.0;
        }
        if lo <= hi {
            return Some((lo + hi) / 2.0);
        }
    }
    let caps = NUMBER.captures(&cleaned)?;
    scaled(&caps[1], caps.get(2).is_some())
}

fn infer_kind(label: &str) -> Option<BucketKind> {
    let lower = label.to_ascii_lowercase();
    if lower.trim_start().starts_with('$') {
        Some(BucketKind::Cost)
    } else if lower.contains("hr") || lower.contains("hour") {
        Some(BucketKind::Hours)
    } else {
        None
    }
}

fn format_number(n: f64, group: bool) -> String {
    if n.fract().abs() > f64::EPSILON {
        return format!("{n:.2}")
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string();
    }
    let digits = format!("{}", n as i64);
    if !group || digits.len() <= 3 {
        return digits;
    }
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_amount(kind: BucketKind, n: f64) -> String {
    match kind {
        BucketKind::Hours => format!("{} hours per week", format_number(n, false)),
        BucketKind::Cost => format!("${} per month", format_number(n, true)),
    }
}

/// "data-entry", "data_entry" and "dataEntry" all become "Data entry".
pub fn humanise_label(id: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in id.chars() {
        if c == '-' || c == '_' || c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }

    let joined = words.join(" ");
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => joined,
    }
}

// =============================================================================
// Value rendering
// =============================================================================

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Lighter escaping for embedded JSON: tags cannot be closed, quotes stay
/// readable.
fn escape_tag_breaks(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render_value(value: &Value, kind: Option<BucketKind>) -> String {
    let rendered = match value {
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| scalar_text(item).unwrap_or_else(|| item.to_string()))
            .filter(|s| !s.is_empty())
            .map(|s| escape_xml_chars(&s))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => render_breakdown(map, kind),
        scalar => scalar_text(scalar).map(|s| escape_xml_chars(&s)).unwrap_or_default(),
    };
    if rendered.trim().is_empty() {
        NOT_SPECIFIED.to_string()
    } else {
        rendered
    }
}

/// One line per entry of a `{task id: bucket label}` mapping.
fn render_breakdown(map: &Map<String, Value>, kind: Option<BucketKind>) -> String {
    let mut lines = Vec::with_capacity(map.len());
    for (id, raw) in map {
        let label = format!("{} ({})", humanise_label(id), id);
        let line = match raw {
            Value::Bool(false) | Value::Null => continue,
            Value::Bool(true) => label,
            Value::Number(n) => match (kind, n.as_f64()) {
                (Some(kind), Some(n)) => format!("{label}: {}", format_amount(kind, n)),
                _ => format!("{label}: {n}"),
            },
            Value::String(s) if s.trim().is_empty() => format!("{label}: {NOT_SPECIFIED}"),
            Value::String(s) => {
                let amount = kind
                    .or_else(|| infer_kind(s))
                    .and_then(|k| bucket_value(k, s).map(|n| format_amount(k, n)));
                format!("{label}: {}", amount.unwrap_or_else(|| s.trim().to_string()))
            }
            other => format!("{label}: {other}"),
        };
        lines.push(format!("- {}", escape_xml_chars(&line)));
    }
    lines.join("\n")
}

fn pretty_json<T: Serialize>(value: &T) -> String {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    escape_tag_breaks(&text)
}

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

/// A prompt template with `{placeholder}` slots in the user message.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Fill the user template. Values are inserted in a single pass, so text
    /// inside a value is never treated as a placeholder.
    pub fn render(&self, vars: &[(&str, String)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: self.system.trim().to_string(),
            user: fill(self.user, vars).trim().to_string(),
        }
    }
}

fn fill(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let found = after.find('}').and_then(|end| {
            let name = &after[..end];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (end, value))
        });
        match found {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Stage prompts
// =============================================================================

pub const PROBLEM_ANALYSIS_PROMPT: PromptTemplate = PromptTemplate {
    slug: "problem_analysis_v1",
    system: r#"You are a senior operations consultant for small and mid-sized businesses. You read an intake questionnaire and identify where the business loses the most time and money to manual work that software could remove.

Use the hour and cost figures provided; do not invent larger numbers. Pick exactly 3 opportunities, ranked by combined time and cost impact.

Output only valid JSON in this shape:
{
  "businessContext": {
    "industry": "...",
    "companySize": "...",
    "budget": "...",
    "currentSystems": ["..."],
    "techComfort": "...",
    "primaryGoals": ["..."]
  },
  "topOpportunities": [
    {
      "problemTitle": "...",
      "problemDescription": "...",
      "hoursPerWeek": "...",
      "monthlyCost": "...",
      "searchKeywords": ["...", "..."]
    }
  ]
}
`topOpportunities` must contain exactly 3 items, and every `searchKeywords` list must be non-empty."#,
    user: r#"Analyze this business and identify its top 3 automation opportunities.

<business_profile>
<business_name>{business_name}</business_name>
<industry>{industry}</industry>
<company_size>{company_size}</company_size>
<annual_revenue>{annual_revenue}</annual_revenue>
<current_systems>{current_systems}</current_systems>
<biggest_challenges>
{biggest_challenges}
</biggest_challenges>
<weekly_time_breakdown>
{weekly_time_breakdown}
</weekly_time_breakdown>
<monthly_cost_breakdown>
{monthly_cost_breakdown}
</monthly_cost_breakdown>
<budget>{budget}</budget>
<timeline>{timeline}</timeline>
<goals>{goals}</goals>
<tech_comfort>{tech_comfort}</tech_comfort>
<additional_context>
{additional_context}
</additional_context>
</business_profile>

Return only the JSON object.
json:"#,
};

pub const TOOL_RESEARCH_PROMPT: PromptTemplate = PromptTemplate {
    slug: "tool_research_v1",
    system: r#"You are a software research analyst. For each business problem you are given, find established, currently available software tools that solve it for a business of this size and budget.

Prefer tools with transparent pricing and documented results. Give 2 to 4 candidates per problem.

Output only valid JSON in this shape:
{
  "recommendedSolutions": [
    {
      "problemTitle": "...",
      "tools": [
        {
          "name": "...",
          "pricing": "...",
          "description": "...",
          "website": "...",
          "caseStudies": ["..."],
          "roiEstimate": "..."
        }
      ]
    }
  ]
}
`recommendedSolutions` must be non-empty and every `tools` list must be non-empty."#,
    user: r#"Research software tools for these problems.

<business_context>
<industry>{industry}</industry>
<company_size>{company_size}</company_size>
<budget>{budget}</budget>
<tech_comfort>{tech_comfort}</tech_comfort>
</business_context>

<problems>
{opportunities}
</problems>

Use each problem's searchKeywords to guide the search. Return only the JSON object.
json:"#,
};

pub const TOOL_CURATION_PROMPT: PromptTemplate = PromptTemplate {
    slug: "tool_curation_v1",
    system: r#"You are a pragmatic technology advisor. From a list of researched candidate tools, you select the three that give this business the fastest, most reliable return within its budget and technical comfort.

Select exactly 3 tools with priorities 1, 2 and 3 (each used once). `whereToStart.toolName` must be the priority 1 tool.

Output only valid JSON in this shape:
{
  "executiveSummary": "...",
  "selectedTools": [
    {
      "priority": 1,
      "toolName": "...",
      "problemAddressed": "...",
      "pricing": "...",
      "whySelected": "...",
      "expectedRoi": "...",
      "implementationTime": "..."
    }
  ],
  "whereToStart": {
    "toolName": "...",
    "rationale": "...",
    "firstSteps": ["..."]
  }
}"#,
    user: r#"Choose the 3 tools this business should adopt.

<business_context>
{business_context}
</business_context>

<constraints>
<budget>{budget}</budget>
<timeline>{timeline}</timeline>
<tech_comfort>{tech_comfort}</tech_comfort>
</constraints>

<problems>
{opportunities}
</problems>

<candidate_tools>
{research}
</candidate_tools>

Return only the JSON object.
json:"#,
};

pub const REPORT_GENERATION_PROMPT: PromptTemplate = PromptTemplate {
    slug: "report_generation_v1",
    system: r#"You are writing the final client report for a business automation assessment. The reader is the business owner: be concrete, warm and brief, and tie every number back to the analysis you are given.

Only recommend the curated tools. `whereToStart.toolName` must be the priority 1 curated tool. `keyProblems` must contain exactly 3 items.

Output only valid JSON in this shape:
{
  "executiveSummary": "...",
  "keyProblems": [
    {"title": "...", "description": "...", "impact": "..."}
  ],
  "recommendedSolutions": [
    {
      "toolName": "...",
      "problemSolved": "...",
      "pricing": "...",
      "expectedRoi": "...",
      "implementationTime": "..."
    }
  ],
  "projectedOutcomes": {
    "timeSaved": "...",
    "costSavings": "...",
    "roiTimeline": "..."
  },
  "whereToStart": {"toolName": "...", "rationale": "...", "firstSteps": ["..."]},
  "callToAction": {"headline": "...", "message": "...", "nextSteps": ["..."]}
}"#,
    user: r#"Write the report for {business_name}.

<goals>{goals}</goals>

<business_context>
{business_context}
</business_context>

<problems>
{opportunities}
</problems>

<curated_tools>
{curated_tools}
</curated_tools>

Return only the JSON object.
json:"#,
};

pub fn template_for(stage: StageId) -> PromptTemplate {
    match stage {
        StageId::ProblemAnalysis => PROBLEM_ANALYSIS_PROMPT,
        StageId::ToolResearch => TOOL_RESEARCH_PROMPT,
        StageId::ToolCuration => TOOL_CURATION_PROMPT,
        StageId::ReportGeneration => REPORT_GENERATION_PROMPT,
    }
}

fn require<'a, T>(
    value: &'a Option<T>,
    stage: StageId,
    requires: StageId,
) -> Result<&'a T, InputError> {
    value
        .as_ref()
        .ok_or(InputError::MissingPriorOutput { stage, requires })
}

fn or_not_specified(text: Option<&str>) -> String {
    match text.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => escape_xml_chars(s),
        None => NOT_SPECIFIED.to_string(),
    }
}

/// Build the prompt for `stage` from the intake and earlier stage outputs.
pub fn build(
    stage: StageId,
    prior: &PriorOutputs,
    intake: &IntakeData,
) -> Result<PromptInstance, InputError> {
    let template = template_for(stage);
    let vars: Vec<(&str, String)> = match stage {
        StageId::ProblemAnalysis => INTAKE_FIELDS
            .iter()
            .map(|(key, placeholder)| (*placeholder, intake.render_field(key)))
            .collect(),
        StageId::ToolResearch => {
            let analysis = require(&prior.problem_analysis, stage, StageId::ProblemAnalysis)?;
            let ctx = &analysis.business_context;
            vec![
                ("industry", or_not_specified(Some(&ctx.industry))),
                ("company_size", or_not_specified(Some(&ctx.company_size))),
                ("budget", or_not_specified(Some(&ctx.budget))),
                ("tech_comfort", or_not_specified(ctx.tech_comfort.as_deref())),
                ("opportunities", pretty_json(&analysis.top_opportunities)),
            ]
        }
        StageId::ToolCuration => {
            let analysis = require(&prior.problem_analysis, stage, StageId::ProblemAnalysis)?;
            let research = require(&prior.tool_research, stage, StageId::ToolResearch)?;
            vec![
                ("business_context", pretty_json(&analysis.business_context)),
                ("budget", intake.render_field("budget")),
                ("timeline", intake.render_field("timeline")),
                ("tech_comfort", intake.render_field("techComfort")),
                ("opportunities", pretty_json(&analysis.top_opportunities)),
                ("research", pretty_json(&research.recommended_solutions)),
            ]
        }
        StageId::ReportGeneration => {
            let analysis = require(&prior.problem_analysis, stage, StageId::ProblemAnalysis)?;
            let curated = require(&prior.curated_tools, stage, StageId::ToolCuration)?;
            vec![
                ("business_name", or_not_specified(intake.business_name())),
                ("goals", intake.render_field("goals")),
                ("business_context", pretty_json(&analysis.business_context)),
                ("opportunities", pretty_json(&analysis.top_opportunities)),
                ("curated_tools", pretty_json(curated)),
            ]
        }
    };
    Ok(template.render(&vars))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{validate, StageOutput};
    use serde_json::json;

    fn intake(value: Value) -> IntakeData {
        IntakeData::from_value(value).unwrap()
    }

    fn analysis() -> PriorOutputs {
        let opportunity = |title: &str| {
            json!({
                "problemTitle": title,
                "problemDescription": "Manual work",
                "hoursPerWeek": "7.5",
                "monthlyCost": "$750",
                "searchKeywords": ["scheduling software"]
            })
        };
        let value = json!({
            "businessContext": {
                "industry": "Dental <clinic>",
                "companySize": "12",
                "budget": "$500-1k",
                "currentSystems": ["Dentrix"]
            },
            "topOpportunities": [opportunity("A"), opportunity("B"), opportunity("C")]
        });
        let mut prior = PriorOutputs::default();
        prior.insert(validate(StageId::ProblemAnalysis, &value, &prior).unwrap());
        prior
    }

    #[test]
    fn intake_parse_rejects_only_unusable_payloads() {
        assert_eq!(IntakeData::parse("   ").unwrap_err(), InputError::Empty);
        assert!(matches!(
            IntakeData::parse("{not json").unwrap_err(),
            InputError::Unparsable(_)
        ));
        assert_eq!(
            IntakeData::parse("[1, 2]").unwrap_err(),
            InputError::NotAnObject("an array")
        );
        assert!(IntakeData::parse("{}").is_ok());
    }

    #[test]
    fn known_buckets_map_to_midpoints() {
        assert_eq!(bucket_value(BucketKind::Hours, "5-10hrs"), Some(7.5));
        assert_eq!(bucket_value(BucketKind::Hours, "40+ hrs"), Some(45.0));
        assert_eq!(bucket_value(BucketKind::Cost, "$500-1k"), Some(750.0));
        assert_eq!(bucket_value(BucketKind::Cost, "$10K+"), Some(12_500.0));
    }

    #[test]
    fn unknown_labels_fall_back_to_numbers() {
        assert_eq!(bucket_value(BucketKind::Hours, "3-4 hours"), Some(3.5));
        assert_eq!(bucket_value(BucketKind::Cost, "$2k-4k"), Some(3_000.0));
        assert_eq!(bucket_value(BucketKind::Cost, "$1-5k"), Some(3_000.0));
        assert_eq!(bucket_value(BucketKind::Cost, "$500-2k"), Some(1_250.0));
        assert_eq!(bucket_value(BucketKind::Cost, "$1,000 to $2,000"), Some(1_500.0));
        assert_eq!(bucket_value(BucketKind::Hours, "about 6"), Some(6.0));
        assert_eq!(bucket_value(BucketKind::Hours, "a lot"), None);
    }

    #[test]
    fn labels_are_humanised() {
        assert_eq!(humanise_label("data-entry"), "Data entry");
        assert_eq!(humanise_label("invoice_processing"), "Invoice processing");
        assert_eq!(humanise_label("followUpCalls"), "Follow up calls");
    }

    #[test]
    fn stage1_renders_time_breakdown_in_hours() {
        let data = intake(json!({
            "businessName": "Bright Smiles",
            "weeklyTimeBreakdown": {"data-entry": "5-10hrs"},
            "monthlyCostBreakdown": {"software": "$10k+", "overtime": "$500-1k"}
        }));
        let prompt = build(StageId::ProblemAnalysis, &PriorOutputs::default(), &data).unwrap();
        assert_eq!(prompt.template_slug, "problem_analysis_v1");
        assert!(prompt.user.contains("7.5 hours"));
        assert!(prompt.user.contains("- Data entry (data-entry): 7.5 hours per week"));
        assert!(prompt.user.contains("$12,500 per month"));
        assert!(prompt.user.contains("$750 per month"));
    }

    #[test]
    fn unknown_bucket_label_is_kept_verbatim() {
        let data = intake(json!({"weeklyTimeBreakdown": {"filing": "varies"}}));
        let prompt = build(StageId::ProblemAnalysis, &PriorOutputs::default(), &data).unwrap();
        assert!(prompt.user.contains("- Filing (filing): varies"));
    }

    #[test]
    fn missing_fields_render_as_not_specified() {
        let data = intake(json!({"industry": "  ", "goals": []}));
        let prompt = build(StageId::ProblemAnalysis, &PriorOutputs::default(), &data).unwrap();
        assert!(prompt.user.contains("<industry>not specified</industry>"));
        assert!(prompt.user.contains("<goals>not specified</goals>"));
        assert!(prompt.user.contains("<timeline>not specified</timeline>"));
    }

    #[test]
    fn scalars_and_lists_render_plainly() {
        let data = intake(json!({
            "companySize": 12,
            "currentSystems": ["QuickBooks", "Gmail"],
            "biggestChallenges": {"scheduling": true, "billing": false}
        }));
        let prompt = build(StageId::ProblemAnalysis, &PriorOutputs::default(), &data).unwrap();
        assert!(prompt.user.contains("<company_size>12</company_size>"));
        assert!(prompt.user.contains("QuickBooks, Gmail"));
        assert!(prompt.user.contains("- Scheduling (scheduling)"));
        assert!(!prompt.user.contains("Billing"));
    }

    #[test]
    fn user_text_is_escaped() {
        let data = intake(json!({"businessName": "<script>alert('x')</script>"}));
        let prompt = build(StageId::ProblemAnalysis, &PriorOutputs::default(), &data).unwrap();
        assert!(prompt.user.contains("&lt;script&gt;"));
        assert!(!prompt.user.contains("<script>"));
    }

    #[test]
    fn values_are_not_re_substituted() {
        let data = intake(json!({"businessName": "{industry}", "industry": "Retail"}));
        let prompt = build(StageId::ProblemAnalysis, &PriorOutputs::default(), &data).unwrap();
        assert!(prompt.user.contains("<business_name>{industry}</business_name>"));
    }

    #[test]
    fn later_stages_require_prior_outputs() {
        let data = intake(json!({}));
        let err = build(StageId::ToolResearch, &PriorOutputs::default(), &data).unwrap_err();
        assert_eq!(
            err,
            InputError::MissingPriorOutput {
                stage: StageId::ToolResearch,
                requires: StageId::ProblemAnalysis
            }
        );
        let err = build(StageId::ReportGeneration, &analysis(), &data).unwrap_err();
        assert_eq!(
            err,
            InputError::MissingPriorOutput {
                stage: StageId::ReportGeneration,
                requires: StageId::ToolCuration
            }
        );
    }

    #[test]
    fn stage2_embeds_opportunities() {
        let prompt = build(StageId::ToolResearch, &analysis(), &intake(json!({}))).unwrap();
        assert!(prompt.user.contains("scheduling software"));
        assert!(prompt.user.contains("Dental &lt;clinic&gt;"));
        assert!(prompt.user.contains("<tech_comfort>not specified</tech_comfort>"));
        assert!(prompt.system.contains("recommendedSolutions"));
    }

    #[test]
    fn stage4_embeds_curated_tools() {
        let mut prior = analysis();
        let curated = json!({
            "executiveSummary": "Three tools.",
            "selectedTools": [
                {"priority": 1, "toolName": "Weave", "problemAddressed": "A", "pricing": "$300"},
                {"priority": 2, "toolName": "Zapier", "problemAddressed": "B", "pricing": "$20"},
                {"priority": 3, "toolName": "Gusto", "problemAddressed": "C", "pricing": "$40"}
            ],
            "whereToStart": {"toolName": "Weave", "rationale": "Biggest win"}
        });
        let output = validate(StageId::ToolCuration, &curated, &prior).unwrap();
        assert!(matches!(output, StageOutput::ToolCuration(_)));
        prior.insert(output);

        let data = intake(json!({"businessName": "Bright Smiles", "goals": "grow"}));
        let prompt = build(StageId::ReportGeneration, &prior, &data).unwrap();
        assert!(prompt.user.starts_with("Write the report for Bright Smiles."));
        assert!(prompt.user.contains("\"toolName\": \"Weave\""));
        assert!(prompt.system.contains("exactly 3"));
    }
}
