use async_trait::async_trait;
use tracing::{debug, warn};

use crate::agent::{
    Action, ActionOutcome, AgentError, Goal, Proposal, ReducedPage, Reasoner, StepRecord,
    MAX_ACTIONS_PER_STEP,
};
use crate::gemini::{GeminiClient, GeminiError};

/// Well-known Amazon selectors offered to the model as hints.
pub const AMAZON_SELECTOR_HINTS: &[(&str, &str)] = &[
    ("search_box", "#twotabsearchtextbox"),
    ("search_submit", "#nav-search-submit-button"),
    ("first_result_link", ".s-result-item .a-link-normal[href]"),
    ("sort_dropdown", "select#s-result-sort-select"),
];

const ACTION_FORMS: &str = r##"{"action":"navigate","url":"https://www.amazon.com/s?k=..."}
{"action":"click","selector":"#nav-search-submit-button"}
{"action":"type","selector":"#twotabsearchtextbox","text":"RTX 4090"}
{"action":"press","selector":"#twotabsearchtextbox","key":"Enter"}
{"action":"select","selector":"select#s-result-sort-select","value":"price-desc-rank"}
{"action":"scroll","dy":800}
{"action":"wait_for","selector":".s-main-slot","timeout_ms":5000}"##;

impl From<GeminiError> for AgentError {
    fn from(err: GeminiError) -> Self {
        match err {
            GeminiError::RateLimited { message, retry_after } => {
                AgentError::RateLimited { message, retry_after }
            }
            other => AgentError::Model(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct GeminiReasoner {
    client: GeminiClient,
    instructions: String,
}

impl GeminiReasoner {
    pub fn new(client: GeminiClient) -> Self {
        Self { client, instructions: String::new() }
    }

    /// Extra operator instructions placed ahead of the goal.
    pub fn with_instructions(client: GeminiClient, instructions: impl Into<String>) -> Self {
        Self { client, instructions: instructions.into() }
    }
}

#[async_trait]
impl Reasoner for GeminiReasoner {
    async fn propose_next_actions(
        &self,
        goal: &Goal,
        history: &[StepRecord],
        page: &ReducedPage,
    ) -> Result<Proposal, AgentError> {
        let prompt = compose_prompt(&self.instructions, goal, history, page);
        debug!(model = %self.client.model(), chars = prompt.len(), "requesting next actions");
        let reply = self.client.generate(&prompt).await?;
        parse_reply(&reply)
    }
}

pub fn compose_prompt(
    instructions: &str,
    goal: &Goal,
    history: &[StepRecord],
    page: &ReducedPage,
) -> String {
    let mut s = String::new();
    s.push_str("You are an iterative browser automation assistant driving a live Amazon session.\n");
    if !instructions.trim().is_empty() {
        s.push_str(instructions.trim());
        s.push('\n');
    }
    s.push_str("Goal: ");
    s.push_str(&goal.task);
    s.push_str("\n\nPreviously executed actions (in order):\n");
    s.push_str(&render_history(history));
    s.push_str("\n\nCurrent page: ");
    s.push_str(page.url.as_deref().unwrap_or("(unknown)"));
    if let Some(title) = page.title.as_deref().filter(|t| !t.trim().is_empty()) {
        s.push_str(" | ");
        s.push_str(title.trim());
    }
    s.push_str("\nKnown selectors:\n");
    for (name, selector) in AMAZON_SELECTOR_HINTS {
        s.push_str(&format!("- {name}: {selector}\n"));
    }
    s.push_str("\nREDUCED HTML of the current page (important sections only):\n");
    s.push_str(&page.content);
    s.push_str("\n\nReturn ONLY the next 1-");
    s.push_str(&MAX_ACTIONS_PER_STEP.to_string());
    s.push_str(" actions as JSON objects, one per line, OR a single line 'DONE <reason>'.\nAction forms:\n");
    s.push_str(ACTION_FORMS);
    s.push_str(
        "\nRules:\n\
         - Use only selectors that plausibly exist in the page above.\n\
         - Prefer selectors that worked in earlier steps.\n\
         - After filling the search box, press Enter or click the search button.\n\
         - Stay on amazon.com; never buy, check out, or change account or payment settings.\n\
         - If an action failed, try a different selector instead of repeating it.\n\
         - Output raw JSON lines only (no backticks, no commentary) or the DONE line.\n",
    );
    s
}

/// One line per recorded action, with its outcome.
pub fn render_history(history: &[StepRecord]) -> String {
    let lines: Vec<String> = history
        .iter()
        .flat_map(|step| {
            step.outcomes.iter().map(move |r| {
                let outcome = match &r.outcome {
                    ActionOutcome::Succeeded => "ok".to_string(),
                    ActionOutcome::Failed { error } => format!("FAILED: {error}"),
                    ActionOutcome::Skipped { reason } => format!("SKIPPED: {reason}"),
                };
                format!("step {}: {} -> {}", step.step, r.action, outcome)
            })
        })
        .collect();
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Accepts `DONE <reason>`, a JSON array of actions, or one JSON action per line.
pub fn parse_reply(reply: &str) -> Result<Proposal, AgentError> {
    let text = strip_fences(reply.trim());
    if text.is_empty() {
        return Err(AgentError::Model("model returned empty output".into()));
    }

    let first = text.lines().next().unwrap_or_default().trim();
    if first.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("DONE")) {
        let reason = first[4..].trim_start_matches([':', '-', ' ', '\t']).trim();
        let reason = if reason.is_empty() { "goal reached" } else { reason };
        return Ok(Proposal::Done { reason: reason.to_string() });
    }

    let mut actions = if let Ok(list) = serde_json::from_str::<Vec<Action>>(text) {
        list
    } else if let Ok(single) = serde_json::from_str::<Action>(text) {
        vec![single]
    } else {
        text.lines()
            .map(|l| l.trim().trim_end_matches(','))
            .filter(|l| !l.is_empty())
            .map(|l| {
                serde_json::from_str::<Action>(l)
                    .map_err(|e| AgentError::Model(format!("unparseable action `{l}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    if actions.is_empty() {
        return Err(AgentError::Model("model proposed no actions".into()));
    }
    if actions.len() > MAX_ACTIONS_PER_STEP {
        warn!(proposed = actions.len(), "model proposed too many actions, keeping the first {}", MAX_ACTIONS_PER_STEP);
        actions.truncate(MAX_ACTIONS_PER_STEP);
    }
    Ok(Proposal::Actions(actions))
}

fn strip_fences(text: &str) -> &str {
    if !text.starts_with("```") {
        return text;
    }
    let body = match text.find('\n') {
        Some(i) => &text[i + 1..],
        None => text.trim_start_matches('`'),
    };
    body.trim_end().trim_end_matches("```").trim()
}
