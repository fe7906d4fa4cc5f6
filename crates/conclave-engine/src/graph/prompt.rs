use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::state::RunState;

/// Injected for `{{COLLABORATION_GUIDE}}`.
pub const COLLABORATION_GUIDE: &str = r#"## Collaboration rules

You are one of several agents working on a shared task, taking turns.
Files you need to share with the other agents go in the shared collab
directory of your workspace; keep names stable so others can find them.

Finish every reply with a single JSON object describing your decisions:

```json
{"content": "short summary of what you did", "decisions": {"done": false}}
```

`decisions` is required and must be an object of booleans, numbers or
strings. Use exactly the decision names your instructions ask for."#;

/// `{% if last_agent_name == "x" %}...{% else %}...{% endif %}`, else optional.
fn conditional_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)\{%\s*if\s+(?:last_agent_name|lastAgentName)\s*==\s*["']([\w-]+)["']\s*%\}(.*?)(?:\{%\s*else\s*%\}(.*?))?\{%\s*endif\s*%\}"#,
        )
        .expect("conditional block regex is valid")
    })
}

fn token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("token regex is valid"))
}

/// Render a state's prompt template against the current run state.
///
/// Conditional blocks are resolved first, then `{{...}}` tokens, so blocks
/// may contain tokens. Tokens are substituted in one pass: text inserted for a
/// token is never expanded again, and unknown tokens are left as written.
/// Previous-step tokens render empty on the first step.
pub fn render_prompt(template: &str, state: &RunState) -> String {
    let last = state.last_response();
    let last_agent = last.map(|r| r.agent.as_str()).unwrap_or("");

    let prompt = conditional_block().replace_all(template, |caps: &Captures<'_>| {
        let wanted = caps.get(1).map_or("", |m| m.as_str());
        let branch = if !last_agent.is_empty() && last_agent == wanted {
            caps.get(2)
        } else {
            caps.get(3)
        };
        branch.map_or(String::new(), |m| m.as_str().to_string())
    });

    let (last_content, last_decisions) = match last {
        Some(r) => (
            r.response.content.clone(),
            serde_json::to_string_pretty(&r.response.decisions).unwrap_or_default(),
        ),
        None => (String::new(), String::new()),
    };

    token()
        .replace_all(&prompt, |caps: &Captures<'_>| match &caps[1] {
            "initial_message" => state.initial_message.clone(),
            "turn_count" => state.total_turns.to_string(),
            "workflow_name" => state.workflow_name.clone(),
            "COLLABORATION_GUIDE" => COLLABORATION_GUIDE.trim().to_string(),
            "last_agent_name" => last_agent.to_string(),
            "last_agent_content" => last_content.clone(),
            "last_agent_decisions" => last_decisions.clone(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}
