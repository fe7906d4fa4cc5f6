//! Workflow YAML fixtures.

/// Coder and reviewer loop until the reviewer approves.
pub const REVIEW_LOOP: &str = r#"
name: review-loop
description: Code, then review until approved
max_turns: 6
agents:
  - name: coder
    type: coder
  - name: reviewer
    type: ask
    role: Reviews the change
states:
  - name: code
    agent: coder
    start: true
    prompt: |
      {{initial_message}}
      {% if last_agent_name == "reviewer" %}Address: {{last_agent_content}}{% endif %}
    transitions:
      - condition: ready
        to: review
      - to: code
  - name: review
    agent: reviewer
    prompt: "Review the work for: {{initial_message}}"
    transitions:
      - condition: approved == true
        to: END
      - to: code
"#;

/// One state routed by a workflow extension predicate.
pub const GATED: &str = r#"
name: gated
initial_message: Do the work
agents:
  - name: worker
states:
  - name: work
    agent: worker
    prompt: "{{initial_message}}"
    transitions:
      - condition: gate_open
        to: END
      - to: work
"#;

/// Negotiation with an exit condition on the agreed price.
pub const NEGOTIATION: &str = r#"
name: negotiation
max_turns: 8
agents:
  - name: supplier
  - name: client
states:
  - name: offer
    agent: supplier
    prompt: "{{initial_message}} {{last_agent_content}}"
    transitions:
      - to: counter
  - name: counter
    agent: client
    prompt: "Offer from {{last_agent_name}}: {{last_agent_content}}"
    transitions:
      - condition: accepted
        to: END
      - to: offer
exit_conditions:
  - condition: price <= 50 && turn_count_supplier_counter >= 2
"#;
