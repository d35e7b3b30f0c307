#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::{Map, Value};

pub const RULING_SYSTEM_MESSAGE: &str = "You are a careful courtroom assistant for minor cases. \
You analyze facts, summarize applicable rules, propose a fair outcome within simple bounds, \
explain the reasoning in plain language, and flag risks. You avoid legal advice beyond this \
constrained demo. Keep responses concise and structured.";

pub const BIAS_SYSTEM_MESSAGE: &str =
    "You are auditing for fairness risks. Read the ruling and suggest potential bias or unfairness.";

const RULING_OUTPUT_INSTRUCTION: &str = "Output JSON with exactly these keys: \
verdict (one of: dismissed, reduced, upheld), rationale (4\u{2013}8 sentences), \
citations (array of short strings or empty), risk_flags (array of short strings or empty).";

const BIAS_OUTPUT_INSTRUCTION: &str =
    "Return JSON: { \"bias_score\": number between 0 and 1, \"notes\": [short strings] }.";

/// A two-part chat prompt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CaseFacts<'a> {
    pub title: &'a str,
    pub narrative: &'a str,
    pub locale: &'a str,
}

/// Build the ruling prompt for a case.
///
/// Null entries of `extra` are skipped; the rest are rendered one per line
/// as `key: value` in map order.
#[must_use]
pub fn build_ruling_prompt(facts: CaseFacts<'_>, extra: Option<&Map<String, Value>>) -> Prompt {
    let lines = extra.map(render_extra_lines).unwrap_or_default();
    let context = if lines.is_empty() {
        String::new()
    } else {
        format!("\nAdditional context:\n{}\n", lines.join("\n"))
    };
    let user = format!(
        "Jurisdiction hint: {}\n\nCase title: {}\n\nCase narrative (user words):\n{}\n{context}\n{RULING_OUTPUT_INSTRUCTION}",
        facts.locale, facts.title, facts.narrative
    );

    Prompt {
        system: RULING_SYSTEM_MESSAGE.to_string(),
        user: user.trim().to_string(),
    }
}

/// Build the fairness-audit prompt around a ruling's structured output.
#[must_use]
pub fn build_bias_prompt(ruling_json: &Value) -> Prompt {
    let user = format!("RULING JSON:\n{ruling_json}\n\n{BIAS_OUTPUT_INSTRUCTION}");
    Prompt {
        system: BIAS_SYSTEM_MESSAGE.to_string(),
        user: user.trim().to_string(),
    }
}

fn render_extra_lines(extra: &Map<String, Value>) -> Vec<String> {
    extra
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}: {text}"),
            other => format!("{key}: {other}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        build_bias_prompt, build_ruling_prompt, CaseFacts, BIAS_SYSTEM_MESSAGE,
        RULING_OUTPUT_INSTRUCTION, RULING_SYSTEM_MESSAGE,
    };
    use serde_json::{json, Map, Value};

    fn facts() -> CaseFacts<'static> {
        CaseFacts {
            title: "Stop sign",
            narrative: "I stopped but the officer said I rolled through the stop sign.",
            locale: "California",
        }
    }

    fn extra(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn ruling_prompt_is_deterministic() {
        let context = extra(json!({"case_id": "01J0000000000000000000000"}));
        let first = build_ruling_prompt(facts(), Some(&context));
        let second = build_ruling_prompt(facts(), Some(&context));
        assert_eq!(first, second);
    }

    #[test]
    fn ruling_prompt_interpolates_case_fields_in_order() {
        let prompt = build_ruling_prompt(facts(), None);
        assert_eq!(prompt.system, RULING_SYSTEM_MESSAGE);
        assert!(prompt.user.starts_with("Jurisdiction hint: California\n\nCase title: Stop sign"));

        let narrative_at = prompt.user.find("Case narrative (user words):\nI stopped");
        let instruction_at = prompt.user.find("Output JSON with exactly these keys");
        assert!(narrative_at.is_some());
        assert!(instruction_at.is_some());
        assert!(narrative_at < instruction_at);
        for key in ["verdict", "rationale", "citations", "risk_flags"] {
            assert!(prompt.user.contains(key), "missing key {key}");
        }
        assert!(prompt.user.contains("dismissed, reduced, upheld"));
        assert!(!prompt.user.contains("Additional context"));
    }

    #[test]
    fn extra_context_skips_null_values() {
        let context = extra(json!({
            "case_id": "abc",
            "prior_offenses": 0,
            "witness": null,
        }));
        let prompt = build_ruling_prompt(facts(), Some(&context));
        assert!(prompt
            .user
            .contains("Additional context:\ncase_id: abc\nprior_offenses: 0\n"));
        assert!(!prompt.user.contains("witness"));
    }

    #[test]
    fn context_section_sits_between_narrative_and_instruction() {
        let context = extra(json!({"case_id": "abc"}));
        let prompt = build_ruling_prompt(facts(), Some(&context));
        let expected_middle = format!(
            "{}\n\nAdditional context:\ncase_id: abc\n\n{RULING_OUTPUT_INSTRUCTION}",
            facts().narrative
        );
        assert!(prompt.user.ends_with(&expected_middle));

        let bare = build_ruling_prompt(facts(), None);
        let expected_tail = format!("{}\n\n{RULING_OUTPUT_INSTRUCTION}", facts().narrative);
        assert!(bare.user.ends_with(&expected_tail));
    }

    #[test]
    fn all_null_extra_context_adds_no_section() {
        let context = extra(json!({"witness": null}));
        let prompt = build_ruling_prompt(facts(), Some(&context));
        assert_eq!(prompt, build_ruling_prompt(facts(), None));
    }

    #[test]
    fn user_text_is_trimmed() {
        let padded = CaseFacts {
            title: "Parking",
            narrative: "  meter expired  \n\n",
            locale: "  Oregon",
        };
        let prompt = build_ruling_prompt(padded, None);
        assert_eq!(prompt.user, prompt.user.trim());
        assert!(prompt.user.starts_with("Jurisdiction hint:   Oregon"));
    }

    #[test]
    fn bias_prompt_embeds_ruling_json() {
        let ruling = json!({
            "verdict": "reduced",
            "rationale": "Cooperation shown.",
            "citations": ["Demo Statute 1.2"],
            "risk_flags": [],
        });
        let prompt = build_bias_prompt(&ruling);
        assert_eq!(prompt.system, BIAS_SYSTEM_MESSAGE);
        assert!(prompt.user.starts_with("RULING JSON:\n{\"verdict\":\"reduced\""));
        assert!(prompt.user.contains("\"bias_score\""));
        assert!(prompt.user.contains("\"notes\""));
        assert_eq!(build_bias_prompt(&ruling), prompt);
    }
}
