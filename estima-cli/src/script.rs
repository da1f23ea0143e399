//! JSON-lines edit scripts.
//!
//! Each non-empty line is one of:
//! - a `PricingRequest` object: the user edited the configuration
//! - `{"prefetch": <PricingRequest>}`: warm the cache (hover)
//! - `{"catalog_version": "..."}`: the catalog changed
//!
//! Lines starting with `#` are comments.

use estima_core::PricingRequest;
use serde::Deserialize;

use crate::error::CliError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    Catalog { catalog_version: String },
    Prefetch { prefetch: PricingRequest },
    Edit(PricingRequest),
}

/// A step and its 1-based line number.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptLine {
    pub line: usize,
    pub step: ScriptStep,
}

pub fn parse_script(contents: &str) -> Result<Vec<ScriptLine>, CliError> {
    contents
        .lines()
        .enumerate()
        .map(|(index, text)| (index + 1, text.trim()))
        .filter(|(_, text)| !text.is_empty() && !text.starts_with('#'))
        .map(|(line, text)| {
            serde_json::from_str(text)
                .map(|step| ScriptLine { line, step })
                .map_err(|e| CliError::Script {
                    line,
                    reason: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"{"part_id":"p","process":"cnc_milling","material_id":"m","machine_id":"x","quantity":10}"#;

    #[test]
    fn test_parse_all_step_kinds() {
        let script = format!(
            "# session\n{REQUEST}\n\n{{\"prefetch\":{REQUEST}}}\n{{\"catalog_version\":\"v2\"}}\n"
        );
        let lines = parse_script(&script).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].line, 2);
        assert!(matches!(&lines[0].step, ScriptStep::Edit(r) if r.quantity == 10));
        assert!(matches!(&lines[1].step, ScriptStep::Prefetch { .. }));
        assert_eq!(
            lines[2].step,
            ScriptStep::Catalog {
                catalog_version: "v2".to_string()
            }
        );
    }

    #[test]
    fn test_demo_script_parses() {
        let lines = parse_script(include_str!("../demos/bracket_session.jsonl")).unwrap();
        assert_eq!(lines.len(), 9);
    }

    #[test]
    fn test_bad_line_reports_number() {
        let err = parse_script(&format!("{REQUEST}\nnot json\n")).unwrap_err();
        assert!(matches!(err, CliError::Script { line: 2, .. }));
    }
}
