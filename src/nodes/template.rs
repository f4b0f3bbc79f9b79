//! `{{variable}}` placeholder rendering for email content.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

use super::types::NodeContext;

/// Matches `{{name}}`, `{{ name }}` and dotted paths like `{{ lead.company }}`.
fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex"))
}

/// Convert a JSON value to a string for template substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

/// Substitute placeholders with execution variables.
///
/// Placeholders naming a missing variable are left in place so the
/// problem is visible in the delivered text rather than silently blank.
pub fn render_template(template: &str, ctx: &NodeContext) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex_lite::Captures| {
            match ctx.get_variable(&caps[1]) {
                Some(value) => value_to_string(value),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ctx(vars: Value) -> NodeContext {
        NodeContext::new("wf", "lead-1", Utc::now())
            .with_variables(vars.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_render_simple_and_spaced_placeholders() {
        let ctx = ctx(json!({"name": "Ada", "lead": {"company": "Acme"}, "score": 7}));
        let out = render_template("Hi {{name}} from {{ lead.company }} ({{score}})", &ctx);
        assert_eq!(out, "Hi Ada from Acme (7)");
    }

    #[test]
    fn test_missing_variable_left_literal() {
        let ctx = ctx(json!({"name": "Ada"}));
        let out = render_template("Hi {{ name }}, your rep is {{rep}}", &ctx);
        assert_eq!(out, "Hi Ada, your rep is {{rep}}");
    }

    #[test]
    fn test_plain_text_untouched() {
        let ctx = ctx(json!({}));
        assert_eq!(render_template("No placeholders {here}", &ctx), "No placeholders {here}");
    }
}
