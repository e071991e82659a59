//! Template variable resolution
//!
//! Step functions and params may reference `{{name}}` variables. Resolution
//! happens once, when step executions are created; the resolved values are
//! stored on the step record. Lookup precedence:
//!
//! 1. Special variables: `_batch_id`, `_batch_start_time`
//! 2. Worker-output variables accumulated on the member
//! 3. Data columns from the member's latest snapshot
//!
//! An unresolved name fails the step before dispatch. The scanner is a
//! hand-rolled two-character matcher rather than a regex so precedence and
//! the offending variable name stay explicit.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Raised when a `{{name}}` reference cannot be resolved
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved variable {0}")]
pub struct TemplateError(pub String);

/// Variable sources for one resolution pass
#[derive(Debug, Clone, Default)]
pub struct TemplateContext<'a> {
    batch_id: Option<i64>,
    batch_start_time: Option<DateTime<Utc>>,
    worker_data: Option<&'a Map<String, Value>>,
    member_data: Option<&'a Map<String, Value>>,
}

impl<'a> TemplateContext<'a> {
    /// Context for a member step: all three variable sources
    pub fn for_member(
        batch_id: i64,
        batch_start_time: Option<DateTime<Utc>>,
        member_data: &'a Map<String, Value>,
        worker_data: &'a Map<String, Value>,
    ) -> Self {
        Self {
            batch_id: Some(batch_id),
            batch_start_time,
            worker_data: Some(worker_data),
            member_data: Some(member_data),
        }
    }

    /// Context for an init step: special variables only
    pub fn for_init(batch_id: i64, batch_start_time: Option<DateTime<Utc>>) -> Self {
        Self {
            batch_id: Some(batch_id),
            batch_start_time,
            worker_data: None,
            member_data: None,
        }
    }

    /// Resolve one variable name through the lookup chain
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "_batch_id" => return self.batch_id.map(|id| id.to_string()),
            "_batch_start_time" => {
                return self
                    .batch_start_time
                    .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            }
            _ => {}
        }
        if let Some(found) = self.worker_data.and_then(|m| get_ci(m, name)) {
            return Some(found);
        }
        self.member_data.and_then(|m| get_ci(m, name))
    }

    /// Resolve every `{{name}}` in a string
    pub fn resolve_str(&self, input: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    let value = self
                        .lookup(name)
                        .ok_or_else(|| TemplateError(name.to_string()))?;
                    out.push_str(&value);
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated braces pass through as literal text
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Resolve templates in every string value of a JSON tree
    pub fn resolve_value(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => Ok(Value::String(self.resolve_str(s)?)),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a full parameter map
    pub fn resolve_params(
        &self,
        params: &Map<String, Value>,
    ) -> Result<Map<String, Value>, TemplateError> {
        let mut out = Map::with_capacity(params.len());
        for (k, v) in params {
            out.insert(k.clone(), self.resolve_value(v)?);
        }
        Ok(out)
    }
}

/// Case-insensitive map lookup; JSON scalars render without quotes
fn get_ci(map: &Map<String, Value>, name: &str) -> Option<String> {
    let value = map
        .get(name)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v))?;
    Some(render(value))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn resolves_member_data() {
        let data = obj(json!({"email": "a@x", "region": "emea"}));
        let worker = Map::new();
        let ctx = TemplateContext::for_member(7, None, &data, &worker);
        assert_eq!(ctx.resolve_str("mailto:{{email}}").unwrap(), "mailto:a@x");
    }

    #[test]
    fn worker_data_shadows_member_data() {
        let data = obj(json!({"target": "from-query"}));
        let worker = obj(json!({"target": "from-worker"}));
        let ctx = TemplateContext::for_member(7, None, &data, &worker);
        assert_eq!(ctx.resolve_str("{{target}}").unwrap(), "from-worker");
    }

    #[test]
    fn special_vars_win_over_everything() {
        let data = obj(json!({"_batch_id": "spoofed"}));
        let worker = Map::new();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let ctx = TemplateContext::for_member(42, Some(start), &data, &worker);
        assert_eq!(ctx.resolve_str("{{_batch_id}}").unwrap(), "42");
        assert_eq!(
            ctx.resolve_str("{{_batch_start_time}}").unwrap(),
            "2026-03-01T12:00:00Z"
        );
    }

    #[test]
    fn unresolved_name_carries_the_variable() {
        let ctx = TemplateContext::for_init(1, None);
        let err = ctx.resolve_str("{{missing}}").unwrap_err();
        assert_eq!(err, TemplateError("missing".into()));
    }

    #[test]
    fn init_context_has_no_member_vars() {
        let ctx = TemplateContext::for_init(1, None);
        assert!(ctx.resolve_str("{{email}}").is_err());
        assert_eq!(ctx.resolve_str("{{_batch_id}}").unwrap(), "1");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let data = obj(json!({"Email": "a@x"}));
        let worker = Map::new();
        let ctx = TemplateContext::for_member(1, None, &data, &worker);
        assert_eq!(ctx.resolve_str("{{email}}").unwrap(), "a@x");
    }

    #[test]
    fn non_string_values_render_bare() {
        let data = obj(json!({"count": 3, "flag": true, "gone": null}));
        let worker = Map::new();
        let ctx = TemplateContext::for_member(1, None, &data, &worker);
        assert_eq!(ctx.resolve_str("{{count}}/{{flag}}/{{gone}}").unwrap(), "3/true/");
    }

    #[test]
    fn unterminated_braces_stay_literal() {
        let ctx = TemplateContext::for_init(1, None);
        assert_eq!(ctx.resolve_str("a {{oops").unwrap(), "a {{oops");
    }

    #[test]
    fn resolves_nested_params() {
        let data = obj(json!({"email": "a@x"}));
        let worker = Map::new();
        let ctx = TemplateContext::for_member(9, None, &data, &worker);
        let params = obj(json!({
            "msg": "{{email}}",
            "meta": {"batch": "{{_batch_id}}", "keep": 5},
            "list": ["{{email}}", 1]
        }));
        let resolved = ctx.resolve_params(&params).unwrap();
        assert_eq!(
            Value::Object(resolved),
            json!({
                "msg": "a@x",
                "meta": {"batch": "9", "keep": 5},
                "list": ["a@x", 1]
            })
        );
    }
}
