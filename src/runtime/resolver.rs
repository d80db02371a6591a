/// Variable resolver
///
/// Resolves `{{path}}` references inside node configuration against the run
/// scope. A string that is exactly one reference keeps the referenced value's
/// JSON type; references embedded in longer text are stringified. Paths are
/// dotted with optional indexes (`classify.labels[0]`) or a raw JSONPath when
/// they start with `$`.
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template pattern is valid"));

/// Resolve every templated string inside `value`, recursively
pub fn resolve_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

/// Resolve node configuration, leaving the listed keys untouched
pub fn resolve_config(config: &Value, scope: &Value, raw_keys: &[&str]) -> Value {
    match config {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let resolved = if raw_keys.contains(&k.as_str()) {
                        v.clone()
                    } else {
                        resolve_value(v, scope)
                    };
                    (k.clone(), resolved)
                })
                .collect(),
        ),
        other => resolve_value(other, scope),
    }
}

/// Resolve one string
///
/// A missing reference becomes `null` when it is the whole string and an
/// empty string when interpolated.
pub fn resolve_str(template: &str, scope: &Value) -> Value {
    if !template.contains("{{") {
        return Value::String(template.to_string());
    }

    if let Some(caps) = TEMPLATE.captures(template) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(template.len()) {
            return lookup(&caps[1], scope).unwrap_or(Value::Null);
        }
    }

    let rendered = TEMPLATE.replace_all(template, |caps: &regex::Captures| {
        match lookup(&caps[1], scope) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        }
    });
    Value::String(rendered.into_owned())
}

/// Resolve a path against the scope
pub fn lookup(path: &str, scope: &Value) -> Option<Value> {
    let path = path.trim();
    let json_path = if path.starts_with('$') {
        path.to_string()
    } else {
        to_json_path(path)?
    };

    match jsonpath_lib::select(scope, &json_path) {
        Ok(found) => found.first().map(|v| (*v).clone()),
        Err(e) => {
            tracing::debug!("⚠️ Unresolvable reference '{}': {:?}", path, e);
            None
        }
    }
}

/// `a.b-c[0].d` -> `$['a']['b-c'][0]['d']`
fn to_json_path(path: &str) -> Option<String> {
    let mut out = String::from("$");
    for segment in path.split('.') {
        let (name, indexes) = match segment.find('[') {
            Some(pos) => segment.split_at(pos),
            None => (segment, ""),
        };
        if name.is_empty() && indexes.is_empty() {
            return None;
        }
        if !name.is_empty() {
            out.push_str(&format!("['{}']", name.replace('\'', "\\'")));
        }
        out.push_str(indexes);
    }
    Some(out)
}
