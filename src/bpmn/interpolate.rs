use crate::engine::types::{Variable, Variables};

/// Interpolate `${name}` and `${name.nested.key}` patterns in a string.
pub fn interpolate_vars(template: &str, vars: &Variables) -> String {
    let mut result = template.to_string();
    let mut start = 0;

    loop {
        let open = match result[start..].find("${") {
            Some(pos) => start + pos,
            None => break,
        };

        let close = match result[open..].find('}') {
            Some(pos) => open + pos,
            None => break,
        };

        let path = result[open + 2..close].trim().to_string();
        let value = resolve_path(&path, vars);

        result.replace_range(open..=close, &value);
        start = open + value.len();
    }

    result
}

/// Expand candidate expressions into a de-duplicated user list.
///
/// Each entry is interpolated and then split on commas, so both
/// `"alice,bob"` and `"${approvers}"` (holding `"alice,bob"`) work.
pub fn expand_users(exprs: &[String], vars: &Variables) -> Vec<String> {
    let mut users: Vec<String> = Vec::new();
    for expr in exprs {
        for user in interpolate_vars(expr, vars).split(',') {
            let user = user.trim();
            if !user.is_empty() && !users.iter().any(|u| u == user) {
                users.push(user.to_string());
            }
        }
    }
    users
}

/// Resolve a dotted path (e.g., "user.email") from the variables.
fn resolve_path(path: &str, vars: &Variables) -> String {
    let mut parts = path.split('.');
    let first = match parts.next().and_then(|head| vars.get(head)) {
        Some(v) => v,
        None => return String::new(),
    };

    let mut rest = parts.peekable();
    if rest.peek().is_none() {
        return first.to_text();
    }

    let Variable::Structured(mut current) = first.clone() else {
        return String::new();
    };
    for part in rest {
        current = match current.get(part) {
            Some(v) => v.clone(),
            None => return String::new(),
        };
    }

    match current {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
