//! Query preparation
//!
//! Parameters reach ClickHouse two ways. They are formatted into the query
//! text (`%(name)s` first, then `{name}`), which some views still rely on, and
//! they are also sent as `param_<name>` request parameters so ClickHouse can
//! bind typed `{name:Type}` placeholders natively. Both paths always run.

use crate::encode::Value;
use ferrule_common::{FerruleError, Result};
use std::collections::HashMap;

/// Named query parameters
pub type QueryParameters = HashMap<String, Value>;

/// Prefix ClickHouse recognizes for out-of-band query parameters
pub const PARAM_PREFIX: &str = "param_";

/// Format `parameters` into `query`.
///
/// Returns the query unchanged when there are no parameters.
pub fn prepare_query(query: &str, parameters: Option<&QueryParameters>) -> Result<String> {
    let parameters = match parameters {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(query.to_string()),
    };

    let encoded: HashMap<&str, String> = parameters
        .iter()
        .map(|(name, value)| (name.as_str(), value.encode_to_string()))
        .collect();

    let query = format_percent(query, &encoded)?;
    format_braces(&query, &encoded)
}

/// Out-of-band `param_<name>` pairs for every parameter whose name occurs in
/// the original query text.
pub fn out_of_band_parameters(
    query: &str,
    parameters: Option<&QueryParameters>,
) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = parameters
        .into_iter()
        .flatten()
        .filter(|(name, _)| query.contains(name.as_str()))
        .map(|(name, value)| (format!("{}{}", PARAM_PREFIX, name), value.to_param_string()))
        .collect();
    params.sort();
    params
}

/// `%(name)s` substitution. `%%` is a literal percent sign; any other `%` is an error.
fn format_percent(query: &str, values: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('%') {
            out.push('%');
            rest = after;
        } else if let Some(named) = tail.strip_prefix('(') {
            let close = named.find(')').ok_or_else(|| {
                FerruleError::Format(format!("unterminated placeholder at byte {}", pos))
            })?;
            let name = &named[..close];
            let after = named[close + 1..].strip_prefix('s').ok_or_else(|| {
                FerruleError::Format(format!("unsupported conversion for %({})", name))
            })?;
            let value = values
                .get(name)
                .ok_or_else(|| FerruleError::Format(format!("missing parameter '{}'", name)))?;
            out.push_str(value);
            rest = after;
        } else {
            return Err(FerruleError::Format(format!(
                "stray '%' at byte {}; use '%%' for a literal percent sign",
                pos
            )));
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// `{name}` substitution. `{{`/`}}` are literal braces. `{name:Type}` is a
/// ClickHouse server-side placeholder and is passed through untouched.
fn format_braces(query: &str, values: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let body_start = pos + 1;
                let close = query[body_start..].find('}').ok_or_else(|| {
                    FerruleError::Format(format!("unmatched '{{' at byte {}", pos))
                })?;
                let body = &query[body_start..body_start + close];

                let (name, typed) = match body.split_once(':') {
                    Some((name, _)) => (name, true),
                    None => (body, false),
                };
                if !is_identifier(name) {
                    return Err(FerruleError::Format(format!(
                        "invalid placeholder '{{{}}}' at byte {}",
                        body, pos
                    )));
                }

                if typed {
                    out.push('{');
                    out.push_str(body);
                    out.push('}');
                } else {
                    let value = values.get(name).ok_or_else(|| {
                        FerruleError::Format(format!("missing parameter '{}'", name))
                    })?;
                    out.push_str(value);
                }

                while let Some((idx, _)) = chars.peek() {
                    if *idx > body_start + close {
                        break;
                    }
                    chars.next();
                }
            }
            '}' => {
                return Err(FerruleError::Format(format!(
                    "single '}}' at byte {}",
                    pos
                )));
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> QueryParameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_parameters_returns_query_unchanged() {
        let query = "SELECT '%' AS pct, '{}' AS braces";
        assert_eq!(prepare_query(query, None).unwrap(), query);
        assert_eq!(prepare_query(query, Some(&QueryParameters::new())).unwrap(), query);
    }

    #[test]
    fn test_percent_substitution() {
        let p = params(&[("team_id", Value::from(2)), ("name", Value::from("o'k"))]);
        let query = prepare_query(
            "SELECT * FROM events WHERE team_id = %(team_id)s AND name = %(name)s",
            Some(&p),
        )
        .unwrap();
        assert_eq!(
            query,
            r"SELECT * FROM events WHERE team_id = 2 AND name = 'o\'k'"
        );
    }

    #[test]
    fn test_brace_substitution() {
        let p = params(&[("table", Value::from("events")), ("limit", Value::from(10))]);
        let query = prepare_query("SELECT * FROM {table} LIMIT {limit}", Some(&p)).unwrap();
        assert_eq!(query, "SELECT * FROM 'events' LIMIT 10");
    }

    #[test]
    fn test_both_styles_in_one_query() {
        let p = params(&[("a", Value::from(1)), ("b", Value::from(2))]);
        let query = prepare_query("SELECT %(a)s, {b}", Some(&p)).unwrap();
        assert_eq!(query, "SELECT 1, 2");
    }

    #[test]
    fn test_escapes() {
        let p = params(&[("x", Value::from(1))]);
        let query = prepare_query("SELECT '100%%', '{{}}', {x}", Some(&p)).unwrap();
        assert_eq!(query, "SELECT '100%', '{}', 1");
    }

    #[test]
    fn test_typed_placeholders_pass_through() {
        let p = params(&[("team_id", Value::from(2))]);
        let query = prepare_query("SELECT {team_id:Int64}, {team_id}", Some(&p)).unwrap();
        assert_eq!(query, "SELECT {team_id:Int64}, 2");
    }

    #[test]
    fn test_stray_percent_is_an_error() {
        let p = params(&[("x", Value::from(1))]);
        let err = prepare_query("SELECT 5 % 2, {x}", Some(&p)).unwrap_err();
        assert_eq!(err.code(), "FORMAT_ERROR");
    }

    #[test]
    fn test_missing_parameter_is_an_error() {
        let p = params(&[("x", Value::from(1))]);
        assert!(prepare_query("SELECT %(y)s", Some(&p)).is_err());
        assert!(prepare_query("SELECT {y}", Some(&p)).is_err());
    }

    #[test]
    fn test_unbalanced_braces_are_an_error() {
        let p = params(&[("x", Value::from(1))]);
        assert!(prepare_query("SELECT {x", Some(&p)).is_err());
        assert!(prepare_query("SELECT x}", Some(&p)).is_err());
        assert!(prepare_query("SELECT {}", Some(&p)).is_err());
    }

    #[test]
    fn test_multibyte_text_is_preserved() {
        let p = params(&[("x", Value::from("é"))]);
        let query = prepare_query("SELECT 'ü', {x}, '✓'", Some(&p)).unwrap();
        assert_eq!(query, "SELECT 'ü', 'é', '✓'");
    }

    #[test]
    fn test_out_of_band_parameters_only_for_names_in_query() {
        let p = params(&[
            ("team_id", Value::from(2)),
            ("unused", Value::from("x")),
            ("name", Value::from("o'k")),
        ]);
        let oob = out_of_band_parameters("SELECT {team_id:Int64}, %(name)s", Some(&p));
        assert_eq!(
            oob,
            vec![
                ("param_name".to_string(), "o'k".to_string()),
                ("param_team_id".to_string(), "2".to_string()),
            ]
        );
        assert!(out_of_band_parameters("SELECT 1", None).is_empty());
    }
}
