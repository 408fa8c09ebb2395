//! Helper functions available to plan templates.
//!
//! The names `b64enc`, `b64dec`, `marshalJSON`, `unmarshalJSON`, `quote` and `squote`
//! are relied upon by plan authors. Each is registered both as a filter
//! (`{{ value | b64enc }}`) and as a function (`{{ b64enc(value) }}`).

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};

/// A template environment with every helper registered
pub fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.set_keep_trailing_newline(true);

    env.add_filter("b64enc", b64enc);
    env.add_function("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
    env.add_function("b64dec", b64dec);
    env.add_filter("marshalJSON", marshal_json);
    env.add_function("marshalJSON", marshal_json);
    env.add_filter("unmarshalJSON", unmarshal_json);
    env.add_function("unmarshalJSON", unmarshal_json);
    env.add_filter("quote", quote);
    env.add_function("quote", quote);
    env.add_filter("squote", squote);
    env.add_function("squote", squote);

    env.add_filter("toYaml", to_yaml);
    env.add_filter("indent", indent);
    env.add_filter("nindent", nindent);
    env
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

/// Strings are used verbatim, anything else in its display form
fn stringify(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None if value.is_undefined() || value.is_none() => String::new(),
        None => value.to_string(),
    }
}

pub fn b64enc(value: Value) -> String {
    STANDARD.encode(stringify(&value).as_bytes())
}

pub fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| invalid(format!("b64dec: {e}")))?;
    String::from_utf8(bytes).map_err(|e| invalid(format!("b64dec produced invalid utf-8: {e}")))
}

/// Serializes a value, typically a map, to compact JSON
pub fn marshal_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("marshalJSON: {e}")))
}

/// Parses a JSON object
pub fn unmarshal_json(value: &str) -> Result<Value, Error> {
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(parsed @ serde_json::Value::Object(_)) => Ok(Value::from_serialize(&parsed)),
        Ok(_) => Err(invalid("unmarshalJSON: expected a JSON object".into())),
        Err(e) => Err(invalid(format!("unmarshalJSON: {e}"))),
    }
}

/// Double quotes, escaping quotes, backslashes and control characters
pub fn quote(value: Value) -> String {
    let s = stringify(&value);
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Single quotes without any escaping
pub fn squote(value: Value) -> String {
    format!("'{}'", stringify(&value))
}

pub fn to_yaml(value: Value) -> Result<String, Error> {
    serde_yaml::to_string(&value)
        .map(|s| s.trim_end().to_string())
        .map_err(|e| invalid(format!("toYaml: {e}")))
}

/// Indents every line, including the first
pub fn indent(value: String, width: usize) -> String {
    let pad = " ".repeat(width);
    value
        .lines()
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn nindent(value: String, width: usize) -> String {
    format!("\n{}", indent(value, width))
}
