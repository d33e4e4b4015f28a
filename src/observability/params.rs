use std::fmt::{self, Display, Formatter};

use crate::engine::types::Value;

/// Loggable shape of bound parameters: how many, and of which kind
///
/// `3 params [int, text, null]`. Values never appear.
pub struct ParamSummary<'a>(pub &'a [Value]);

impl Display for ParamSummary<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.0.iter().map(kind).collect();
        write!(f, "{} params [{}]", self.0.len(), kinds.join(", "))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Text(_) => "text",
        Value::Json(_) => "json",
        Value::Array(_) => "array",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_summary_hides_values() {
        let params = vec![Value::Int(7), Value::from("alice@example.com"), Value::Null];
        let rendered = ParamSummary(&params).to_string();
        assert_eq!(rendered, "3 params [int, text, null]");
        assert!(!rendered.contains("alice"));
    }

    #[test]
    fn param_summary_of_nothing() {
        assert_eq!(ParamSummary(&[]).to_string(), "0 params []");
    }
}
