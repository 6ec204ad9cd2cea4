//! Cypher fragment construction.
//!
//! Labels, relationship types, and property keys come from callers, so
//! they are validated as identifiers and backtick-quoted before being
//! spliced into query text. Property values always travel as parameters.
//! Property values are scalars or arrays of scalars, which is also what
//! the backend's property model supports.

use manifold_core::{Error, Result};
use neo4rs::BoltType;

/// Property stamped on every node and relationship this adapter writes.
pub const TENANT_KEY: &str = "tenant_user_id";

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_identifier(name: &str) -> Result<String> {
    if is_identifier(name) {
        Ok(format!("`{name}`"))
    } else {
        Err(Error::InvalidArgument(format!(
            "'{name}' is not a valid identifier"
        )))
    }
}

/// Render a label list as `:`A`:`B``.
pub fn label_fragment(labels: &[String]) -> Result<String> {
    if labels.is_empty() {
        return Err(Error::InvalidArgument("labels is required".to_string()));
    }
    let mut out = String::new();
    for label in labels {
        out.push(':');
        out.push_str(&quote_identifier(label)?);
    }
    Ok(out)
}

fn json_scalar_to_bolt(value: &serde_json::Value) -> Result<BoltType> {
    match value {
        serde_json::Value::Bool(b) => Ok(BoltType::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(BoltType::from(i))
            } else {
                Ok(BoltType::from(n.as_f64().unwrap_or_default()))
            }
        }
        serde_json::Value::String(s) => Ok(BoltType::from(s.as_str())),
        other => Err(Error::InvalidArgument(format!(
            "unsupported property value: {other}"
        ))),
    }
}

pub fn json_to_bolt(value: &serde_json::Value) -> Result<BoltType> {
    match value {
        serde_json::Value::Array(values) => {
            let converted: Vec<BoltType> = values
                .iter()
                .map(json_scalar_to_bolt)
                .collect::<Result<_>>()?;
            Ok(BoltType::from(converted))
        }
        other => json_scalar_to_bolt(other),
    }
}

/// Parse a JSON properties object into `(key, parameter-name, value)`
/// triples. Keys are validated; values become query parameters.
pub struct Properties {
    pub entries: Vec<(String, String, BoltType)>,
}

impl Properties {
    pub fn parse(properties_json: &str, param_prefix: &str) -> Result<Self> {
        let mut entries = Vec::new();
        if properties_json.is_empty() {
            return Ok(Self { entries });
        }
        let json: serde_json::Value = serde_json::from_str(properties_json)
            .map_err(|err| Error::InvalidArgument(format!("invalid properties: {err}")))?;
        let serde_json::Value::Object(map) = json else {
            return Err(Error::InvalidArgument(
                "properties must be a JSON object".to_string(),
            ));
        };
        for (index, (key, value)) in map.iter().enumerate() {
            if !is_identifier(key) {
                return Err(Error::InvalidArgument(format!(
                    "'{key}' is not a valid property key"
                )));
            }
            if key == TENANT_KEY {
                // The tenant property is adapter-owned.
                continue;
            }
            entries.push((
                key.clone(),
                format!("{param_prefix}{index}"),
                json_to_bolt(value)?,
            ));
        }
        Ok(Self { entries })
    }

    /// `alias.`k1` = $p0, alias.`k2` = $p1`
    pub fn set_fragment(&self, alias: &str) -> String {
        self.entries
            .iter()
            .map(|(key, param, _)| format!("{alias}.`{key}` = ${param}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `{`k1`: $p0, `k2`: $p1}`
    pub fn inline_fragment(&self) -> String {
        let inner = self
            .entries
            .iter()
            .map(|(key, param, _)| format!("`{key}`: ${param}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{inner}}}")
    }

    /// `alias.`k1` = $p0 AND alias.`k2` = $p1`
    pub fn where_fragment(&self, alias: &str) -> String {
        self.entries
            .iter()
            .map(|(key, param, _)| format!("{alias}.`{key}` = ${param}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(self, mut query: neo4rs::Query) -> neo4rs::Query {
        for (_, param, value) in self.entries {
            query = query.param(&param, value);
        }
        query
    }
}

/// Clamp a caller-supplied limit into `1..=max`, with a default for zero.
pub fn effective_limit(requested: i64, default: i64, max: i64) -> i64 {
    if requested <= 0 {
        default
    } else {
        requested.min(max)
    }
}

/// Relationship direction arrows around the `[r]` fragment.
pub fn direction_arrows(direction: &str) -> Result<(&'static str, &'static str)> {
    match direction {
        "" | "both" => Ok(("-", "-")),
        "out" => Ok(("-", "->")),
        "in" => Ok(("<-", "-")),
        other => Err(Error::InvalidArgument(format!(
            "unknown direction '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(is_identifier("Person"));
        assert!(is_identifier("owned_by_2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("drop table"));
        assert!(!is_identifier("a`b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn labels_render_quoted() {
        let fragment = label_fragment(&["Person".to_string(), "Admin".to_string()]).unwrap();
        assert_eq!(fragment, ":`Person`:`Admin`");
        assert!(label_fragment(&[]).is_err());
        assert!(label_fragment(&["bad label".to_string()]).is_err());
    }

    #[test]
    fn properties_become_parameters() {
        let props = Properties::parse(r#"{"name":"ada","age":36}"#, "p").unwrap();
        assert_eq!(props.entries.len(), 2);
        let set = props.set_fragment("n");
        assert!(set.contains("n.`name` = $p"));
        assert!(set.contains("n.`age` = $p"));
        let inline = props.inline_fragment();
        assert!(inline.starts_with('{') && inline.ends_with('}'));
    }

    #[test]
    fn tenant_key_cannot_be_overridden_by_callers() {
        let props =
            Properties::parse(&format!(r#"{{"{TENANT_KEY}":"mallory","x":1}}"#), "p").unwrap();
        assert_eq!(props.entries.len(), 1);
        assert_eq!(props.entries[0].0, "x");
    }

    #[test]
    fn nested_objects_are_rejected() {
        assert!(Properties::parse(r#"{"nested":{"a":1}}"#, "p").is_err());
        assert!(Properties::parse("[1,2]", "p").is_err());
        assert!(Properties::parse(r#"{"bad key":1}"#, "p").is_err());
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(effective_limit(0, 100, 1000), 100);
        assert_eq!(effective_limit(50, 100, 1000), 50);
        assert_eq!(effective_limit(10_000, 100, 1000), 1000);
    }

    #[test]
    fn directions_map_to_arrows() {
        assert_eq!(direction_arrows("out").unwrap(), ("-", "->"));
        assert_eq!(direction_arrows("in").unwrap(), ("<-", "-"));
        assert_eq!(direction_arrows("").unwrap(), ("-", "-"));
        assert!(direction_arrows("sideways").is_err());
    }
}
