//! Conversions between the wire's JSON payloads/filters and the backend's
//! typed value model, plus the owner-tag filter that enforces tenancy.

use manifold_core::{Error, Result};
use qdrant_client::qdrant::{self, value::Kind, Condition, Filter, PointId, Value};

/// Payload keys reserved for the tenant tag.
pub const OWNER_USER_KEY: &str = "owner_user_id";
pub const OWNER_ORG_KEY: &str = "owner_org_id";

pub fn json_to_value(json: &serde_json::Value) -> Value {
    let kind = match json {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntegerValue(i)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(values) => Kind::ListValue(qdrant::ListValue {
            values: values.iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(qdrant::Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        }),
    };
    Value { kind: Some(kind) }
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(*i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(fields)) => serde_json::Value::Object(
            fields
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// Parse a caller payload into the backend's value map with the owner tag
/// stamped in.
pub fn payload_map(
    payload_json: &str,
    user_id: &str,
    organization_id: &str,
) -> Result<std::collections::HashMap<String, Value>> {
    let mut map = std::collections::HashMap::new();
    if !payload_json.is_empty() {
        let json: serde_json::Value = serde_json::from_str(payload_json)
            .map_err(|err| Error::InvalidArgument(format!("invalid payload: {err}")))?;
        let serde_json::Value::Object(fields) = json else {
            return Err(Error::InvalidArgument(
                "payload must be a JSON object".to_string(),
            ));
        };
        for (key, value) in &fields {
            map.insert(key.clone(), json_to_value(value));
        }
    }
    map.insert(OWNER_USER_KEY.to_string(), Value::from(user_id));
    map.insert(OWNER_ORG_KEY.to_string(), Value::from(organization_id));
    Ok(map)
}

/// The same payload as the backend client's `Payload` wrapper.
pub fn payload_with_owner(
    payload_json: &str,
    user_id: &str,
    organization_id: &str,
) -> Result<qdrant_client::Payload> {
    let mut payload = qdrant_client::Payload::new();
    for (key, value) in payload_map(payload_json, user_id, organization_id)? {
        payload.insert(key, value);
    }
    Ok(payload)
}

/// Render a returned payload, hiding the owner tag from callers.
pub fn payload_to_json(payload: &std::collections::HashMap<String, Value>) -> String {
    let map: serde_json::Map<String, serde_json::Value> = payload
        .iter()
        .filter(|(key, _)| key.as_str() != OWNER_USER_KEY && key.as_str() != OWNER_ORG_KEY)
        .map(|(key, value)| (key.clone(), value_to_json(value)))
        .collect();
    if map.is_empty() {
        String::new()
    } else {
        serde_json::Value::Object(map).to_string()
    }
}

/// Whether a point's payload carries the caller's owner tag.
pub fn owned_by(payload: &std::collections::HashMap<String, Value>, user_id: &str) -> bool {
    matches!(
        payload.get(OWNER_USER_KEY).and_then(|v| v.kind.as_ref()),
        Some(Kind::StringValue(owner)) if owner == user_id
    )
}

/// Build the mandatory tenant filter, AND-ed with the caller's optional
/// equality filter. The filter schema is a flat JSON object of
/// field-to-value matches.
pub fn tenant_filter(user_id: &str, filter_json: &str) -> Result<Filter> {
    let mut conditions = vec![Condition::matches(OWNER_USER_KEY, user_id.to_string())];
    if !filter_json.is_empty() {
        let json: serde_json::Value = serde_json::from_str(filter_json)
            .map_err(|err| Error::InvalidArgument(format!("invalid filter: {err}")))?;
        let serde_json::Value::Object(map) = json else {
            return Err(Error::InvalidArgument(
                "filter must be a JSON object".to_string(),
            ));
        };
        for (field, value) in map {
            let condition = match value {
                serde_json::Value::String(s) => Condition::matches(field, s),
                serde_json::Value::Bool(b) => Condition::matches(field, b),
                serde_json::Value::Number(n) if n.is_i64() => {
                    Condition::matches(field, n.as_i64().unwrap_or_default())
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported filter value for '{field}': {other}"
                    )))
                }
            };
            conditions.push(condition);
        }
    }
    Ok(Filter::must(conditions))
}

/// A filter matching points the caller does NOT own, used to guard
/// collection deletion.
pub fn foreign_points_filter(user_id: &str) -> Filter {
    Filter {
        must_not: vec![Condition::matches(OWNER_USER_KEY, user_id.to_string())],
        ..Default::default()
    }
}

pub fn point_id_to_backend(id: &proto_manifold::vector::PointId) -> Result<PointId> {
    use proto_manifold::vector::point_id::Id;
    match &id.id {
        Some(Id::Num(n)) => Ok(PointId::from(*n)),
        Some(Id::Uuid(u)) => Ok(PointId::from(u.as_str())),
        None => Err(Error::InvalidArgument("point id is required".to_string())),
    }
}

pub fn point_id_to_proto(id: &PointId) -> proto_manifold::vector::PointId {
    use proto_manifold::vector::point_id::Id;
    use qdrant::point_id::PointIdOptions;
    let id = match &id.point_id_options {
        Some(PointIdOptions::Num(n)) => Some(Id::Num(*n)),
        Some(PointIdOptions::Uuid(u)) => Some(Id::Uuid(u.clone())),
        None => None,
    };
    proto_manifold::vector::PointId { id }
}

pub fn distance(name: &str) -> Result<qdrant::Distance> {
    match name {
        "" | "cosine" => Ok(qdrant::Distance::Cosine),
        "dot" => Ok(qdrant::Distance::Dot),
        "euclid" => Ok(qdrant::Distance::Euclid),
        other => Err(Error::InvalidArgument(format!(
            "unknown distance metric '{other}'"
        ))),
    }
}

pub fn distance_name(distance: qdrant::Distance) -> &'static str {
    match distance {
        qdrant::Distance::Cosine => "cosine",
        qdrant::Distance::Dot => "dot",
        qdrant::Distance::Euclid => "euclid",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_round_trip() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"title":"doc","rank":3,"score":0.5,"tags":["a","b"],"nested":{"ok":true}}"#,
        )
        .unwrap();
        let value = json_to_value(&json);
        assert_eq!(value_to_json(&value), json);
    }

    #[test]
    fn owner_tag_is_stamped_and_hidden() {
        let map = payload_map(r#"{"title":"doc"}"#, "alice", "acme").unwrap();
        assert!(owned_by(&map, "alice"));
        assert!(!owned_by(&map, "bob"));

        let rendered = payload_to_json(&map);
        assert!(rendered.contains("title"));
        assert!(!rendered.contains(OWNER_USER_KEY));
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(matches!(
            payload_map("[1,2]", "alice", ""),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            payload_map("not json", "alice", ""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn tenant_filter_always_carries_the_owner_condition() {
        let filter = tenant_filter("alice", "").unwrap();
        assert_eq!(filter.must.len(), 1);

        let filter = tenant_filter("alice", r#"{"category":"news","rank":3}"#).unwrap();
        assert_eq!(filter.must.len(), 3);
    }

    #[test]
    fn distances_round_trip() {
        assert_eq!(distance_name(distance("cosine").unwrap()), "cosine");
        assert_eq!(distance_name(distance("").unwrap()), "cosine");
        assert_eq!(distance_name(distance("euclid").unwrap()), "euclid");
        assert!(distance("manhattan-ish").is_err());
    }
}
