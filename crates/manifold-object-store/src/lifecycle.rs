//! Translation between the wire's JSON lifecycle rules and the backend's
//! typed lifecycle configuration.
//!
//! The portable schema is deliberately small: callers manage expiry rules
//! per prefix, which is what the backends in this deployment support
//! uniformly.

use aws_sdk_s3::types::{
    ExpirationStatus, LifecycleExpiration, LifecycleRule, LifecycleRuleFilter,
};
use manifold_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub prefix: String,
    pub expiration_days: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub fn parse(lifecycle_json: &str) -> Result<Vec<LifecycleRule>> {
    let rules: Vec<Rule> = serde_json::from_str(lifecycle_json)
        .map_err(|err| Error::InvalidArgument(format!("invalid lifecycle rules: {err}")))?;
    if rules.is_empty() {
        return Err(Error::InvalidArgument(
            "lifecycle rules must not be empty".to_string(),
        ));
    }

    rules
        .into_iter()
        .map(|rule| {
            if rule.expiration_days <= 0 {
                return Err(Error::InvalidArgument(format!(
                    "lifecycle rule '{}': expiration_days must be positive",
                    rule.id
                )));
            }
            let status = if rule.enabled {
                ExpirationStatus::Enabled
            } else {
                ExpirationStatus::Disabled
            };
            LifecycleRule::builder()
                .id(&rule.id)
                .status(status)
                .filter(LifecycleRuleFilter::builder().prefix(&rule.prefix).build())
                .expiration(
                    LifecycleExpiration::builder()
                        .days(rule.expiration_days)
                        .build(),
                )
                .build()
                .map_err(|err| Error::Internal(format!("building lifecycle rule: {err}")))
        })
        .collect()
}

pub fn render(rules: &[LifecycleRule]) -> String {
    let portable: Vec<Rule> = rules
        .iter()
        .map(|rule| Rule {
            id: rule.id().unwrap_or_default().to_string(),
            prefix: rule
                .filter()
                .and_then(|f| f.prefix())
                .unwrap_or_default()
                .to_string(),
            expiration_days: rule.expiration().and_then(|e| e.days()).unwrap_or_default(),
            enabled: matches!(rule.status(), &ExpirationStatus::Enabled),
        })
        .collect();
    serde_json::to_string(&portable).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_round_trip() {
        let json = r#"[{"id":"expire-tmp","prefix":"tmp/","expiration_days":7,"enabled":true}]"#;
        let rules = parse(json).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id(), Some("expire-tmp"));

        let rendered = render(&rules);
        let back: Vec<Rule> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(back[0].prefix, "tmp/");
        assert_eq!(back[0].expiration_days, 7);
        assert!(back[0].enabled);
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert!(matches!(parse("not json"), Err(Error::InvalidArgument(_))));
        assert!(matches!(parse("[]"), Err(Error::InvalidArgument(_))));
        let negative = r#"[{"id":"r","expiration_days":-1}]"#;
        assert!(matches!(parse(negative), Err(Error::InvalidArgument(_))));
    }
}
