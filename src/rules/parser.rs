//! Rule file parsing (spec §6): YAML documents with a top-level `rules`
//! list. Each condition is a 3-element sequence `[feature, operator,
//! operand]`. Unknown feature names or operators are a `ConfigError`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NidsError, Result};
use crate::features::FeatureKey;

use super::{Condition, Domain, Operand, Operator, Rule, Severity};

#[derive(Debug, Deserialize, Serialize)]
struct RuleFile {
    rules: Vec<RawRule>,
}

/// Wire shape for a rule, shared by YAML rule files and the control
/// plane's rule-CRUD HTTP endpoints (spec §6).
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct RawRule {
    pub(crate) name: String,
    pub(crate) conditions: Vec<(String, String, serde_yaml::Value)>,
    pub(crate) severity: String,
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) domain: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// A rule together with the path it was loaded from, useful for error
/// messages and for round-tripping custom rules back to disk.
pub struct ParsedRule {
    pub rule: Rule,
    pub source: std::path::PathBuf,
}

fn parse_operand(raw: &serde_yaml::Value, operator: &Operator) -> Result<Operand> {
    match raw {
        serde_yaml::Value::String(s) => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                if *operator == Operator::Eq {
                    let v = u64::from_str_radix(hex, 16)
                        .map_err(|e| NidsError::Config(format!("bad hex literal {s}: {e}")))?;
                    return Ok(Operand::Hex(v));
                }
            }
            if let Some((lo, hi)) = parse_range(s) {
                return Ok(Operand::IntRange(lo, hi));
            }
            Ok(Operand::Str(s.clone()))
        }
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Operand::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Operand::Float(f))
            } else {
                Err(NidsError::Config(format!("unsupported numeric operand {n:?}")))
            }
        }
        serde_yaml::Value::Sequence(items) => {
            if items.iter().all(|v| v.as_i64().is_some()) {
                Ok(Operand::IntSet(items.iter().map(|v| v.as_i64().unwrap()).collect()))
            } else {
                let strs = items
                    .iter()
                    .map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| NidsError::Config("mixed-type list operand".into()))?;
                Ok(Operand::StrSet(strs))
            }
        }
        other => Err(NidsError::Config(format!("unsupported operand shape: {other:?}"))),
    }
}

/// `"A-B"` inclusive integer range literal, per spec §3.
fn parse_range(s: &str) -> Option<(i64, i64)> {
    let (a, b) = s.split_once('-')?;
    let a = a.trim();
    // Disambiguate a leading '-' (negative number) from the separator by
    // requiring both sides to be non-empty plain digit sequences.
    if a.is_empty() || !a.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let b = b.trim();
    if b.is_empty() || !b.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((a.parse().ok()?, b.parse().ok()?))
}

pub(crate) fn parse_rule(raw: RawRule) -> Result<Rule> {
    let severity = Severity::parse(&raw.severity)
        .ok_or_else(|| NidsError::Config(format!("unknown severity {}", raw.severity)))?;
    let domain = match raw.domain.as_deref() {
        None | Some("both") => Domain::Both,
        Some("packet") => Domain::Packet,
        Some("flow") => Domain::Flow,
        Some(other) => return Err(NidsError::Config(format!("unknown rule domain {other}"))),
    };

    let mut conditions = Vec::with_capacity(raw.conditions.len());
    for (feature_name, op_str, operand_raw) in raw.conditions {
        let feature = FeatureKey::from_str(&feature_name)
            .ok_or_else(|| NidsError::Config(format!("unknown feature name {feature_name}")))?;
        let operator = Operator::parse(&op_str)
            .ok_or_else(|| NidsError::Config(format!("unknown operator {op_str}")))?;
        let operand = parse_operand(&operand_raw, &operator)?;
        conditions.push(Condition {
            feature,
            operator,
            operand,
        });
    }

    Ok(Rule {
        name: raw.name,
        conditions,
        severity,
        enabled: raw.enabled,
        domain,
    })
}

fn load_file(path: &Path) -> Result<Vec<ParsedRule>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| NidsError::Config(format!("reading {path:?}: {e}")))?;
    let file: RuleFile = serde_yaml::from_str(&contents)?;
    file.rules
        .into_iter()
        .map(|raw| {
            parse_rule(raw).map(|rule| ParsedRule {
                rule,
                source: path.to_path_buf(),
            })
        })
        .collect()
}

/// Loads every `*.yaml`/`*.yml` file in `rules_dir` except `custom_rules.yaml`.
pub fn load_builtin_rules(rules_dir: &Path, custom_path: &Path) -> Result<Vec<ParsedRule>> {
    if !rules_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let entries = fs::read_dir(rules_dir)
        .map_err(|e| NidsError::Config(format!("reading rules dir {rules_dir:?}: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| NidsError::Config(e.to_string()))?;
        let path = entry.path();
        if path == custom_path {
            continue;
        }
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
        if !is_yaml {
            continue;
        }
        out.extend(load_file(&path)?);
    }
    Ok(out)
}

/// Loads `custom_rules.yaml`, if present; an absent file is not an error.
pub fn load_custom_rules(custom_path: &Path) -> Result<Vec<ParsedRule>> {
    if !custom_path.exists() {
        return Ok(Vec::new());
    }
    load_file(custom_path)
}

fn severity_str(s: Severity) -> &'static str {
    s.as_str()
}

fn domain_str(d: Domain) -> &'static str {
    match d {
        Domain::Packet => "packet",
        Domain::Flow => "flow",
        Domain::Both => "both",
    }
}

/// Writes the full current rule set back to `custom_rules.yaml`. Called
/// after every add/enable/disable/remove so dynamic edits survive a
/// restart (spec §4.5 "Persistence of custom rules").
pub fn write_custom_rules<'a>(path: &Path, rules: impl Iterator<Item = &'a Rule>) -> Result<()> {
    let raw_rules: Vec<RawRule> = rules
        .map(|rule| RawRule {
            name: rule.name.clone(),
            conditions: rule
                .conditions
                .iter()
                .map(|c| {
                    let operand = match &c.operand {
                        Operand::Int(i) => serde_yaml::Value::from(*i),
                        Operand::Float(f) => serde_yaml::Value::from(*f),
                        Operand::Str(s) => serde_yaml::Value::from(s.clone()),
                        Operand::Hex(h) => serde_yaml::Value::from(format!("0x{h:X}")),
                        Operand::IntRange(a, b) => serde_yaml::Value::from(format!("{a}-{b}")),
                        Operand::IntSet(v) => serde_yaml::Value::from(v.clone()),
                        Operand::StrSet(v) => serde_yaml::Value::from(v.clone()),
                    };
                    let operator = match c.operator {
                        Operator::Eq => "==",
                        Operator::Ne => "!=",
                        Operator::Gt => ">",
                        Operator::Lt => "<",
                        Operator::Ge => ">=",
                        Operator::Le => "<=",
                        Operator::In => "in",
                    };
                    (c.feature.as_str().to_string(), operator.to_string(), operand)
                })
                .collect(),
            severity: severity_str(rule.severity).to_string(),
            enabled: rule.enabled,
            domain: Some(domain_str(rule.domain).to_string()),
        })
        .collect();

    let file = RuleFile { rules: raw_rules };
    let yaml = serde_yaml::to_string(&file).map_err(|e| NidsError::Config(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| NidsError::Config(e.to_string()))?;
    }
    fs::write(path, yaml).map_err(|e| NidsError::Config(format!("writing {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_literal_parses_inclusive_bounds() {
        assert_eq!(parse_range("1-1024"), Some((1, 1024)));
        assert_eq!(parse_range("not-a-range"), None);
        assert_eq!(parse_range("-5"), None);
    }

    #[test]
    fn parse_rule_rejects_unknown_feature() {
        let raw = RawRule {
            name: "X".into(),
            conditions: vec![("not_a_feature".into(), "==".into(), serde_yaml::Value::from(1))],
            severity: "low".into(),
            enabled: true,
            domain: None,
        };
        assert!(parse_rule(raw).is_err());
    }

    #[test]
    fn parse_rule_accepts_hex_literal_equality() {
        let raw = RawRule {
            name: "SYN".into(),
            conditions: vec![("tcp_flags".into(), "==".into(), serde_yaml::Value::from("0x02"))],
            severity: "high".into(),
            enabled: true,
            domain: None,
        };
        let rule = parse_rule(raw).unwrap();
        assert!(matches!(rule.conditions[0].operand, Operand::Hex(2)));
    }
}
