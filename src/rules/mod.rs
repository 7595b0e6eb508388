//! Rule Engine (C5): a live-editable set of conjunctive predicate rules,
//! evaluated against a consistent copy-on-write snapshot so that a
//! concurrent reload never yields a torn rule table (spec §4.5).

mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::alert::{Alert, AlertKind};
use crate::features::{FeatureKey, FeatureMap, FeatureValue};

pub use parser::ParsedRule;
pub(crate) use parser::{parse_rule, RawRule};

/// Severity attached to a rule or alert. Ordered so the control plane can
/// build a severity histogram (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        Some(match s {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => return None,
        })
    }
}

/// Which kind of feature map a rule may be evaluated against. Resolves
/// spec §9's open question on packet vs. flow rule namespaces: a rule
/// tagged `Packet` is only ever evaluated against the per-packet map, a
/// rule tagged `Flow` only against the per-flow map. `Both` (the
/// default) is meant for rules that mix packet-only and flow-only
/// features in one condition list (e.g. a TCP flag together with a
/// packet-rate threshold): the pipeline evaluates it once, against the
/// per-packet map merged with the session's flow features re-injected
/// alongside the triggering packet (spec §4.4), so every condition has
/// something to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Packet,
    Flow,
    Both,
}

impl Domain {
    pub fn admits(&self, evaluated: Domain) -> bool {
        matches!((self, evaluated), (Domain::Both, _) | (Domain::Packet, Domain::Packet) | (Domain::Flow, Domain::Flow))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Operator> {
        Some(match s {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Ge,
            "<=" => Operator::Le,
            "in" => Operator::In,
            _ => return None,
        })
    }
}

/// A parsed, type-directed operand (spec §9: "dynamic rule conditions ->
/// tagged operand variants").
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Str(String),
    Hex(u64),
    IntRange(i64, i64),
    IntSet(Vec<i64>),
    StrSet(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub feature: FeatureKey,
    pub operator: Operator,
    pub operand: Operand,
}

impl Condition {
    /// Evaluates this single condition against a feature map. A missing
    /// feature is always false, regardless of operator (spec §4.5 and
    /// testable property 3).
    pub fn evaluate(&self, features: &FeatureMap) -> bool {
        let Some(value) = features.get(self.feature) else {
            return false;
        };
        match &self.operator {
            Operator::Eq => self.eq_true(value),
            Operator::Ne => !self.eq_true(value),
            Operator::Gt => self.cmp_num(value, |a, b| a > b),
            Operator::Lt => self.cmp_num(value, |a, b| a < b),
            Operator::Ge => self.cmp_num(value, |a, b| a >= b),
            Operator::Le => self.cmp_num(value, |a, b| a <= b),
            Operator::In => self.in_true(value),
        }
    }

    fn eq_true(&self, value: &FeatureValue) -> bool {
        match &self.operand {
            Operand::Int(i) => value.as_i64() == Some(*i) && matches!(value, FeatureValue::Int(_) | FeatureValue::Float(_)),
            Operand::Hex(h) => value.as_i64() == Some(*h as i64),
            Operand::Float(f) => value.as_f64() == Some(*f),
            Operand::Str(s) => value.as_str() == Some(s.as_str()),
            _ => false,
        }
    }

    fn cmp_num(&self, value: &FeatureValue, op: impl Fn(f64, f64) -> bool) -> bool {
        let lhs = match value.as_f64() {
            Some(v) => v,
            None => return false,
        };
        let rhs = match &self.operand {
            Operand::Int(i) => *i as f64,
            Operand::Float(f) => *f,
            Operand::Hex(h) => *h as f64,
            _ => return false,
        };
        op(lhs, rhs)
    }

    fn in_true(&self, value: &FeatureValue) -> bool {
        match &self.operand {
            Operand::IntSet(set) => value.as_i64().map(|v| set.contains(&v)).unwrap_or(false),
            Operand::StrSet(set) => value.as_str().map(|v| set.iter().any(|s| s == v)).unwrap_or(false),
            Operand::IntRange(lo, hi) => {
                if lo > hi {
                    return false;
                }
                value.as_i64().map(|v| v >= *lo && v <= *hi).unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub conditions: Vec<Condition>,
    pub severity: Severity,
    pub enabled: bool,
    pub domain: Domain,
}

impl Rule {
    /// A rule fires iff it is enabled, its domain admits the map under
    /// evaluation, and every condition holds.
    fn fires(&self, features: &FeatureMap, evaluated: Domain) -> bool {
        self.enabled
            && self.domain.admits(evaluated)
            && self.conditions.iter().all(|c| c.evaluate(features))
    }
}

/// Immutable snapshot of the rule table. Readers clone the `Arc`, never the
/// map itself.
#[derive(Debug, Default)]
struct RuleTable {
    rules: HashMap<String, Rule>,
}

/// Tracks eval failures independent of which worker hit them.
#[derive(Debug, Default)]
pub struct RuleEngineStats {
    pub eval_errors: AtomicU64,
}

/// The live rule engine. `snapshot` is swapped wholesale on reload/mutation
/// (spec §9: "copy-on-write pointer swap"); evaluators only ever read a
/// single `Arc` they loaded once per call, so a concurrent reload never
/// yields a torn table (testable property 2).
pub struct RuleEngine {
    snapshot: ArcSwap<RuleTable>,
    rules_dir: PathBuf,
    custom_rules_path: PathBuf,
    pub stats: RuleEngineStats,
}

impl RuleEngine {
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        let rules_dir = rules_dir.into();
        let custom_rules_path = rules_dir.join("custom_rules.yaml");
        RuleEngine {
            snapshot: ArcSwap::from_pointee(RuleTable::default()),
            rules_dir,
            custom_rules_path,
            stats: RuleEngineStats::default(),
        }
    }

    /// Engine with the seeded built-in rules, no on-disk rule files
    /// required. Useful for tests and for running without `--rules-dir`.
    pub fn with_builtin_rules() -> Self {
        let engine = RuleEngine::new(PathBuf::from("rules"));
        let mut table = RuleTable::default();
        for rule in builtin_rules() {
            table.rules.insert(rule.name.clone(), rule);
        }
        engine.snapshot.store(Arc::new(table));
        engine
    }

    /// Evaluates every enabled rule whose domain matches `evaluated`
    /// against `features`, returning one alert per firing rule.
    pub fn check(&self, features: &FeatureMap, evaluated: Domain) -> Vec<Alert> {
        let table = self.snapshot.load();
        let mut alerts = Vec::new();
        for rule in table.rules.values() {
            if rule.fires(features, evaluated) {
                alerts.push(Alert::from_rule(rule, AlertKind::Rule));
            }
        }
        alerts
    }

    pub fn add(&self, rule: Rule) {
        self.mutate(|table| {
            table.rules.insert(rule.name.clone(), rule.clone());
        });
        self.persist_custom();
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.mutate(|table| table.rules.remove(name).is_some());
        if removed {
            self.persist_custom();
        }
        removed
    }

    pub fn enable(&self, name: &str) -> bool {
        let changed = self.mutate(|table| {
            if let Some(rule) = table.rules.get_mut(name) {
                rule.enabled = true;
                true
            } else {
                false
            }
        });
        if changed {
            self.persist_custom();
        }
        changed
    }

    pub fn disable(&self, name: &str) -> bool {
        let changed = self.mutate(|table| {
            if let Some(rule) = table.rules.get_mut(name) {
                rule.enabled = false;
                true
            } else {
                false
            }
        });
        if changed {
            self.persist_custom();
        }
        changed
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.snapshot.load().rules.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Rule> {
        self.snapshot.load().rules.get(name).cloned()
    }

    /// Rebuilds the table from disk: built-in rule files plus
    /// `custom_rules.yaml`, custom taking precedence on name collision
    /// (spec §4.5 "Persistence of custom rules"). On any malformed file
    /// the previous table remains in effect and the error is returned.
    pub fn reload(&self) -> crate::error::Result<()> {
        let builtin = parser::load_builtin_rules(&self.rules_dir, &self.custom_rules_path)?;
        let custom = parser::load_custom_rules(&self.custom_rules_path)?;

        let mut table = RuleTable::default();
        for parsed in builtin {
            table.rules.insert(parsed.rule.name.clone(), parsed.rule);
        }
        for parsed in custom {
            table.rules.insert(parsed.rule.name.clone(), parsed.rule);
        }
        self.snapshot.store(Arc::new(table));
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut RuleTable) -> T) -> T {
        let current = self.snapshot.load();
        let mut next = RuleTable {
            rules: current.rules.clone(),
        };
        let result = f(&mut next);
        self.snapshot.store(Arc::new(next));
        result
    }

    fn persist_custom(&self) {
        let table = self.snapshot.load();
        if let Err(e) = parser::write_custom_rules(&self.custom_rules_path, table.rules.values()) {
            log::warn!("failed to persist custom rules to {:?}: {}", self.custom_rules_path, e);
        }
    }
}

/// Default rule set, grounded in the original `_setup_rules` seed list and
/// spec §8's literal end-to-end scenarios.
pub fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "Port Scan Detection".into(),
            conditions: vec![
                Condition {
                    feature: FeatureKey::TcpDport,
                    operator: Operator::In,
                    operand: Operand::IntRange(1, 1024),
                },
                Condition {
                    feature: FeatureKey::PacketCount,
                    operator: Operator::Gt,
                    operand: Operand::Int(100),
                },
                Condition {
                    feature: FeatureKey::Duration,
                    operator: Operator::Lt,
                    operand: Operand::Int(10),
                },
            ],
            severity: Severity::High,
            enabled: true,
            domain: Domain::Both,
        },
        Rule {
            name: "SYN Flood Detection".into(),
            conditions: vec![
                Condition {
                    feature: FeatureKey::TcpFlags,
                    operator: Operator::Eq,
                    operand: Operand::Hex(0x02),
                },
                Condition {
                    feature: FeatureKey::PacketCount,
                    operator: Operator::Gt,
                    operand: Operand::Int(200),
                },
                Condition {
                    feature: FeatureKey::Duration,
                    operator: Operator::Lt,
                    operand: Operand::Int(5),
                },
            ],
            severity: Severity::High,
            enabled: true,
            domain: Domain::Both,
        },
        Rule {
            name: "UDP Flood Detection".into(),
            conditions: vec![
                Condition {
                    feature: FeatureKey::BytesPerSecond,
                    operator: Operator::Gt,
                    operand: Operand::Int(1_000_000),
                },
                Condition {
                    feature: FeatureKey::PacketCount,
                    operator: Operator::Gt,
                    operand: Operand::Int(1000),
                },
            ],
            severity: Severity::High,
            enabled: true,
            domain: Domain::Flow,
        },
        Rule {
            name: "Large Packet Detection".into(),
            conditions: vec![Condition {
                feature: FeatureKey::IpLen,
                operator: Operator::Gt,
                operand: Operand::Int(1500),
            }],
            severity: Severity::Medium,
            enabled: true,
            domain: Domain::Packet,
        },
    ]
}
