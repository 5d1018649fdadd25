//! Parameter space and configurations.
//!
//! A [`ParameterSpace`] is the single authoritative table of tunable fields:
//! each rule knows its section, its domain, and how to generate candidate
//! values for the search phases. A [`Configuration`] maps section name to
//! parameter name to value; a missing value means "don't care".

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OptimizerError, Result};

const EPS: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamKind {
    Number { min: f64, max: f64, step: f64 },
    Integer { min: i64, max: i64, step: i64 },
    String { choices: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRule {
    pub name: String,
    pub section: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    /// Value used by the conservative default configuration.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ParameterRule {
    pub fn number(section: &str, name: &str, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.to_string(),
            section: section.to_string(),
            kind: ParamKind::Number { min, max, step },
            default: None,
        }
    }

    pub fn integer(section: &str, name: &str, min: i64, max: i64, step: i64) -> Self {
        Self {
            name: name.to_string(),
            section: section.to_string(),
            kind: ParamKind::Integer { min, max, step },
            default: None,
        }
    }

    pub fn string(section: &str, name: &str, choices: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            section: section.to_string(),
            kind: ParamKind::String {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
            default: None,
        }
    }

    pub fn with_default(mut self, v: impl Into<Value>) -> Self {
        self.default = Some(v.into());
        self
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self.kind, ParamKind::String { .. })
    }

    /// `(min, max, step)` for numeric rules.
    pub fn bounds(&self) -> Option<(f64, f64, f64)> {
        match &self.kind {
            ParamKind::Number { min, max, step } => Some((*min, *max, *step)),
            ParamKind::Integer { min, max, step } => Some((*min as f64, *max as f64, *step as f64)),
            ParamKind::String { .. } => None,
        }
    }

    pub fn read<'a>(&self, cfg: &'a Configuration) -> Option<&'a Value> {
        cfg.get(&self.section, &self.name)
    }

    pub fn read_number(&self, cfg: &Configuration) -> Option<f64> {
        self.read(cfg).and_then(as_number)
    }

    pub fn write(&self, cfg: &mut Configuration, v: Option<Value>) {
        match v {
            Some(v) => cfg.set(&self.section, &self.name, v),
            None => {
                cfg.remove(&self.section, &self.name);
            }
        }
    }

    /// Clamps a raw number and snaps it to the `min + n * step` grid.
    pub fn quantize(&self, v: f64) -> Option<Value> {
        match &self.kind {
            ParamKind::Number { min, max, step } => {
                let n = ((clamp(v, *min, *max) - min) / step).round();
                let q = clamp(min + n * step, *min, *max);
                Some(Value::from(round_to(q, value_precision(*step))))
            }
            ParamKind::Integer { min, max, step } => {
                let c = (v.round() as i64).clamp(*min, *max);
                let n = ((c - min) as f64 / *step as f64).round() as i64;
                Some(Value::from((min + n * step).clamp(*min, *max)))
            }
            ParamKind::String { .. } => None,
        }
    }

    /// Like [`quantize`](Self::quantize) but on a grid of `fine` instead of `step`.
    fn quantize_fine(&self, v: f64, fine: f64) -> Option<Value> {
        match &self.kind {
            ParamKind::Number { min, max, .. } => {
                Some(Value::from(round_to(clamp(v, *min, *max), precision_of(fine))))
            }
            ParamKind::Integer { min, max, .. } => Some(Value::from((v.round() as i64).clamp(*min, *max))),
            ParamKind::String { .. } => None,
        }
    }

    /// Value at `frac` of the way through the domain (`0.0..=1.0`).
    pub fn value_at_fraction(&self, frac: f64) -> Option<Value> {
        let frac = clamp(frac, 0.0, 1.0);
        match &self.kind {
            ParamKind::String { choices } => {
                if choices.is_empty() {
                    return None;
                }
                let idx = ((frac * choices.len() as f64).floor() as usize).min(choices.len() - 1);
                Some(Value::from(choices[idx].clone()))
            }
            _ => {
                let (min, max, _) = self.bounds()?;
                self.quantize(min + frac * (max - min))
            }
        }
    }

    pub fn in_domain(&self, v: &Value) -> bool {
        match &self.kind {
            ParamKind::Number { min, max, .. } => {
                as_number(v).is_some_and(|x| x.is_finite() && x >= min - EPS && x <= max + EPS)
            }
            ParamKind::Integer { min, max, .. } => as_number(v).is_some_and(|x| {
                (x - x.round()).abs() < EPS && x >= *min as f64 - EPS && x <= *max as f64 + EPS
            }),
            ParamKind::String { choices } => v.as_str().is_some_and(|s| choices.iter().any(|c| c == s)),
        }
    }

    /// Canonical representation of an in-domain value (numeric strings become numbers).
    pub fn normalize(&self, v: &Value) -> Value {
        match &self.kind {
            ParamKind::Number { step, .. } => match as_number(v) {
                Some(x) => Value::from(round_to(x, value_precision(*step))),
                None => v.clone(),
            },
            ParamKind::Integer { .. } => match as_number(v) {
                Some(x) => Value::from(x.round() as i64),
                None => v.clone(),
            },
            ParamKind::String { .. } => v.clone(),
        }
    }

    /// Coarse values for a one-at-a-time sweep: the bounds, one and two steps
    /// either side of the current value, and the quartiles of the range.
    /// String rules enumerate their domain. The current value is never included.
    pub fn test_values(&self, current: Option<&Value>) -> Vec<Value> {
        if let ParamKind::String { choices } = &self.kind {
            return choices
                .iter()
                .map(|c| Value::from(c.clone()))
                .filter(|v| Some(v) != current)
                .collect();
        }
        let Some((min, max, step)) = self.bounds() else {
            return Vec::new();
        };
        let range = max - min;
        let cur = current.and_then(as_number);

        let mut raw = vec![min, max];
        if let Some(c) = cur {
            raw.extend([c - 2.0 * step, c - step, c + step, c + 2.0 * step]);
        }
        raw.extend([min + 0.25 * range, min + 0.75 * range]);

        self.collect_distinct(raw, cur, |x| self.quantize(x))
    }

    /// Values clustered tightly around the current one, spaced a quarter step apart.
    pub fn fine_values(&self, current: Option<&Value>, points: usize) -> Vec<Value> {
        let Some(cur) = current.and_then(as_number) else {
            return Vec::new();
        };
        let fine = match &self.kind {
            ParamKind::Number { step, .. } => step / 4.0,
            ParamKind::Integer { step, .. } => ((*step as f64) / 4.0).round().max(1.0),
            ParamKind::String { .. } => return Vec::new(),
        };
        let mut raw = Vec::with_capacity(points * 2);
        for k in 1..=points {
            raw.push(cur - fine * k as f64);
            raw.push(cur + fine * k as f64);
        }
        self.collect_distinct(raw, Some(cur), |x| self.quantize_fine(x, fine))
    }

    /// A random neighbour of `current`. Numeric moves span up to `scale` of the
    /// range (at least one step); string rules pick a different literal.
    pub fn perturb(&self, current: Option<&Value>, scale: f64, rng: &mut StdRng) -> Option<Value> {
        match &self.kind {
            ParamKind::String { choices } => {
                let others: Vec<&String> = choices
                    .iter()
                    .filter(|c| current.and_then(Value::as_str) != Some(c.as_str()))
                    .collect();
                others.choose(rng).map(|c| Value::from((*c).clone()))
            }
            _ => {
                let (min, max, step) = self.bounds()?;
                let Some(cur) = current.and_then(as_number) else {
                    return self.value_at_fraction(rng.random::<f64>());
                };
                let span = ((max - min) * scale).max(step);
                let delta = rng.random_range(-span..=span);
                let mut next = self.quantize(cur + delta)?;
                if as_number(&next).is_some_and(|x| (x - cur).abs() < EPS) {
                    let dir = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
                    next = self.quantize(cur + dir * step)?;
                    if as_number(&next).is_some_and(|x| (x - cur).abs() < EPS) {
                        next = self.quantize(cur - dir * step)?;
                    }
                }
                Some(next)
            }
        }
    }

    fn collect_distinct(
        &self,
        raw: Vec<f64>,
        current: Option<f64>,
        quantize: impl Fn(f64) -> Option<Value>,
    ) -> Vec<Value> {
        let mut out: Vec<Value> = Vec::new();
        for x in raw {
            let Some(v) = quantize(x) else { continue };
            let Some(n) = as_number(&v) else { continue };
            if current.is_some_and(|c| (c - n).abs() < EPS) {
                continue;
            }
            if out.iter().any(|o| as_number(o).is_some_and(|m| (m - n).abs() < EPS)) {
                continue;
            }
            out.push(v);
        }
        out
    }
}

/// Fields known to interact; varied jointly rather than one at a time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedGroup {
    pub name: String,
    pub members: Vec<String>,
}

impl CorrelatedGroup {
    pub fn new(name: &str, members: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Bands `(low, high)` as fractions of each member's range: `Min` fields take
/// the low end, `Max` fields the high end, anything else the middle.
const PRESET_BANDS: [(f64, f64); 4] = [(0.0, 0.25), (0.1, 0.5), (0.25, 0.75), (0.5, 1.0)];
const PRESET_SCALES: [f64; 2] = [0.75, 1.25];

#[derive(Clone, Debug, PartialEq)]
pub enum Violation {
    OutOfDomain { name: String, value: Value },
    InvertedPair { min: String, max: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDomain { name, value } => write!(f, "{name}={value} is out of domain"),
            Self::InvertedPair { min, max } => write!(f, "{min} exceeds {max}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct SpaceFile {
    #[serde(default)]
    parameters: Vec<ParameterRule>,
    #[serde(default)]
    groups: Vec<CorrelatedGroup>,
}

#[derive(Clone, Debug)]
pub struct ParameterSpace {
    rules: Vec<ParameterRule>,
    index: HashMap<String, usize>,
    pairs: Vec<(usize, usize)>,
    groups: Vec<CorrelatedGroup>,
}

impl ParameterSpace {
    pub fn new(rules: Vec<ParameterRule>, groups: Vec<CorrelatedGroup>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, r) in rules.iter().enumerate() {
            match &r.kind {
                ParamKind::Number { min, max, step } => {
                    if !(min <= max) || !(*step > 0.0) {
                        return Err(invalid_rule(r, "requires min <= max and step > 0"));
                    }
                }
                ParamKind::Integer { min, max, step } => {
                    if min > max || *step <= 0 {
                        return Err(invalid_rule(r, "requires min <= max and step > 0"));
                    }
                }
                ParamKind::String { choices } => {
                    if choices.is_empty() {
                        return Err(invalid_rule(r, "needs at least one literal"));
                    }
                }
            }
            if let Some(d) = &r.default {
                if !r.in_domain(d) {
                    return Err(invalid_rule(r, "default is out of domain"));
                }
            }
            if index.insert(r.name.clone(), i).is_some() {
                return Err(invalid_rule(r, "is declared twice"));
            }
        }

        for g in &groups {
            if let Some(m) = g.members.iter().find(|m| !index.contains_key(*m)) {
                return Err(OptimizerError::InvalidSettings(format!(
                    "group {} names unknown parameter {m}",
                    g.name
                )));
            }
        }

        let mut pairs = Vec::new();
        for (i, r) in rules.iter().enumerate() {
            let Some(suffix) = r.name.strip_prefix("Min ") else {
                continue;
            };
            if let Some(&j) = index.get(&format!("Max {suffix}")) {
                if rules[j].section == r.section && r.is_numeric() && rules[j].is_numeric() {
                    pairs.push((i, j));
                }
            }
        }

        Ok(Self {
            rules,
            index,
            pairs,
            groups,
        })
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: SpaceFile = toml::from_str(s)
            .map_err(|e| OptimizerError::InvalidSettings(format!("parameter space: {e}")))?;
        Self::new(file.parameters, file.groups)
    }

    pub fn rules(&self) -> &[ParameterRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&ParameterRule> {
        self.index.get(name).map(|&i| &self.rules[i])
    }

    pub fn section_of(&self, name: &str) -> Option<&str> {
        self.rule(name).map(|r| r.section.as_str())
    }

    pub fn groups(&self) -> &[CorrelatedGroup] {
        &self.groups
    }

    pub fn min_max_pairs(&self) -> impl Iterator<Item = (&ParameterRule, &ParameterRule)> {
        self.pairs.iter().map(|&(i, j)| (&self.rules[i], &self.rules[j]))
    }

    pub fn validate(&self, cfg: &Configuration) -> std::result::Result<(), Violation> {
        for r in &self.rules {
            if let Some(v) = r.read(cfg) {
                if !r.in_domain(v) {
                    return Err(Violation::OutOfDomain {
                        name: r.name.clone(),
                        value: v.clone(),
                    });
                }
            }
        }
        for (lo, hi) in self.min_max_pairs() {
            if let (Some(a), Some(b)) = (lo.read_number(cfg), hi.read_number(cfg)) {
                if a > b + EPS {
                    return Err(Violation::InvertedPair {
                        min: lo.name.clone(),
                        max: hi.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, cfg: &Configuration) -> bool {
        self.validate(cfg).is_ok()
    }

    /// Only the known parameters of `cfg`, normalized, grouped under their
    /// authoritative section.
    pub fn canonical(&self, cfg: &Configuration) -> Configuration {
        let mut out = Configuration::new();
        for r in &self.rules {
            if let Some(v) = r.read(cfg) {
                out.set(&r.section, &r.name, r.normalize(v));
            }
        }
        out
    }

    /// Conservative starting point: each rule's declared default, all else absent.
    pub fn default_configuration(&self) -> Configuration {
        let mut cfg = Configuration::new();
        for r in &self.rules {
            if let Some(d) = &r.default {
                cfg.set(&r.section, &r.name, d.clone());
            }
        }
        cfg
    }

    /// Jointly-varied presets for one group, applied on top of `base`.
    pub fn group_presets(&self, group: &CorrelatedGroup, base: &Configuration) -> Vec<Configuration> {
        let members: Vec<&ParameterRule> = group
            .members
            .iter()
            .filter_map(|m| self.rule(m))
            .filter(|r| r.is_numeric())
            .collect();
        if members.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (lo, hi) in PRESET_BANDS {
            let mut cfg = base.clone();
            for r in &members {
                let frac = if r.name.starts_with("Min ") {
                    lo
                } else if r.name.starts_with("Max ") {
                    hi
                } else {
                    (lo + hi) / 2.0
                };
                r.write(&mut cfg, r.value_at_fraction(frac));
            }
            out.push(cfg);
        }

        for scale in PRESET_SCALES {
            let mut cfg = base.clone();
            let mut changed = false;
            for r in &members {
                if let Some(cur) = r.read_number(base) {
                    r.write(&mut cfg, r.quantize(cur * scale));
                    changed = true;
                }
            }
            if changed {
                out.push(cfg);
            }
        }

        out.retain(|c| c != base);
        out.dedup();
        out
    }

    /// Token-screening filters of the backtest this optimizer was built for.
    pub fn default_space() -> Self {
        let rules = vec![
            ParameterRule::number("Basic", "Min MCAP (USD)", 0.0, 20_000.0, 1_000.0).with_default(5_000.0),
            ParameterRule::number("Basic", "Max MCAP (USD)", 10_000.0, 60_000.0, 1_000.0).with_default(30_000.0),
            ParameterRule::integer("Token Details", "Min AG Score", 0, 10, 1).with_default(3),
            ParameterRule::integer("Token Details", "Min Token Age (sec)", 0, 10_800, 60),
            ParameterRule::integer("Token Details", "Max Token Age (sec)", 0, 10_800, 60),
            ParameterRule::integer("Token Details", "Min Deployer Age (min)", 0, 1_440, 5),
            ParameterRule::integer("Wallets", "Min Unique Wallets", 0, 10, 1),
            ParameterRule::integer("Wallets", "Max Unique Wallets", 0, 10, 1),
            ParameterRule::integer("Wallets", "Min KYC Wallets", 0, 5, 1),
            ParameterRule::integer("Wallets", "Max KYC Wallets", 0, 10, 1),
            ParameterRule::integer("Wallets", "Min Holders", 0, 50, 1),
            ParameterRule::integer("Wallets", "Max Holders", 0, 200, 5),
            ParameterRule::number("Risk", "Min Bundled %", 0.0, 50.0, 0.5),
            ParameterRule::number("Risk", "Max Bundled %", 0.0, 100.0, 1.0).with_default(50.0),
            ParameterRule::number("Risk", "Min Buy Ratio %", 0.0, 100.0, 5.0),
            ParameterRule::number("Risk", "Max Buy Ratio %", 0.0, 100.0, 5.0),
            ParameterRule::number("Risk", "Max Vol MCAP %", 0.0, 300.0, 10.0),
            ParameterRule::number("Risk", "Max Drained %", 0.0, 100.0, 5.0).with_default(60.0),
            ParameterRule::integer("Risk", "Max Drained Count", 0, 11, 1),
            ParameterRule::string("Risk", "Description", &["Yes", "No"]),
            ParameterRule::string("Risk", "Fresh Deployer", &["Yes", "No"]),
            ParameterRule::integer("Advanced", "Min TTC (sec)", 0, 3_600, 10),
            ParameterRule::number("Advanced", "Max Liquidity %", 0.0, 100.0, 5.0),
            ParameterRule::number("Advanced", "Min Win Pred %", 0.0, 100.0, 5.0),
        ];
        let groups = vec![
            CorrelatedGroup::new("MCAP Range", &["Min MCAP (USD)", "Max MCAP (USD)"]),
            CorrelatedGroup::new(
                "Wallet Counts",
                &[
                    "Min Unique Wallets",
                    "Max Unique Wallets",
                    "Min KYC Wallets",
                    "Max KYC Wallets",
                    "Min Holders",
                ],
            ),
            CorrelatedGroup::new("Bundled Range", &["Min Bundled %", "Max Bundled %"]),
            CorrelatedGroup::new("Token Age", &["Min Token Age (sec)", "Max Token Age (sec)"]),
            CorrelatedGroup::new("Buy Ratio", &["Min Buy Ratio %", "Max Buy Ratio %"]),
        ];
        Self::new(rules, groups).expect("built-in parameter space is valid")
    }
}

fn invalid_rule(r: &ParameterRule, msg: &str) -> OptimizerError {
    OptimizerError::InvalidSettings(format!("parameter {} {msg}", r.name))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, Map<String, Value>>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient conversion from arbitrary JSON: non-object sections are
    /// ignored and `null` values are treated as absent.
    pub fn from_value(v: &Value) -> Result<Self> {
        let Some(obj) = v.as_object() else {
            return Err(OptimizerError::InvalidSettings(
                "configuration must be a JSON object".to_string(),
            ));
        };
        let mut cfg = Self::new();
        for (section, params) in obj {
            let Some(params) = params.as_object() else {
                continue;
            };
            for (name, value) in params {
                cfg.set(section, name, value.clone());
            }
        }
        Ok(cfg)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn get(&self, section: &str, name: &str) -> Option<&Value> {
        self.0.get(section).and_then(|s| s.get(name)).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, section: &str, name: &str, v: Value) {
        if v.is_null() {
            self.remove(section, name);
            return;
        }
        self.0
            .entry(section.to_string())
            .or_default()
            .insert(name.to_string(), v);
    }

    pub fn remove(&mut self, section: &str, name: &str) -> Option<Value> {
        let s = self.0.get_mut(section)?;
        let v = s.remove(name);
        if s.is_empty() {
            self.0.remove(section);
        }
        v
    }

    pub fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.0.get(name)
    }

    pub fn set_section(&mut self, name: &str, params: Option<Map<String, Value>>) {
        match params {
            Some(p) if !p.is_empty() => {
                self.0.insert(name.to_string(), p);
            }
            _ => {
                self.0.remove(name);
            }
        }
    }

    pub fn section_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Numbers, and numeric strings as read back from form fields.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

fn round_to(v: f64, digits: u32) -> f64 {
    let f = 10_f64.powi(digits as i32);
    (v * f).round() / f
}

/// Digits kept for continuous values: enough to represent quarter steps.
fn value_precision(step: f64) -> u32 {
    precision_of(step / 4.0)
}

fn precision_of(step: f64) -> u32 {
    for d in 0..=6 {
        let scaled = step * 10_f64.powi(d);
        if (scaled - scaled.round()).abs() < 1e-6 {
            return d as u32;
        }
    }
    6
}
