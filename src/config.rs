use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;

use crate::backtest::metrics::VerdictCutoffs;
use crate::model::PairSpec;
use crate::signal::{ScaleRung, ScalingLadder, SignalThresholds};
use crate::spread::SpreadConvention;
use crate::trade::PnlConvention;

const CONFIG_PATH_ENV: &str = "COINTPAIR_CONFIG_PATH";

const DEFAULT_P_VALUE_THRESHOLD: f64 = 0.05;
const DEFAULT_P_VALUE_EXIT_THRESHOLD: f64 = 0.10;
const DEFAULT_MIN_HALF_LIFE: f64 = 5.0;
const DEFAULT_MAX_HALF_LIFE: f64 = 50.0;
const DEFAULT_MIN_OBSERVATIONS: usize = 100;
const DEFAULT_MIN_HALF_LIFE_OBSERVATIONS: usize = 20;
const DEFAULT_Z_ENTRY: f64 = 2.0;
const DEFAULT_Z_EXIT: f64 = 1.0;
const DEFAULT_Z_STOP: f64 = 3.0;
const DEFAULT_MIN_WINDOW: usize = 10;
const DEFAULT_RECALIBRATION_INTERVAL_DAYS: f64 = 30.0;
const DEFAULT_CALIBRATION_LOOKBACK: usize = 120;
const DEFAULT_MIN_PROFIT_FACTOR: f64 = 1.0;
const DEFAULT_MARGINAL_PROFIT_FACTOR_CUTOFF: f64 = 1.5;
const DEFAULT_VIABLE_MIN_WIN_RATE: f64 = 0.5;
const DEFAULT_BREAKDOWN_CHECKS: u32 = 3;
const DEFAULT_HEDGE_RATIO_DRIFT_THRESHOLD: f64 = 0.20;
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_REPORT_FILE: &str = "backtest_report.md";
const DEFAULT_PAIRS_FILE: &str = "pairs.jsonl";
const DEFAULT_UNIVERSE: &str = "GLD/SLV,USO/BNO,SPY/QQQ,SPY/IWM,XOM/CVX,JPM/BAC";
const LADDER_WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        let items = match self {
            StringOrVec::String(value) => value.split(',').map(str::to_string).collect(),
            StringOrVec::Vec(values) => values,
        };
        items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StrategyYaml {
    p_value_threshold: Option<f64>,
    p_value_exit_threshold: Option<f64>,
    min_half_life: Option<f64>,
    max_half_life: Option<f64>,
    min_observations: Option<usize>,
    min_half_life_observations: Option<usize>,
    adf_max_lag: Option<usize>,
    z_entry: Option<f64>,
    z_exit: Option<f64>,
    z_stop: Option<f64>,
    scaling_ladder: Option<Vec<ScaleRung>>,
    min_window: Option<usize>,
    spread_convention: Option<SpreadConvention>,
    pnl_convention: Option<PnlConvention>,
    recalibration_interval_days: Option<f64>,
    calibration_lookback: Option<usize>,
    min_profit_factor: Option<f64>,
    marginal_profit_factor_cutoff: Option<f64>,
    viable_min_win_rate: Option<f64>,
    breakdown_checks: Option<u32>,
    hedge_ratio_drift_threshold: Option<f64>,
    max_concurrency: Option<usize>,
    universe_pairs: Option<StringOrVec>,
    universe_symbols: Option<StringOrVec>,
    price_file: Option<String>,
    report_file: Option<String>,
    pairs_file: Option<String>,
}

/// Strategy and run configuration. Built from YAML (`COINTPAIR_CONFIG_PATH`)
/// or the environment, with environment variables overriding YAML values.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub p_value_threshold: f64,
    pub p_value_exit_threshold: f64,
    /// Days.
    pub min_half_life: f64,
    /// Days.
    pub max_half_life: f64,
    pub min_observations: usize,
    pub min_half_life_observations: usize,
    pub adf_max_lag: Option<usize>,
    pub z_entry: f64,
    pub z_exit: f64,
    pub z_stop: f64,
    pub scaling_ladder: Option<Vec<ScaleRung>>,
    pub min_window: usize,
    pub spread_convention: SpreadConvention,
    pub pnl_convention: PnlConvention,
    pub recalibration_interval_days: f64,
    pub calibration_lookback: usize,
    pub min_profit_factor: f64,
    pub marginal_profit_factor_cutoff: f64,
    pub viable_min_win_rate: f64,
    pub breakdown_checks: u32,
    pub hedge_ratio_drift_threshold: f64,
    pub max_concurrency: usize,
    pub universe: Vec<PairSpec>,
    pub price_file: Option<String>,
    pub report_file: String,
    pub pairs_file: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            p_value_threshold: DEFAULT_P_VALUE_THRESHOLD,
            p_value_exit_threshold: DEFAULT_P_VALUE_EXIT_THRESHOLD,
            min_half_life: DEFAULT_MIN_HALF_LIFE,
            max_half_life: DEFAULT_MAX_HALF_LIFE,
            min_observations: DEFAULT_MIN_OBSERVATIONS,
            min_half_life_observations: DEFAULT_MIN_HALF_LIFE_OBSERVATIONS,
            adf_max_lag: None,
            z_entry: DEFAULT_Z_ENTRY,
            z_exit: DEFAULT_Z_EXIT,
            z_stop: DEFAULT_Z_STOP,
            scaling_ladder: None,
            min_window: DEFAULT_MIN_WINDOW,
            spread_convention: SpreadConvention::default(),
            pnl_convention: PnlConvention::default(),
            recalibration_interval_days: DEFAULT_RECALIBRATION_INTERVAL_DAYS,
            calibration_lookback: DEFAULT_CALIBRATION_LOOKBACK,
            min_profit_factor: DEFAULT_MIN_PROFIT_FACTOR,
            marginal_profit_factor_cutoff: DEFAULT_MARGINAL_PROFIT_FACTOR_CUTOFF,
            viable_min_win_rate: DEFAULT_VIABLE_MIN_WIN_RATE,
            breakdown_checks: DEFAULT_BREAKDOWN_CHECKS,
            hedge_ratio_drift_threshold: DEFAULT_HEDGE_RATIO_DRIFT_THRESHOLD,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            universe: parse_pairs_list(DEFAULT_UNIVERSE).unwrap_or_default(),
            price_file: None,
            report_file: DEFAULT_REPORT_FILE.to_string(),
            pairs_file: DEFAULT_PAIRS_FILE.to_string(),
        }
    }
}

impl StrategyConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open strategy config {}", path_ref.display()))?;
        let yaml: StrategyYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse strategy config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_overrides(|key| env::var(key).ok())?;
        cfg.validate()?;
        log::info!("[CONFIG] loaded {}", path_ref.display());
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: StrategyYaml) -> Result<Self> {
        let defaults = Self::default();
        let universe = match (yaml.universe_pairs, yaml.universe_symbols) {
            (Some(pairs), _) => parse_pairs_list(&pairs.into_vec().join(","))?,
            (None, Some(symbols)) => parse_symbols_vec(&symbols.into_vec())?,
            (None, None) => defaults.universe,
        };
        Ok(Self {
            p_value_threshold: yaml
                .p_value_threshold
                .unwrap_or(DEFAULT_P_VALUE_THRESHOLD),
            p_value_exit_threshold: yaml
                .p_value_exit_threshold
                .unwrap_or(DEFAULT_P_VALUE_EXIT_THRESHOLD),
            min_half_life: yaml.min_half_life.unwrap_or(DEFAULT_MIN_HALF_LIFE),
            max_half_life: yaml.max_half_life.unwrap_or(DEFAULT_MAX_HALF_LIFE),
            min_observations: yaml.min_observations.unwrap_or(DEFAULT_MIN_OBSERVATIONS),
            min_half_life_observations: yaml
                .min_half_life_observations
                .unwrap_or(DEFAULT_MIN_HALF_LIFE_OBSERVATIONS),
            adf_max_lag: yaml.adf_max_lag,
            z_entry: yaml.z_entry.unwrap_or(DEFAULT_Z_ENTRY),
            z_exit: yaml.z_exit.unwrap_or(DEFAULT_Z_EXIT),
            z_stop: yaml.z_stop.unwrap_or(DEFAULT_Z_STOP),
            scaling_ladder: yaml.scaling_ladder.filter(|rungs| !rungs.is_empty()),
            min_window: yaml.min_window.unwrap_or(DEFAULT_MIN_WINDOW),
            spread_convention: yaml.spread_convention.unwrap_or_default(),
            pnl_convention: yaml.pnl_convention.unwrap_or_default(),
            recalibration_interval_days: yaml
                .recalibration_interval_days
                .unwrap_or(DEFAULT_RECALIBRATION_INTERVAL_DAYS),
            calibration_lookback: yaml
                .calibration_lookback
                .unwrap_or(DEFAULT_CALIBRATION_LOOKBACK),
            min_profit_factor: yaml.min_profit_factor.unwrap_or(DEFAULT_MIN_PROFIT_FACTOR),
            marginal_profit_factor_cutoff: yaml
                .marginal_profit_factor_cutoff
                .unwrap_or(DEFAULT_MARGINAL_PROFIT_FACTOR_CUTOFF),
            viable_min_win_rate: yaml
                .viable_min_win_rate
                .unwrap_or(DEFAULT_VIABLE_MIN_WIN_RATE),
            breakdown_checks: yaml.breakdown_checks.unwrap_or(DEFAULT_BREAKDOWN_CHECKS),
            hedge_ratio_drift_threshold: yaml
                .hedge_ratio_drift_threshold
                .unwrap_or(DEFAULT_HEDGE_RATIO_DRIFT_THRESHOLD),
            max_concurrency: yaml.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            universe,
            price_file: yaml.price_file,
            report_file: yaml
                .report_file
                .unwrap_or_else(|| DEFAULT_REPORT_FILE.to_string()),
            pairs_file: yaml
                .pairs_file
                .unwrap_or_else(|| DEFAULT_PAIRS_FILE.to_string()),
        })
    }

    /// Applies `KEY=value` overrides from `lookup`. Empty values are ignored;
    /// values that fail to parse are an error rather than a silent default.
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        override_parsed(&get, "P_VALUE_THRESHOLD", &mut self.p_value_threshold)?;
        override_parsed(&get, "P_VALUE_EXIT_THRESHOLD", &mut self.p_value_exit_threshold)?;
        override_parsed(&get, "MIN_HALF_LIFE", &mut self.min_half_life)?;
        override_parsed(&get, "MAX_HALF_LIFE", &mut self.max_half_life)?;
        override_parsed(&get, "MIN_OBSERVATIONS", &mut self.min_observations)?;
        override_parsed(
            &get,
            "MIN_HALF_LIFE_OBSERVATIONS",
            &mut self.min_half_life_observations,
        )?;
        if let Some(value) = get("ADF_MAX_LAG") {
            self.adf_max_lag = Some(
                value
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid ADF_MAX_LAG: {}", value))?,
            );
        }
        override_parsed(&get, "Z_ENTRY", &mut self.z_entry)?;
        override_parsed(&get, "Z_EXIT", &mut self.z_exit)?;
        override_parsed(&get, "Z_STOP", &mut self.z_stop)?;
        if let Some(value) = get("SCALING_LADDER") {
            self.scaling_ladder = Some(parse_ladder(&value)?);
        }
        override_parsed(&get, "MIN_WINDOW", &mut self.min_window)?;
        override_parsed(&get, "SPREAD_CONVENTION", &mut self.spread_convention)?;
        override_parsed(&get, "PNL_CONVENTION", &mut self.pnl_convention)?;
        override_parsed(
            &get,
            "RECALIBRATION_INTERVAL_DAYS",
            &mut self.recalibration_interval_days,
        )?;
        override_parsed(&get, "CALIBRATION_LOOKBACK", &mut self.calibration_lookback)?;
        override_parsed(&get, "MIN_PROFIT_FACTOR", &mut self.min_profit_factor)?;
        override_parsed(
            &get,
            "MARGINAL_PROFIT_FACTOR_CUTOFF",
            &mut self.marginal_profit_factor_cutoff,
        )?;
        override_parsed(&get, "VIABLE_MIN_WIN_RATE", &mut self.viable_min_win_rate)?;
        override_parsed(&get, "BREAKDOWN_CHECKS", &mut self.breakdown_checks)?;
        override_parsed(
            &get,
            "HEDGE_RATIO_DRIFT_THRESHOLD",
            &mut self.hedge_ratio_drift_threshold,
        )?;
        override_parsed(&get, "MAX_CONCURRENCY", &mut self.max_concurrency)?;

        if let Some(raw) = get("UNIVERSE_PAIRS") {
            self.universe = parse_pairs_list(&raw)?;
        } else if let Some(raw) = get("UNIVERSE_SYMBOLS") {
            let symbols: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).collect();
            self.universe = parse_symbols_vec(&symbols)?;
        }
        if let Some(value) = get("PRICE_FILE") {
            self.price_file = Some(value);
        }
        if let Some(value) = get("REPORT_FILE") {
            self.report_file = value;
        }
        if let Some(value) = get("PAIRS_FILE") {
            self.pairs_file = value;
        }
        Ok(())
    }

    /// Fails fast on configuration that would make thresholds meaningless.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("p_value_threshold", self.p_value_threshold),
            ("p_value_exit_threshold", self.p_value_exit_threshold),
            ("min_half_life", self.min_half_life),
            ("max_half_life", self.max_half_life),
            ("z_entry", self.z_entry),
            ("z_exit", self.z_exit),
            ("z_stop", self.z_stop),
            (
                "recalibration_interval_days",
                self.recalibration_interval_days,
            ),
            ("min_profit_factor", self.min_profit_factor),
            (
                "marginal_profit_factor_cutoff",
                self.marginal_profit_factor_cutoff,
            ),
            ("viable_min_win_rate", self.viable_min_win_rate),
            ("hedge_ratio_drift_threshold", self.hedge_ratio_drift_threshold),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("{} must be a positive number, got {}", name, value));
            }
        }
        if !(self.z_exit < self.z_entry && self.z_entry < self.z_stop) {
            return Err(anyhow!(
                "thresholds must satisfy z_exit < z_entry < z_stop (got {} / {} / {})",
                self.z_exit,
                self.z_entry,
                self.z_stop
            ));
        }
        if self.p_value_threshold > self.p_value_exit_threshold
            || self.p_value_exit_threshold >= 1.0
        {
            return Err(anyhow!(
                "p-values must satisfy 0 < p_value_threshold <= p_value_exit_threshold < 1"
            ));
        }
        if self.min_half_life > self.max_half_life {
            return Err(anyhow!("min_half_life exceeds max_half_life"));
        }
        if self.viable_min_win_rate > 1.0 {
            return Err(anyhow!("viable_min_win_rate must be a fraction in (0, 1]"));
        }
        if self.min_window < 2 {
            return Err(anyhow!("min_window must be at least 2"));
        }
        if self.min_half_life_observations < 3
            || self.min_observations < self.min_half_life_observations
        {
            return Err(anyhow!(
                "min_observations ({}) must be >= min_half_life_observations ({}) >= 3",
                self.min_observations,
                self.min_half_life_observations
            ));
        }
        if self.calibration_lookback < self.min_observations {
            return Err(anyhow!(
                "calibration_lookback ({}) must be >= min_observations ({})",
                self.calibration_lookback,
                self.min_observations
            ));
        }
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be at least 1"));
        }
        if self.breakdown_checks == 0 {
            return Err(anyhow!("breakdown_checks must be at least 1"));
        }
        if self.universe.is_empty() {
            return Err(anyhow!("universe produced no pairs"));
        }
        if let Some(rungs) = &self.scaling_ladder {
            validate_ladder(rungs, self.z_entry)?;
        }
        Ok(())
    }

    pub fn thresholds(&self) -> SignalThresholds {
        SignalThresholds {
            entry: self.z_entry,
            exit: self.z_exit,
            stop: self.z_stop,
            ladder: self
                .scaling_ladder
                .as_ref()
                .map(|rungs| ScalingLadder::new(rungs.clone())),
        }
    }

    pub fn verdict_cutoffs(&self) -> VerdictCutoffs {
        VerdictCutoffs {
            min_profit_factor: self.min_profit_factor,
            marginal_profit_factor: self.marginal_profit_factor_cutoff,
            min_win_rate: self.viable_min_win_rate,
        }
    }
}

fn override_parsed<G, T>(get: &G, key: &str, slot: &mut T) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = get(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {}={}: {}", key, value, e))?;
    }
    Ok(())
}

fn validate_ladder(rungs: &[ScaleRung], z_entry: f64) -> Result<()> {
    let first = rungs
        .first()
        .ok_or_else(|| anyhow!("scaling_ladder must not be empty"))?;
    if (first.trigger_z - z_entry).abs() > 1e-9 {
        return Err(anyhow!(
            "first scaling_ladder trigger ({}) must equal z_entry ({})",
            first.trigger_z,
            z_entry
        ));
    }
    for w in rungs.windows(2) {
        if w[1].trigger_z <= w[0].trigger_z {
            return Err(anyhow!("scaling_ladder triggers must be strictly increasing"));
        }
    }
    if rungs
        .iter()
        .any(|r| !r.weight.is_finite() || r.weight <= 0.0 || !r.trigger_z.is_finite())
    {
        return Err(anyhow!("scaling_ladder weights must be positive"));
    }
    let total: f64 = rungs.iter().map(|r| r.weight).sum();
    if (total - 1.0).abs() > LADDER_WEIGHT_TOLERANCE {
        return Err(anyhow!("scaling_ladder weights sum to {}, expected 1.0", total));
    }
    Ok(())
}

/// `"2.0:0.40,2.5:0.35,3.0:0.25"` → rungs.
fn parse_ladder(raw: &str) -> Result<Vec<ScaleRung>> {
    let mut rungs = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (trigger, weight) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid ladder rung: {}", trimmed))?;
        rungs.push(ScaleRung {
            trigger_z: trigger
                .trim()
                .parse()
                .with_context(|| format!("invalid ladder trigger: {}", trimmed))?,
            weight: weight
                .trim()
                .parse()
                .with_context(|| format!("invalid ladder weight: {}", trimmed))?,
        });
    }
    if rungs.is_empty() {
        return Err(anyhow!("SCALING_LADDER produced no rungs"));
    }
    Ok(rungs)
}

fn parse_symbols_vec(symbols: &[String]) -> Result<Vec<PairSpec>> {
    let syms: Vec<&str> = symbols
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let mut pairs = Vec::new();
    for i in 0..syms.len() {
        for j in (i + 1)..syms.len() {
            let (a, b) = if syms[i] < syms[j] {
                (syms[i], syms[j])
            } else {
                (syms[j], syms[i])
            };
            pairs.push(PairSpec::new(a, b));
        }
    }
    if pairs.is_empty() {
        return Err(anyhow!("UNIVERSE_SYMBOLS produced no valid pairs"));
    }
    Ok(pairs)
}

fn parse_pairs_list(raw: &str) -> Result<Vec<PairSpec>> {
    let mut pairs = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (a, b) = trimmed
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid pair: {}", trimmed))?;
        let (a, b) = (a.trim(), b.trim());
        if a.is_empty() || b.is_empty() || a == b {
            return Err(anyhow!("invalid pair: {}", trimmed));
        }
        pairs.push(PairSpec::new(a, b));
    }
    if pairs.is_empty() {
        return Err(anyhow!("UNIVERSE_PAIRS produced no valid pairs"));
    }
    Ok(pairs)
}
