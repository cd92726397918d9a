//! Versioned regression calibration table.
//!
//! Coefficients are offline-calibrated data, not logic. The built-in table
//! ships as `calibration/v1.toml`; a replacement can be loaded from disk
//! without touching the estimator.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use gridlb_core::{ExecutionStats, Params};

use crate::error::{EstimatorError, EstimatorResult};

const BUILTIN_V1: &str = include_str!("../calibration/v1.toml");

/// All per-workload models of one calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub version: u32,
    /// Keyed by lowercase workload name.
    pub workloads: HashMap<String, WorkloadModel>,
}

/// Regression model for a single workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadModel {
    /// Predicts executed instructions from parameters.
    pub instructions: LinearPredictor,
    /// Predicts executed methods from parameters.
    pub methods: LinearPredictor,
    pub instruction_divisor: f64,
    pub instruction_weight: f64,
    /// Reconciles measured and approximated scores before admission.
    pub normalization: f64,
    pub measured: MeasuredModel,
}

/// `intercept + Σ coef·param + Σ coef·[param == value]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub intercept: f64,
    #[serde(default)]
    pub numeric: BTreeMap<String, f64>,
    #[serde(default)]
    pub categorical: Vec<CategoricalTerm>,
}

/// One-hot indicator term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoricalTerm {
    pub param: String,
    pub value: String,
    pub coefficient: f64,
}

/// Converts measured execution statistics into a complexity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasuredModel {
    pub reads_divisor: f64,
    pub reads_weight: f64,
}

impl CalibrationTable {
    /// The table compiled into this binary.
    pub fn builtin() -> EstimatorResult<Self> {
        Self::parse(BUILTIN_V1)
    }

    pub fn from_file(path: &Path) -> EstimatorResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EstimatorError::Calibration(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> EstimatorResult<Self> {
        let mut table: CalibrationTable =
            toml::from_str(content).map_err(|e| EstimatorError::Calibration(e.to_string()))?;
        table.workloads = table
            .workloads
            .into_iter()
            .map(|(name, model)| (name.to_ascii_lowercase(), model))
            .collect();

        for (name, model) in &table.workloads {
            if model.instruction_divisor == 0.0 || model.measured.reads_divisor == 0.0 {
                return Err(EstimatorError::Calibration(format!(
                    "workload {name} has a zero divisor"
                )));
            }
        }
        Ok(table)
    }

    /// Model for `workload` (case-insensitive).
    pub fn model(&self, workload: &str) -> EstimatorResult<&WorkloadModel> {
        self.workloads
            .get(&workload.to_ascii_lowercase())
            .ok_or_else(|| EstimatorError::UnsupportedWorkload(workload.to_string()))
    }
}

impl WorkloadModel {
    /// Closed-form fallback estimate from request parameters.
    ///
    /// Always at least 1 so that every admitted request occupies capacity.
    pub fn approximate(&self, workload: &str, params: &Params) -> EstimatorResult<u64> {
        let instructions = self.instructions.evaluate(workload, params)?;
        let methods = self.methods.evaluate(workload, params)?;
        let raw = (instructions / self.instruction_divisor) * self.instruction_weight + methods;
        Ok(to_score(raw))
    }

    /// Complexity of a finished execution.
    pub fn measured_complexity(&self, stats: &ExecutionStats) -> u64 {
        let raw = (stats.ndata_reads as f64 / self.measured.reads_divisor)
            * self.measured.reads_weight
            + stats.nmethod as f64;
        to_score(raw)
    }

    /// Apply the workload's normalization factor.
    pub fn normalize(&self, raw: u64) -> u64 {
        to_score(raw as f64 * self.normalization)
    }
}

impl LinearPredictor {
    fn evaluate(&self, workload: &str, params: &Params) -> EstimatorResult<f64> {
        let mut total = self.intercept;

        for (param, coefficient) in &self.numeric {
            let raw = require(workload, params, param)?;
            let value: f64 = raw.trim().parse().map_err(|_| EstimatorError::InvalidParameter {
                workload: workload.to_string(),
                param: param.clone(),
                reason: format!("expected a number, got {raw:?}"),
            })?;
            total += coefficient * value;
        }

        for term in &self.categorical {
            if require(workload, params, &term.param)? == term.value {
                total += term.coefficient;
            }
        }

        Ok(total)
    }
}

fn require<'a>(workload: &str, params: &'a Params, param: &str) -> EstimatorResult<&'a str> {
    params
        .get(param)
        .map(String::as_str)
        .ok_or_else(|| EstimatorError::InvalidParameter {
            workload: workload.to_string(),
            param: param.to_string(),
            reason: "missing".to_string(),
        })
}

fn to_score(raw: f64) -> u64 {
    if raw.is_finite() && raw >= 1.0 {
        raw.round() as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builtin_table_parses() {
        let table = CalibrationTable::builtin().unwrap();
        assert_eq!(table.version, 1);
        assert!(table.model("fifteenpuzzle").is_ok());
        assert!(table.model("capturetheflag").is_ok());
        assert!(table.model("gameoflife").is_ok());
    }

    #[test]
    fn model_lookup_is_case_insensitive() {
        let table = CalibrationTable::builtin().unwrap();
        assert!(table.model("FifteenPuzzle").is_ok());
        assert!(table.model("GameOfLife").is_ok());
    }

    #[test]
    fn unknown_workload_is_rejected() {
        let table = CalibrationTable::builtin().unwrap();
        assert!(matches!(
            table.model("sudoku"),
            Err(EstimatorError::UnsupportedWorkload(name)) if name == "sudoku"
        ));
    }

    #[test]
    fn game_of_life_approximation() {
        let table = CalibrationTable::builtin().unwrap();
        let model = table.model("gameoflife").unwrap();
        let score = model
            .approximate("gameoflife", &params(&[("iterations", "10")]))
            .unwrap();

        let instructions: f64 = 3870.0 + 54698.0 * 10.0;
        let methods = 11.0 + 101.0 * 10.0;
        let expected = ((instructions / 541.5605) * 7.85 + methods).round() as u64;
        assert_eq!(score, expected);
    }

    #[test]
    fn capture_the_flag_uses_categorical_terms() {
        let table = CalibrationTable::builtin().unwrap();
        let model = table.model("capturetheflag").unwrap();
        let base = [("gridSize", "30"), ("numBlueAgents", "20"), ("numRedAgents", "20")];

        let mut a = params(&base);
        a.insert("flagPlacementType".into(), "A".into());
        let mut b = params(&base);
        b.insert("flagPlacementType".into(), "B".into());

        let score_a = model.approximate("capturetheflag", &a).unwrap();
        let score_b = model.approximate("capturetheflag", &b).unwrap();
        assert!(score_b < score_a);
    }

    #[test]
    fn missing_parameter_is_rejected() {
        let table = CalibrationTable::builtin().unwrap();
        let model = table.model("fifteenpuzzle").unwrap();
        let err = model
            .approximate("fifteenpuzzle", &params(&[("size", "4")]))
            .unwrap_err();
        assert!(matches!(err, EstimatorError::InvalidParameter { param, .. } if param == "shuffles"));
    }

    #[test]
    fn non_numeric_parameter_is_rejected() {
        let table = CalibrationTable::builtin().unwrap();
        let model = table.model("gameoflife").unwrap();
        let err = model
            .approximate("gameoflife", &params(&[("iterations", "lots")]))
            .unwrap_err();
        assert!(matches!(err, EstimatorError::InvalidParameter { .. }));
    }

    #[test]
    fn negative_predictions_clamp_to_one() {
        let table = CalibrationTable::builtin().unwrap();
        let model = table.model("fifteenpuzzle").unwrap();
        // Few shuffles sit left of the fitted line's x-intercept.
        let score = model
            .approximate("fifteenpuzzle", &params(&[("shuffles", "1"), ("size", "4")]))
            .unwrap();
        assert_eq!(score, 1);
    }

    #[test]
    fn normalization_scales_scores() {
        let table = CalibrationTable::builtin().unwrap();
        assert_eq!(table.model("gameoflife").unwrap().normalize(100), 184);
        assert_eq!(table.model("capturetheflag").unwrap().normalize(100), 100);
    }

    #[test]
    fn measured_complexity_formula() {
        let table = CalibrationTable::builtin().unwrap();
        let model = table.model("gameoflife").unwrap();
        let stats = ExecutionStats {
            nmethod: 1_000,
            ndata_reads: 39_840,
            ..Default::default()
        };
        let expected = ((39_840.0 / 39.8408) * 8.83 + 1_000.0_f64).round() as u64;
        assert_eq!(model.measured_complexity(&stats), expected);
    }

    #[test]
    fn custom_table_overrides_builtin() {
        let toml = r#"
            version = 2

            [workloads.Echo]
            instruction_divisor = 1.0
            instruction_weight = 1.0
            normalization = 2.0

            [workloads.Echo.instructions]
            intercept = 10.0
            numeric = { n = 5.0 }

            [workloads.Echo.methods]
            intercept = 0.0

            [workloads.Echo.measured]
            reads_divisor = 1.0
            reads_weight = 1.0
        "#;
        let table = CalibrationTable::parse(toml).unwrap();
        assert_eq!(table.version, 2);
        let model = table.model("echo").unwrap();
        assert_eq!(model.approximate("echo", &params(&[("n", "2")])).unwrap(), 20);
        assert!(table.model("gameoflife").is_err());
    }

    #[test]
    fn zero_divisor_is_rejected() {
        let toml = r#"
            version = 1
            [workloads.bad]
            instruction_divisor = 0.0
            instruction_weight = 1.0
            normalization = 1.0
            [workloads.bad.instructions]
            intercept = 0.0
            [workloads.bad.methods]
            intercept = 0.0
            [workloads.bad.measured]
            reads_divisor = 1.0
            reads_weight = 1.0
        "#;
        assert!(matches!(
            CalibrationTable::parse(toml),
            Err(EstimatorError::Calibration(_))
        ));
    }
}
