use std::fmt;

use kiln_core::backend::Backend;
use kiln_core::error::Result;
use kiln_core::tensor::Tensor;
use kiln_core::{bail, Error};
use kiln_graph::Graph;

use crate::config::{ExecutionMode, JobConfig};
use crate::job::JobBuilder;
use crate::session::Session;

// Closeness — numeric agreement between execution backends
//
// Backends are allowed to differ in evaluation order, fusion, and
// intermediate precision, so agreement is bounded, not bitwise:
//
//   |a - b| <= atol + rtol * |b|     (elementwise)
//
// The default tolerances are the ones operator cross-checks conventionally
// use for f32 math: rtol 1e-3 absorbs relative drift in normalized values,
// atol 1e-5 absorbs noise around zero where a relative bound is useless.

/// Default relative tolerance for backend agreement.
pub const DEFAULT_RTOL: f64 = 1e-3;
/// Default absolute tolerance for backend agreement.
pub const DEFAULT_ATOL: f64 = 1e-5;

/// Elementwise bounded-deviation check, `|a - b| <= atol + rtol * |b|`.
/// Slices of different lengths are never close.
pub fn allclose(a: &[f64], b: &[f64], rtol: f64, atol: f64) -> bool {
    compare(a, b, rtol, atol).passed
}

/// Detailed closeness result between two value slices.
#[derive(Debug, Clone)]
pub struct ClosenessReport {
    pub passed: bool,
    /// Largest |a - b| over all elements.
    pub max_abs_diff: f64,
    /// Largest |a - b| / (|b| + atol) over all elements.
    pub max_rel_diff: f64,
    /// First element index violating the bound, if any.
    pub first_mismatch: Option<usize>,
    /// Lengths compared; a length mismatch fails without element stats.
    pub len: (usize, usize),
}

impl fmt::Display for ClosenessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len.0 != self.len.1 {
            return write!(f, "length mismatch: {} vs {}", self.len.0, self.len.1);
        }
        if self.passed {
            write!(
                f,
                "close ({} elements, max abs diff {:.3e})",
                self.len.0, self.max_abs_diff
            )
        } else {
            write!(
                f,
                "diverged at element {} (max abs diff {:.3e}, max rel diff {:.3e})",
                self.first_mismatch.unwrap_or(0),
                self.max_abs_diff,
                self.max_rel_diff
            )
        }
    }
}

/// Compare two slices under the bounded-deviation rule.
pub fn compare(a: &[f64], b: &[f64], rtol: f64, atol: f64) -> ClosenessReport {
    if a.len() != b.len() {
        return ClosenessReport {
            passed: false,
            max_abs_diff: f64::INFINITY,
            max_rel_diff: f64::INFINITY,
            first_mismatch: Some(0),
            len: (a.len(), b.len()),
        };
    }
    let mut max_abs = 0.0f64;
    let mut max_rel = 0.0f64;
    let mut first_mismatch = None;
    for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
        let abs = (x - y).abs();
        max_abs = max_abs.max(abs);
        max_rel = max_rel.max(abs / (y.abs() + atol));
        if abs > atol + rtol * y.abs() && first_mismatch.is_none() {
            first_mismatch = Some(i);
        }
    }
    ClosenessReport {
        passed: first_mismatch.is_none(),
        max_abs_diff: max_abs,
        max_rel_diff: max_rel,
        first_mismatch,
        len: (a.len(), b.len()),
    }
}

// BackendComparison — the cross-backend agreement driver
//
// Given one graph and one set of concrete inputs, the driver compiles a
// fresh job per execution mode (each with its own JobConfig — nothing is
// shared or mutated between declarations), invokes every job with the same
// inputs inside a session scope, and checks each non-baseline result
// against the baseline. The scope guarantees the session is cleared
// afterwards whether or not the check passes.

/// Runs one graph under several execution modes and checks agreement.
#[derive(Debug, Clone)]
pub struct BackendComparison {
    modes: Vec<ExecutionMode>,
    rtol: f64,
    atol: f64,
}

impl Default for BackendComparison {
    fn default() -> Self {
        BackendComparison {
            modes: vec![ExecutionMode::Baseline, ExecutionMode::Jit],
            rtol: DEFAULT_RTOL,
            atol: DEFAULT_ATOL,
        }
    }
}

impl BackendComparison {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which modes to run. The first is the reference the rest are checked
    /// against; include `Baseline` first for the conventional setup.
    pub fn with_modes(mut self, modes: &[ExecutionMode]) -> Self {
        self.modes = modes.to_vec();
        self
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    /// Compile one job per mode, run all with `inputs`, and check every
    /// non-reference output against the reference mode's. Returns the
    /// per-mode reports on success; the first divergence is an error
    /// carrying the failing mode and report.
    pub fn check<B: Backend>(
        &self,
        session: &mut Session<B>,
        graph: &Graph,
        inputs: &[Tensor<B>],
    ) -> Result<Vec<(ExecutionMode, ClosenessReport)>> {
        if self.modes.len() < 2 {
            bail!("backend comparison needs at least two execution modes");
        }
        let reference_mode = self.modes[0];

        session.scope(|session| {
            let mut results: Vec<(ExecutionMode, Vec<Vec<f64>>)> = Vec::new();
            for &mode in &self.modes {
                let config = JobConfig::new().with_mode(mode);
                let name = format!("compare_{}", mode);
                session.compile(JobBuilder::new(&name, config, graph.clone()))?;
                let batch = session.job(&name)?.invoke(inputs)?;
                let outputs = batch
                    .iter()
                    .map(|(_, t)| t.to_f64_vec())
                    .collect::<Result<Vec<_>>>()?;
                results.push((mode, outputs));
            }

            let (_, reference) = &results[0];
            let mut reports = Vec::new();
            for (mode, outputs) in &results[1..] {
                for (got, want) in outputs.iter().zip(reference.iter()) {
                    let report = compare(got, want, self.rtol, self.atol);
                    if !report.passed {
                        return Err(Error::msg(format!(
                            "{} disagrees with {}: {}",
                            mode, reference_mode, report
                        )));
                    }
                    reports.push((*mode, report));
                }
            }
            Ok(reports)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_slices_are_close() {
        let a = [1.0, 2.0, 3.0];
        assert!(allclose(&a, &a, DEFAULT_RTOL, DEFAULT_ATOL));
    }

    #[test]
    fn zero_neighborhood_uses_atol() {
        // Relative tolerance alone would reject any nonzero diff near 0.
        let a = [0.0];
        let b = [5e-6];
        assert!(allclose(&a, &b, DEFAULT_RTOL, DEFAULT_ATOL));
        let c = [5e-4];
        assert!(!allclose(&a, &c, DEFAULT_RTOL, DEFAULT_ATOL));
    }

    #[test]
    fn large_values_use_rtol() {
        let a = [1000.0];
        let b = [1000.5]; // rel diff 5e-4 < 1e-3
        assert!(allclose(&a, &b, DEFAULT_RTOL, DEFAULT_ATOL));
        let c = [1002.0]; // rel diff 2e-3 > 1e-3
        assert!(!allclose(&a, &c, DEFAULT_RTOL, DEFAULT_ATOL));
    }

    #[test]
    fn length_mismatch_fails() {
        let report = compare(&[1.0], &[1.0, 2.0], DEFAULT_RTOL, DEFAULT_ATOL);
        assert!(!report.passed);
        assert_eq!(report.len, (1, 2));
    }

    #[test]
    fn report_pinpoints_first_mismatch() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 2.0, 9.0, 9.0];
        let report = compare(&a, &b, DEFAULT_RTOL, DEFAULT_ATOL);
        assert!(!report.passed);
        assert_eq!(report.first_mismatch, Some(2));
        assert!(report.to_string().contains("diverged"));
    }
}
