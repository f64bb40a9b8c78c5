//! Gate evaluation over a recorded cell run.
//!
//! Re-derives a cell's verdict from its ledger events alone, so a stored run
//! can be checked without trusting its summary.

use std::collections::HashMap;

use matrixci_core::RunEvent;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Cell gate rules.
pub struct CiGate;

impl CiGate {
    /// Evaluate whether a cell run passed.
    ///
    /// Gate rule:
    /// - Every `step_started` must be closed by `step_finished` or `step_failed`
    /// - A `step_failed` without `continued` is a violation
    /// - The run must end with `cell_finished` whose status is `completed`
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();

        // index -> step name, for steps started but not yet closed
        let mut open: HashMap<u64, String> = HashMap::new();
        let mut finished = 0usize;
        let mut tolerated = 0usize;
        let mut cell_status: Option<String> = None;

        for event in events {
            let step = event.payload["step"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            let index = event.payload["index"].as_u64().unwrap_or(u64::MAX);

            match event.kind.as_str() {
                "step_started" => {
                    open.insert(index, step);
                }
                "step_finished" => {
                    open.remove(&index);
                    finished += 1;
                }
                "step_failed" => {
                    open.remove(&index);
                    if event.payload["continued"].as_bool().unwrap_or(false) {
                        tolerated += 1;
                        continue;
                    }
                    let error = event.payload["error"]
                        .as_str()
                        .unwrap_or("unknown error")
                        .to_string();
                    violations.push(format!("Step '{}' failed: {}", step, error));
                }
                "cell_finished" => {
                    cell_status = event.payload["status"].as_str().map(str::to_string);
                }
                _ => {}
            }
        }

        let mut unclosed: Vec<_> = open.into_iter().collect();
        unclosed.sort();
        for (_, step) in unclosed {
            violations.push(format!("Step '{}' was started but never completed", step));
        }

        match cell_status.as_deref() {
            Some("completed") => {}
            Some(status) => {
                if violations.is_empty() {
                    violations.push(format!("Cell finished with status '{}'", status));
                }
            }
            None => violations.push("Cell never finished".to_string()),
        }

        let passed = violations.is_empty();
        let message = if passed && tolerated > 0 {
            format!(
                "{} steps passed, {} failures tolerated by continue_on_error",
                finished, tolerated
            )
        } else if passed {
            format!("All {} steps passed", finished)
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}
