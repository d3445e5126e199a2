//! Joining static targets with captured traces.
//!
//! The join key is `(bare function name, absolute file path)`. An INPUT
//! trace overrides the statically extracted prompt, since the runtime
//! value is ground truth when the prompt was built by interpolation.
//! Targets with no observed OUTPUT are dropped: unreached functions are
//! never synthesized.

use crate::scan::{self, Target};
use crate::trace::{TraceRecord, KIND_INPUT, KIND_OUTPUT};
use crate::util::truncate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Scan the tree and enrich the static targets with the captured traces.
pub fn scan_and_merge(root: &Path, traces: Vec<TraceRecord>) -> Vec<Target> {
    merge(scan::scan_targets(root), traces)
}

pub fn merge(mut targets: Vec<Target>, traces: Vec<TraceRecord>) -> Vec<Target> {
    let index: HashMap<(String, PathBuf), usize> = targets
        .iter()
        .enumerate()
        .map(|(i, t)| ((t.func_name.clone(), t.file.clone()), i))
        .collect();

    for record in traces {
        let key = (record.function.clone(), record.file.clone());
        let Some(&i) = index.get(&key) else {
            // Trace for a function the scanner never saw: dropped.
            continue;
        };
        match record.kind.as_str() {
            KIND_INPUT => {
                targets[i].prompt = match serde_json::from_str::<String>(record.value.get()) {
                    Ok(s) if !s.is_empty() => s,
                    _ => record.value.get().to_string(),
                };
            }
            KIND_OUTPUT => {
                targets[i].output =
                    match serde_json::from_str::<serde_json::Value>(record.value.get()) {
                        Ok(v) => serde_json::to_string_pretty(&v)
                            .unwrap_or_else(|_| record.value.get().to_string()),
                        Err(_) => record.value.get().to_string(),
                    };
            }
            _ => {}
        }
    }

    targets.retain(|t| !t.output.is_empty());
    for t in &targets {
        println!(
            "\t[data] {}: input=\"{}\", output captured",
            t.func_name,
            truncate(&t.prompt, 80)
        );
    }
    targets
}
