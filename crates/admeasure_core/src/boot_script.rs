//! User data handed to every runner VM.
//!
//! The script is a pure function of the plan and the runner URL so that it
//! can be compared byte-for-byte against a checked-in fixture.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::plan::{MeasurementPlan, PlanError};

pub const RUNNER_HEAP_MB: u32 = 8192;

pub fn build_boot_script(plan: &MeasurementPlan, resource_url: &str) -> Result<String, PlanError> {
    let encoded_plan = STANDARD.encode(plan.to_json()?);
    let lines = [
        "#!/usr/bin/bash".to_string(),
        "set -e".to_string(),
        "set -x".to_string(),
        String::new(),
        "cd /root".to_string(),
        format!("echo {encoded_plan} | base64 --decode > plan.json"),
        format!("curl {resource_url} -o main.js"),
        format!(
            "DEBUG=pw:browser xvfb-run -a node --max-old-space-size={RUNNER_HEAP_MB} main.js run"
        ),
        "self-destroy".to_string(),
    ];
    Ok(lines.join("\n"))
}
