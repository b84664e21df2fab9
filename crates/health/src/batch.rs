use anyhow::Result;
use k8s_openapi::api::batch::v1::Job;

use keel_core::{HealthStatus, HealthStatusCode, Manifest};

use crate::convert;

pub(crate) fn job(obj: &Manifest) -> Result<HealthStatus> {
    let job: Job = convert(obj)?;
    let conditions = job.status.and_then(|s| s.conditions).unwrap_or_default();
    let mut failed: Option<String> = None;
    let mut complete: Option<String> = None;
    for c in conditions.iter().filter(|c| c.status != "False") {
        match c.type_.as_str() {
            "Failed" => failed = Some(c.message.clone().unwrap_or_default()),
            "Complete" => complete = Some(c.message.clone().unwrap_or_default()),
            _ => {}
        }
    }
    Ok(match (failed, complete) {
        (Some(msg), _) => HealthStatus::degraded(msg),
        (None, Some(msg)) => HealthStatus::new(HealthStatusCode::Healthy, msg),
        (None, None) => HealthStatus::progressing(""),
    })
}
