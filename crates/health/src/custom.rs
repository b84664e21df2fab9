use anyhow::{anyhow, Result};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;

use keel_core::{HealthStatus, HealthStatusCode, Manifest};

use crate::{convert, str_at};

pub(crate) fn api_service(obj: &Manifest) -> Result<HealthStatus> {
    let svc: APIService = convert(obj)?;
    let conditions = svc.status.and_then(|s| s.conditions).unwrap_or_default();
    match conditions.iter().find(|c| c.type_ == "Available") {
        Some(c) => {
            let msg = format!(
                "{}: {}",
                c.reason.as_deref().unwrap_or_default(),
                c.message.as_deref().unwrap_or_default()
            );
            Ok(if c.status == "True" {
                HealthStatus::new(HealthStatusCode::Healthy, msg)
            } else {
                HealthStatus::progressing(msg)
            })
        }
        None => Ok(HealthStatus::progressing("Waiting to be processed")),
    }
}

/// Nested applications report their own aggregated health.
pub(crate) fn application(obj: &Manifest) -> Result<HealthStatus> {
    let code = match str_at(obj, &["status", "health", "status"]).unwrap_or_default() {
        "Healthy" => HealthStatusCode::Healthy,
        "Suspended" => HealthStatusCode::Suspended,
        "Progressing" => HealthStatusCode::Progressing,
        "Degraded" => HealthStatusCode::Degraded,
        "Missing" => HealthStatusCode::Missing,
        "Unknown" | "" => HealthStatusCode::Unknown,
        other => return Err(anyhow!("unrecognized application health {other:?}")),
    };
    let message = str_at(obj, &["status", "health", "message"]).unwrap_or_default();
    Ok(HealthStatus::new(code, message))
}

/// Workflows are judged on `status.phase` only, independent of API version.
pub(crate) fn workflow(obj: &Manifest) -> Result<HealthStatus> {
    let message = str_at(obj, &["status", "message"]).unwrap_or_default();
    let code = match str_at(obj, &["status", "phase"]).unwrap_or_default() {
        "Pending" | "Running" => HealthStatusCode::Progressing,
        "Failed" | "Error" => HealthStatusCode::Degraded,
        _ => HealthStatusCode::Healthy,
    };
    Ok(HealthStatus::new(code, message))
}
