use anyhow::Result;
use k8s_openapi::api::core::v1::{ContainerStatus, PersistentVolumeClaim, Pod, Service};

use keel_core::{HealthStatus, HealthStatusCode, Manifest};

use crate::convert;

/// Ingress shape differs across `extensions`/`networking.k8s.io` versions; only the
/// load balancer status matters here, so it is read from the raw body.
pub(crate) fn ingress(obj: &Manifest) -> Result<HealthStatus> {
    let assigned = obj
        .data
        .pointer("/status/loadBalancer/ingress")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    Ok(if assigned { HealthStatus::healthy() } else { HealthStatus::progressing("") })
}

pub(crate) fn service(obj: &Manifest) -> Result<HealthStatus> {
    let svc: Service = convert(obj)?;
    let is_lb = svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
    if !is_lb {
        return Ok(HealthStatus::healthy());
    }
    let ingress = svc
        .status
        .and_then(|s| s.load_balancer)
        .and_then(|lb| lb.ingress)
        .unwrap_or_default();
    Ok(if ingress.is_empty() { HealthStatus::progressing("") } else { HealthStatus::healthy() })
}

pub(crate) fn pvc(obj: &Manifest) -> Result<HealthStatus> {
    let claim: PersistentVolumeClaim = convert(obj)?;
    let phase = claim.status.and_then(|s| s.phase).unwrap_or_default();
    let code = match phase.as_str() {
        "Lost" => HealthStatusCode::Degraded,
        "Pending" => HealthStatusCode::Progressing,
        "Bound" => HealthStatusCode::Healthy,
        _ => HealthStatusCode::Unknown,
    };
    Ok(HealthStatus::new(code, ""))
}

fn crash_waiting_reason(reason: &str) -> bool {
    reason.starts_with("Err") || reason.ends_with("Error") || reason.ends_with("BackOff")
}

fn terminated_badly(ctr: &ContainerStatus) -> Option<String> {
    let t = ctr.state.as_ref()?.terminated.as_ref()?;
    if let Some(msg) = t.message.as_deref().filter(|m| !m.is_empty()) {
        return Some(msg.to_string());
    }
    if t.reason.as_deref() == Some("OOMKilled") {
        return Some("OOMKilled".to_string());
    }
    if t.exit_code != 0 {
        return Some(format!("container {:?} failed with exit code {}", ctr.name, t.exit_code));
    }
    None
}

/// Pods restarted forever are judged on readiness and crash loops. Pods with
/// `OnFailure`/`Never` are finite (typically hooks) and stay Progressing while running.
pub(crate) fn pod(obj: &Manifest) -> Result<HealthStatus> {
    let pod: Pod = convert(obj)?;
    let restart_policy = pod.spec.as_ref().and_then(|s| s.restart_policy.clone()).unwrap_or_else(|| "Always".into());
    let status = pod.status.unwrap_or_default();
    let message = status.message.clone().unwrap_or_default();
    let init = status.init_container_statuses.clone().unwrap_or_default();
    let main = status.container_statuses.clone().unwrap_or_default();

    if restart_policy == "Always" {
        let waiting: Vec<String> = init
            .iter()
            .chain(main.iter())
            .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
            .filter(|w| w.reason.as_deref().map(crash_waiting_reason).unwrap_or(false))
            .map(|w| w.message.clone().unwrap_or_default())
            .collect();
        if !waiting.is_empty() {
            return Ok(HealthStatus::degraded(waiting.join(", ")));
        }
    }

    match status.phase.as_deref().unwrap_or_default() {
        "Pending" => Ok(HealthStatus::progressing(message)),
        "Succeeded" => Ok(HealthStatus::new(HealthStatusCode::Healthy, message)),
        "Failed" => {
            if !message.is_empty() {
                return Ok(HealthStatus::degraded(message));
            }
            let first = init.iter().chain(main.iter()).find_map(terminated_badly);
            Ok(HealthStatus::degraded(first.unwrap_or_default()))
        }
        "Running" if restart_policy == "Always" => {
            let ready = status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            if ready {
                return Ok(HealthStatus::new(HealthStatusCode::Healthy, message));
            }
            let crashed = main.iter().any(|c| {
                c.last_state.as_ref().and_then(|s| s.terminated.as_ref()).is_some() || terminated_badly(c).is_some()
            });
            if crashed || init.iter().any(|c| terminated_badly(c).is_some()) {
                return Ok(HealthStatus::degraded(message));
            }
            Ok(HealthStatus::progressing(message))
        }
        "Running" => Ok(HealthStatus::progressing(message)),
        _ => Ok(HealthStatus::unknown(message)),
    }
}
