use anyhow::Result;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};

use keel_core::{HealthStatus, HealthStatusCode, Manifest};

use crate::convert;

pub(crate) fn deployment(obj: &Manifest) -> Result<HealthStatus> {
    let d: Deployment = convert(obj)?;
    let spec = d.spec.unwrap_or_default();
    let status = d.status.unwrap_or_default();
    if spec.paused.unwrap_or(false) {
        return Ok(HealthStatus::new(HealthStatusCode::Suspended, "Deployment is paused"));
    }
    if d.metadata.generation.unwrap_or(0) > status.observed_generation.unwrap_or(0) {
        return Ok(HealthStatus::progressing(
            "Waiting for rollout to finish: observed deployment generation less then desired generation",
        ));
    }
    let progressing = status.conditions.iter().flatten().find(|c| c.type_ == "Progressing");
    if progressing.and_then(|c| c.reason.as_deref()) == Some("ProgressDeadlineExceeded") {
        let name = d.metadata.name.unwrap_or_default();
        return Ok(HealthStatus::degraded(format!("Deployment {name:?} exceeded its progress deadline")));
    }
    let updated = status.updated_replicas.unwrap_or(0);
    let replicas = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if let Some(desired) = spec.replicas {
        if updated < desired {
            return Ok(HealthStatus::progressing(format!(
                "Waiting for rollout to finish: {updated} out of {desired} new replicas have been updated..."
            )));
        }
    }
    if replicas > updated {
        return Ok(HealthStatus::progressing(format!(
            "Waiting for rollout to finish: {} old replicas are pending termination...",
            replicas - updated
        )));
    }
    if available < updated {
        return Ok(HealthStatus::progressing(format!(
            "Waiting for rollout to finish: {available} of {updated} updated replicas are available..."
        )));
    }
    Ok(HealthStatus::healthy())
}

pub(crate) fn stateful_set(obj: &Manifest) -> Result<HealthStatus> {
    let sts: StatefulSet = convert(obj)?;
    let spec = sts.spec.unwrap_or_default();
    let status = sts.status.unwrap_or_default();
    let observed = status.observed_generation.unwrap_or(0);
    if observed == 0 || sts.metadata.generation.unwrap_or(0) > observed {
        return Ok(HealthStatus::progressing("Waiting for statefulset spec update to be observed..."));
    }
    let ready = status.ready_replicas.unwrap_or(0);
    if let Some(desired) = spec.replicas {
        if ready < desired {
            return Ok(HealthStatus::progressing(format!("Waiting for {} pods to be ready...", desired - ready)));
        }
    }
    let updated = status.updated_replicas.unwrap_or(0);
    let strategy = spec.update_strategy.unwrap_or_default();
    if strategy.type_.as_deref().unwrap_or("RollingUpdate") == "RollingUpdate" {
        if let Some(rolling) = strategy.rolling_update {
            if let (Some(desired), Some(partition)) = (spec.replicas, rolling.partition) {
                if updated < desired - partition {
                    return Ok(HealthStatus::progressing(format!(
                        "Waiting for partitioned roll out to finish: {updated} out of {} new pods have been updated...",
                        desired - partition
                    )));
                }
            }
            return Ok(HealthStatus::new(
                HealthStatusCode::Healthy,
                format!("partitioned roll out complete: {updated} new pods have been updated..."),
            ));
        }
    }
    let update_revision = status.update_revision.unwrap_or_default();
    let current_revision = status.current_revision.unwrap_or_default();
    if update_revision != current_revision {
        return Ok(HealthStatus::progressing(format!(
            "waiting for statefulset rolling update to complete {updated} pods at revision {update_revision}..."
        )));
    }
    Ok(HealthStatus::new(
        HealthStatusCode::Healthy,
        format!(
            "statefulset rolling update complete {} pods at revision {current_revision}...",
            status.current_replicas.unwrap_or(0)
        ),
    ))
}

pub(crate) fn replica_set(obj: &Manifest) -> Result<HealthStatus> {
    let rs: ReplicaSet = convert(obj)?;
    let spec = rs.spec.unwrap_or_default();
    let status = rs.status.unwrap_or_default();
    if rs.metadata.generation.unwrap_or(0) > status.observed_generation.unwrap_or(0) {
        return Ok(HealthStatus::progressing(
            "Waiting for rollout to finish: observed replica set generation less then desired generation",
        ));
    }
    let failure = status.conditions.iter().flatten().find(|c| c.type_ == "ReplicaFailure" && c.status == "True");
    if let Some(c) = failure {
        return Ok(HealthStatus::degraded(c.message.clone().unwrap_or_default()));
    }
    let available = status.available_replicas.unwrap_or(0);
    if let Some(desired) = spec.replicas {
        if available < desired {
            return Ok(HealthStatus::progressing(format!(
                "Waiting for rollout to finish: {available} out of {desired} new replicas are available..."
            )));
        }
    }
    Ok(HealthStatus::healthy())
}

pub(crate) fn daemon_set(obj: &Manifest) -> Result<HealthStatus> {
    let ds: DaemonSet = convert(obj)?;
    let status = ds.status.unwrap_or_default();
    if ds.metadata.generation.unwrap_or(0) > status.observed_generation.unwrap_or(0) {
        return Ok(HealthStatus::progressing(
            "Waiting for rollout to finish: observed daemon set generation less then desired generation",
        ));
    }
    let name = ds.metadata.name.unwrap_or_default();
    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    if updated < desired {
        return Ok(HealthStatus::progressing(format!(
            "Waiting for daemon set {name:?} rollout to finish: {updated} out of {desired} new pods have been updated..."
        )));
    }
    let available = status.number_available.unwrap_or(0);
    if available < desired {
        return Ok(HealthStatus::progressing(format!(
            "Waiting for daemon set {name:?} rollout to finish: {available} of {desired} updated pods are available..."
        )));
    }
    Ok(HealthStatus::healthy())
}
