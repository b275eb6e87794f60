//! Kubernetes object bodies for a sandbox: one Job (testbed + sidecar containers
//! sharing a volume) and one Service in front of the sidecar.

use crate::cluster::{JobRequest, ServiceRequest};
use crate::exec::shared_volume::{testbed_loop_script, DEFAULT_SHARED_DIR, READY_MARKER};
use serde_json::{json, Value};

pub const TESTBED_CONTAINER: &str = "testbed";
pub const SIDECAR_CONTAINER: &str = "sidecar";

const SHARED_VOLUME: &str = "shared";

pub fn job_manifest(request: &JobRequest) -> Value {
    let shared_mount = json!([{ "name": SHARED_VOLUME, "mountPath": DEFAULT_SHARED_DIR }]);
    let r = &request.resources;

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": request.name,
            "labels": request.labels,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": request.labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [
                        {
                            "name": TESTBED_CONTAINER,
                            "image": request.testbed_image,
                            "command": ["/bin/bash", "-c", testbed_loop_script(DEFAULT_SHARED_DIR)],
                            "resources": {
                                "requests": { "cpu": r.cpu_request, "memory": r.memory_request },
                                "limits": { "cpu": r.cpu_limit, "memory": r.memory_limit },
                            },
                            "readinessProbe": {
                                "exec": { "command": ["test", "-f", format!("{DEFAULT_SHARED_DIR}/{READY_MARKER}")] },
                                "periodSeconds": 2,
                            },
                            "volumeMounts": shared_mount,
                        },
                        {
                            "name": SIDECAR_CONTAINER,
                            "image": request.sidecar_image,
                            "env": [
                                { "name": "TESTBEDS_AGENT_PORT", "value": request.agent_port.to_string() },
                                { "name": "TESTBEDS_AGENT_CHANNEL", "value": "shared-volume" },
                                { "name": "TESTBEDS_SHARED_DIR", "value": DEFAULT_SHARED_DIR },
                                { "name": "POD_NAME", "valueFrom": { "fieldRef": { "fieldPath": "metadata.name" } } },
                            ],
                            "ports": [{ "containerPort": request.agent_port }],
                            "readinessProbe": {
                                "httpGet": { "path": "/health", "port": request.agent_port },
                                "initialDelaySeconds": 1,
                                "periodSeconds": 2,
                            },
                            "resources": {
                                "requests": { "cpu": "50m", "memory": "50Mi" },
                                "limits": { "cpu": "200m", "memory": "200Mi" },
                            },
                            "volumeMounts": shared_mount,
                        },
                    ],
                    "volumes": [{ "name": SHARED_VOLUME, "emptyDir": {} }],
                },
            },
        },
    })
}

pub fn service_manifest(request: &ServiceRequest) -> Value {
    let service_type = if request.expose_externally {
        "LoadBalancer"
    } else {
        "ClusterIP"
    };
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": request.name,
            "labels": request.labels,
        },
        "spec": {
            "type": service_type,
            "selector": request.selector,
            "ports": [{
                "name": "http",
                "protocol": "TCP",
                "port": request.port,
                "targetPort": request.port,
            }],
        },
    })
}

/// Body for DELETE calls: remove dependents first and skip the grace period.
pub fn foreground_delete_options() -> Value {
    json!({
        "kind": "DeleteOptions",
        "apiVersion": "v1",
        "propagationPolicy": "Foreground",
        "gracePeriodSeconds": 0,
    })
}
