//! Kubernetes control plane backend
//!
//! Talks to the core/v1 REST API directly. Node and workload events come
//! from a polling watcher that lists and diffs every poll interval.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gpuledger_core::{
    Binding, ClusterConfig, LedgerError, LedgerResult, NodeEvent, NodeInfo, Secret, Workload,
    WorkloadEvent, WorkloadId, WorkloadPhase, WorkloadSpec,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::traits::ControlPlane;
use crate::watch::WatchState;
use crate::EVENT_CHANNEL_CAPACITY;

/// Annotation recording the bound node
pub const NODE_ANNOTATION: &str = "gpuledger/node";
/// Annotation recording the bound slot
pub const SLOT_ANNOTATION: &str = "gpuledger/slot";
/// Annotation recording the bound VRAM amount
pub const VRAM_ANNOTATION: &str = "gpuledger/vram";
/// Annotation carrying the ledger reservation uid
pub const BINDING_UID_ANNOTATION: &str = "gpuledger/binding-uid";

/// Extended resource the gpushare device plugin schedules on
const GPU_MEM_RESOURCE: &str = "aliyun.com/gpu-mem";
const SHM_SIZE_LIMIT: &str = "4Gi";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Control plane backed by a Kubernetes API server
pub struct KubeControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
    image_pull_secret: Option<String>,
    poll_interval: Duration,
    node_tx: broadcast::Sender<NodeEvent>,
    workload_tx: broadcast::Sender<WorkloadEvent>,
}

impl KubeControlPlane {
    /// Create a client from cluster configuration
    pub fn new(config: &ClusterConfig) -> LedgerResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                LedgerError::Config(format!("reading CA bundle {}: {}", path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| LedgerError::Config(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match &config.token_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| {
                        LedgerError::Config(format!("reading token {}: {}", path.display(), e))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let client = builder
            .build()
            .map_err(|e| LedgerError::Config(format!("building HTTP client: {}", e)))?;

        let (node_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (workload_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            base_url: config.api_server.trim_end_matches('/').to_string(),
            token,
            namespace: config.namespace.clone(),
            image_pull_secret: config.image_pull_secret.clone(),
            poll_interval: config.poll_interval(),
            node_tx,
            workload_tx,
        })
    }

    /// Start the polling watcher feeding `watch_nodes` and `watch_workloads`
    pub fn spawn_watcher(self: &Arc<Self>, selector: String) -> JoinHandle<()> {
        let plane = Arc::clone(self);
        tokio::spawn(async move {
            let mut state = WatchState::new();
            let mut ticker = tokio::time::interval(plane.poll_interval);
            info!(
                interval_secs = plane.poll_interval.as_secs(),
                selector = %selector,
                "Starting cluster watcher"
            );
            loop {
                ticker.tick().await;
                plane.poll_once(&mut state, &selector).await;
            }
        })
    }

    async fn poll_once(&self, state: &mut WatchState, selector: &str) {
        match self.list_nodes().await {
            Ok(nodes) => {
                for event in state.diff_nodes(nodes) {
                    let _ = self.node_tx.send(event);
                }
            }
            Err(e) => warn!(error = %e, "Node poll failed"),
        }

        match self.list_workloads(selector).await {
            Ok(workloads) => {
                for event in state.diff_workloads(workloads) {
                    let _ = self.workload_tx.send(event);
                }
            }
            Err(e) => warn!(error = %e, "Workload poll failed"),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> LedgerResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| LedgerError::ControlPlane(format!("{}: {}", what, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(LedgerError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(LedgerError::AlreadyExists(what.to_string())),
            _ => Err(LedgerError::ControlPlane(format!(
                "{}: {} {}",
                what,
                status,
                body.trim()
            ))),
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)], what: &str) -> LedgerResult<Value> {
        let response = self
            .send(self.request(Method::GET, path).query(query), what)
            .await?;
        response
            .json()
            .await
            .map_err(|e| LedgerError::Serialization(format!("{}: {}", what, e)))
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn list_nodes(&self) -> LedgerResult<Vec<NodeInfo>> {
        let list = self.get_json("/api/v1/nodes", &[], "nodes").await?;
        Ok(items(&list).filter_map(node_from_json).collect())
    }

    async fn list_workloads(&self, selector: &str) -> LedgerResult<Vec<Workload>> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let list = self
            .get_json(&path, &[("labelSelector", selector)], "pods")
            .await?;
        Ok(items(&list).filter_map(workload_from_pod).collect())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> LedgerResult<Workload> {
        let assume_time = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let manifest = pod_manifest(spec, self.image_pull_secret.as_deref(), assume_time);
        let path = format!("/api/v1/namespaces/{}/pods", spec.id.namespace);
        let what = format!("pod {}", spec.id);

        let response = self
            .send(self.request(Method::POST, &path).json(&manifest), &what)
            .await?;
        let created: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::Serialization(format!("{}: {}", what, e)))?;

        debug!(workload = %spec.id, binding = %spec.binding, "Pod created");
        Ok(workload_from_pod(&created).unwrap_or_else(|| Workload::from_spec(spec)))
    }

    async fn delete_workload(&self, id: &WorkloadId) -> LedgerResult<()> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", id.namespace, id.name);
        self.send(self.request(Method::DELETE, &path), &format!("pod {}", id))
            .await?;
        debug!(workload = %id, "Pod deleted");
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> LedgerResult<Secret> {
        let path = format!("/api/v1/namespaces/{}/secrets/{}", self.namespace, name);
        let secret = self
            .get_json(&path, &[], &format!("secret {}", name))
            .await?;
        secret_from_json(name, &secret)
    }

    fn watch_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_tx.subscribe()
    }

    fn watch_workloads(&self) -> broadcast::Receiver<WorkloadEvent> {
        self.workload_tx.subscribe()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}

/// Build the pod manifest for a bound workload
pub fn pod_manifest(spec: &WorkloadSpec, image_pull_secret: Option<&str>, assume_time_nanos: i64) -> Value {
    let binding = &spec.binding;
    let slot = binding.slot_id.to_string();

    let mut labels = spec.labels.clone();
    labels
        .entry("app".to_string())
        .or_insert_with(|| "gpushare".to_string());

    let image_pull_secrets: Vec<Value> = image_pull_secret
        .map(|name| json!({ "name": name }))
        .into_iter()
        .collect();

    let mut annotations = json!({
        "ALIYUN_COM_GPU_MEM_IDX": slot,
        "ALIYUN_COM_GPU_MEM_ASSIGNED": "false",
        "ALIYUN_COM_GPU_MEM_ASSUME_TIME": assume_time_nanos.to_string(),
        NODE_ANNOTATION: binding.node_id,
        SLOT_ANNOTATION: slot,
        VRAM_ANNOTATION: binding.amount.to_string(),
    });
    if let Some(uid) = &spec.binding_uid {
        annotations[BINDING_UID_ANNOTATION] = json!(uid);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.id.name,
            "namespace": spec.id.namespace,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": {
            "nodeName": binding.node_id,
            "restartPolicy": "Never",
            "imagePullSecrets": image_pull_secrets,
            "containers": [{
                "name": spec.id.name,
                "image": spec.image,
                "imagePullPolicy": "Always",
                "env": [{ "name": "NVIDIA_VISIBLE_DEVICES", "value": slot }],
                "resources": {
                    "limits": { GPU_MEM_RESOURCE: binding.amount.to_string() },
                },
                "volumeMounts": [{ "name": "shmdir", "mountPath": "/dev/shm" }],
            }],
            "volumes": [{
                "name": "shmdir",
                "emptyDir": { "medium": "Memory", "sizeLimit": SHM_SIZE_LIMIT },
            }],
        },
    })
}

/// Convert a pod object into a workload; pods in unknown phases are skipped
pub fn workload_from_pod(pod: &Value) -> Option<Workload> {
    let metadata = pod.get("metadata")?;
    let id = WorkloadId::new(
        metadata.get("namespace")?.as_str()?,
        metadata.get("name")?.as_str()?,
    );
    let phase = pod
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .map_or(Some(WorkloadPhase::Pending), WorkloadPhase::parse)?;
    let node_id = pod
        .pointer("/spec/nodeName")
        .and_then(Value::as_str)
        .map(str::to_string);

    let annotations = metadata.get("annotations");

    Some(Workload {
        id,
        node_id,
        phase,
        binding: annotations.and_then(binding_from_annotations),
        binding_uid: annotations
            .and_then(|a| a.get(BINDING_UID_ANNOTATION))
            .and_then(Value::as_str)
            .map(str::to_string),
        labels: string_map(metadata.get("labels")),
    })
}

fn binding_from_annotations(annotations: &Value) -> Option<Binding> {
    let get = |key: &str| annotations.get(key).and_then(Value::as_str);
    Some(Binding::new(
        get(NODE_ANNOTATION)?,
        get(SLOT_ANNOTATION)?.parse().ok()?,
        get(VRAM_ANNOTATION)?.parse().ok()?,
    ))
}

/// Convert a node object, addressing it by its InternalIP
pub fn node_from_json(node: &Value) -> Option<NodeInfo> {
    let name = node.pointer("/metadata/name")?.as_str()?;
    let address = node
        .pointer("/status/addresses")
        .and_then(Value::as_array)
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a.get("type").and_then(Value::as_str) == Some("InternalIP"))
        })
        .and_then(|a| a.get("address"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(NodeInfo {
        name: name.to_string(),
        address,
        labels: string_map(node.pointer("/metadata/labels")),
    })
}

/// Decode a secret object's base64 data
pub fn secret_from_json(name: &str, secret: &Value) -> LedgerResult<Secret> {
    let mut data = BTreeMap::new();
    if let Some(entries) = secret.get("data").and_then(Value::as_object) {
        for (key, value) in entries {
            let encoded = value.as_str().unwrap_or_default();
            let decoded = STANDARD.decode(encoded).map_err(|e| {
                LedgerError::Serialization(format!("secret {} key {}: {}", name, key, e))
            })?;
            let text = String::from_utf8(decoded).map_err(|_| {
                LedgerError::Serialization(format!("secret {} key {} is not UTF-8", name, key))
            })?;
            data.insert(key.clone(), text);
        }
    }
    Ok(Secret {
        name: name.to_string(),
        data,
    })
}

fn items(list: &Value) -> impl Iterator<Item = &Value> {
    list.get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
