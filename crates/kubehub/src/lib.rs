//! bootwait kubehub – client construction and pod list+watch wiring

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use bootwait_core::{EventSource, EventStream, MirrorEntry, MirrorEvent, ObjectIdentity, Phase, SourceError};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, Config, ResourceExt,
};

/// Build a client for the target cluster.
///
/// With `api_server` set (e.g. the bootstrap's local insecure address
/// `http://127.0.0.1:8080`) no kubeconfig is consulted; otherwise the config is
/// inferred from the environment (kubeconfig or in-cluster).
pub async fn connect(api_server: Option<&str>) -> Result<Client> {
    let config = match api_server {
        Some(url) => {
            info!(api_server = %url, "using explicit api server");
            Config::new(url.parse()?)
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn identity_of(pod: &Pod) -> Result<ObjectIdentity> {
    let name = pod.metadata.name.as_deref().ok_or_else(|| anyhow!("pod missing metadata.name"))?;
    let namespace = pod.namespace().unwrap_or_default();
    Ok(ObjectIdentity::new(namespace, name))
}

/// Project a pod onto a mirror entry.
pub fn entry_from(pod: &Pod) -> Result<MirrorEntry> {
    let identity = identity_of(pod)?;
    let phase = Phase::from_status(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
    let creation_ts = pod.metadata.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0);
    let mut raw = serde_json::to_value(pod).context("serializing Pod")?;
    strip_managed_fields(&mut raw);
    Ok(MirrorEntry { identity, phase, creation_ts, raw })
}

fn event_from(ev: Event<Pod>) -> Result<MirrorEvent, SourceError> {
    let decode = |e: anyhow::Error| SourceError::Decode(format!("{e:#}"));
    match ev {
        Event::Applied(p) => Ok(MirrorEvent::Applied(entry_from(&p).map_err(decode)?)),
        Event::Deleted(p) => Ok(MirrorEvent::Deleted(identity_of(&p).map_err(decode)?)),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            let entries = list.iter().map(entry_from).collect::<Result<Vec<_>>>().map_err(decode)?;
            Ok(MirrorEvent::Restarted(entries))
        }
    }
}

fn source_error(e: watcher::Error) -> SourceError {
    match e {
        watcher::Error::InitialListFailed(inner) => SourceError::List(inner.to_string()),
        other => SourceError::Watch(other.to_string()),
    }
}

/// Pods in one namespace matching a label selector.
#[derive(Clone)]
pub struct PodSource {
    api: Api<Pod>,
    namespace: String,
    label_selector: String,
}

impl PodSource {
    pub fn new(client: Client, namespace: &str, label_selector: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            label_selector: label_selector.to_string(),
        }
    }
}

impl EventSource for PodSource {
    fn open(&self) -> EventStream {
        let cfg = watcher::Config::default().labels(&self.label_selector);
        info!(ns = %self.namespace, selector = %self.label_selector, "pod watcher opened");
        watcher::watcher(self.api.clone(), cfg)
            .map(|item| item.map_err(source_error).and_then(event_from))
            .boxed()
    }
}
