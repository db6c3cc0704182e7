// Copyright (C) 2024 Strangelove Ventures
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Kubernetes sentry discovery, grounded directly on `cmd/watcher.go`'s
//! `reconcileSentries`: list Services labeled
//! `app.kubernetes.io/component=cosmos-sentry`, keep those with exactly one
//! port named `sentry-privval`, resolve each service's selector to pods,
//! keep services with exactly one matching pod, and — unless `all_nodes` —
//! further keep only pods scheduled on this node.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use proxy_core::addr::SentryAddr;

const SENTRY_LABEL_SELECTOR: &str = "app.kubernetes.io/component=cosmos-sentry";
const SENTRY_PORT_NAME: &str = "sentry-privval";
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to build in-cluster kube client: {0}")]
    Client(#[source] kube::Error),
    #[error("failed to list services: {0}")]
    ListServices(#[source] kube::Error),
    #[error("failed to list pods in namespace {namespace}: {source}")]
    ListPods {
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to read namespace file {path}: {source}")]
    NamespaceFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to look up this pod ({hostname}) in namespace {namespace}: {source}")]
    ThisPod {
        hostname: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("this pod has no spec.nodeName yet")]
    NodeNameUnset,
}

/// Abstracts sentry discovery so the reconciler can be exercised without a
/// real cluster. `KubeSentryDiscovery` is the production implementation;
/// tests supply a static/fake implementation.
#[async_trait::async_trait]
pub trait SentryDiscovery: Send + Sync {
    async fn discover(&self) -> Result<BTreeSet<SentryAddr>, DiscoveryError>;
}

pub struct KubeSentryDiscovery {
    client: Client,
    all_nodes: bool,
    extra_label_selectors: Vec<String>,
    /// Resolved once at construction, matching `watchForChangedSentries`
    /// determining `thisNode` a single time up front rather than per tick.
    this_node: Option<String>,
}

impl KubeSentryDiscovery {
    pub async fn new(all_nodes: bool, extra_label_selectors: Vec<String>) -> Result<Self, DiscoveryError> {
        let client = Client::try_default().await.map_err(DiscoveryError::Client)?;

        let this_node = if all_nodes {
            None
        } else {
            Some(Self::resolve_this_node(&client).await?)
        };

        Ok(Self {
            client,
            all_nodes,
            extra_label_selectors,
            this_node,
        })
    }

    async fn resolve_this_node(client: &Client) -> Result<String, DiscoveryError> {
        let namespace = std::fs::read_to_string(NAMESPACE_FILE).map_err(|source| DiscoveryError::NamespaceFile {
            path: NAMESPACE_FILE.to_string(),
            source,
        })?;
        let namespace = namespace.trim();
        let hostname = std::env::var("HOSTNAME").unwrap_or_default();

        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let pod = pods
            .get(&hostname)
            .await
            .map_err(|source| DiscoveryError::ThisPod {
                hostname: hostname.clone(),
                namespace: namespace.to_string(),
                source,
            })?;

        pod.spec
            .and_then(|spec| spec.node_name)
            .ok_or(DiscoveryError::NodeNameUnset)
    }

    fn label_selector(&self) -> String {
        let mut selector = SENTRY_LABEL_SELECTOR.to_string();
        for extra in &self.extra_label_selectors {
            selector.push(',');
            selector.push_str(extra);
        }
        selector
    }
}

#[async_trait::async_trait]
impl SentryDiscovery for KubeSentryDiscovery {
    async fn discover(&self) -> Result<BTreeSet<SentryAddr>, DiscoveryError> {
        let services: Api<Service> = Api::all(self.client.clone());
        let list_params = ListParams::default().labels(&self.label_selector());
        let services = services.list(&list_params).await.map_err(DiscoveryError::ListServices)?;

        let mut desired = BTreeSet::new();

        for service in services.items {
            let Some(spec) = &service.spec else { continue };
            let Some(ports) = &spec.ports else { continue };
            if ports.len() != 1 || ports[0].name.as_deref() != Some(SENTRY_PORT_NAME) {
                continue;
            }
            let Some(name) = &service.metadata.name else { continue };
            let Some(namespace) = &service.metadata.namespace else { continue };

            let selector = spec
                .selector
                .as_ref()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            if selector.is_empty() {
                continue;
            }

            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            let matching_pods = pods
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(|source| DiscoveryError::ListPods {
                    namespace: namespace.clone(),
                    source,
                })?;

            if matching_pods.items.len() != 1 {
                continue;
            }

            if !self.all_nodes {
                let pod_node = matching_pods.items[0].spec.as_ref().and_then(|s| s.node_name.as_deref());
                if pod_node != self.this_node.as_deref() {
                    continue;
                }
            }

            let port = ports[0].port;
            let address = format!("tcp://{name}.{namespace}:{port}");
            if let Ok(sentry) = SentryAddr::parse(&address) {
                desired.insert(sentry);
            }
        }

        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A discovery backend with a fixed, swappable result set, used by the
    /// reconciler's own tests so they never touch a real cluster.
    pub struct FakeSentryDiscovery {
        pub desired: Mutex<BTreeSet<SentryAddr>>,
    }

    #[async_trait::async_trait]
    impl SentryDiscovery for FakeSentryDiscovery {
        async fn discover(&self) -> Result<BTreeSet<SentryAddr>, DiscoveryError> {
            Ok(self.desired.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn fake_discovery_returns_configured_set() {
        let mut desired = BTreeSet::new();
        desired.insert(SentryAddr::parse("tcp://sentry-1:1234").unwrap());
        let fake = FakeSentryDiscovery {
            desired: Mutex::new(desired.clone()),
        };
        assert_eq!(fake.discover().await.unwrap(), desired);
    }
}
