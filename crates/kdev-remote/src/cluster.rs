//! Cluster API access.

use std::net::SocketAddr;

use async_trait::async_trait;
use kdev_core::{Result, WorkloadRef};
use tokio_util::sync::CancellationToken;

use crate::types::{ClusterEvent, PodInfo, WatchStream};

/// Pod, event and port-forward operations against the cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Finds the dev pod of a workload, waiting for it to be created.
    async fn get_dev_pod(
        &self,
        cancel: &CancellationToken,
        workload: &WorkloadRef,
        created: bool,
    ) -> Result<PodInfo>;

    async fn destroy_pod(&self, namespace: &str, pod: &str) -> Result<()>;

    /// Watches a single pod by name.
    async fn watch_pod(&self, namespace: &str, pod: &str) -> Result<WatchStream<PodInfo>>;

    /// Watches events about a pod, starting after `resource_version`.
    async fn watch_events(
        &self,
        namespace: &str,
        pod: &str,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<ClusterEvent>>;

    /// Name of the single service matching a label selector.
    async fn service_for_labels(&self, namespace: &str, selector: &str) -> Result<String>;

    /// Name of a running pod behind a service.
    async fn pod_for_service(&self, namespace: &str, service: &str) -> Result<String>;

    /// Binds `local` and forwards its connections to `remote` on the pod.
    ///
    /// Returns once the local address is bound. Forwarding continues until
    /// `cancel` fires. Fails with `UpError::PortInUse` when the address is
    /// taken.
    async fn open_port_forward(
        &self,
        cancel: CancellationToken,
        namespace: &str,
        pod: &str,
        remote: u16,
        local: SocketAddr,
    ) -> Result<()>;
}
