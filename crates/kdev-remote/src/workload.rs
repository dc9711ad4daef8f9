//! Workload resolution and dev-mode translation.

use std::sync::Arc;

use async_trait::async_trait;
use kdev_core::{Result, WorkloadRef};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{ResolvedWorkload, Variant, WorkloadHandle};

/// Fetches the target workload.
#[async_trait]
pub trait WorkloadResolver: Send + Sync {
    /// Fetches the workload, or synthesizes one when `autocreate` is set
    /// and nothing exists yet. Never synthesizes on a retry.
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        workload: &WorkloadRef,
        autocreate: bool,
        is_retry: bool,
    ) -> Result<ResolvedWorkload>;

    /// Re-reads a workload, used while waiting for it to wake up.
    async fn refresh(
        &self,
        cancel: &CancellationToken,
        handle: &WorkloadHandle,
    ) -> Result<WorkloadHandle>;

    /// Signals once when the dev-mode workload must be applied again.
    ///
    /// `None` when the implementation cannot detect re-applies.
    async fn watch_drift(
        &self,
        cancel: CancellationToken,
        handle: &WorkloadHandle,
    ) -> Result<Option<mpsc::Receiver<()>>>;
}

/// One object of the workload in its dev-mode form.
#[async_trait]
pub trait Translation: Send + Sync {
    fn name(&self) -> &str;

    /// Creates or updates the object in the given form.
    async fn deploy(&self, cancel: &CancellationToken, variant: Variant) -> Result<()>;
}

/// Translations produced for one activation.
#[derive(Clone, Default)]
pub struct TranslationSet {
    pub translations: Vec<Arc<dyn Translation>>,
}

impl TranslationSet {
    pub fn new(translations: Vec<Arc<dyn Translation>>) -> Self {
        Self { translations }
    }

    pub fn len(&self) -> usize {
        self.translations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.translations.is_empty()
    }
}

impl std::fmt::Debug for TranslationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.translations.iter().map(|t| t.name()))
            .finish()
    }
}

/// Turns a workload into its dev-mode form.
#[async_trait]
pub trait WorkloadMutator: Send + Sync {
    /// Creates the persistent volume of the dev pod.
    async fn create_volume(&self, cancel: &CancellationToken, workload: &WorkloadRef)
        -> Result<()>;

    /// Computes the dev-mode objects. `reset_sync` asks the dev pod to
    /// start with an empty sync database.
    async fn compute_dev_mode_translations(
        &self,
        cancel: &CancellationToken,
        handle: &WorkloadHandle,
        reset_sync: bool,
    ) -> Result<TranslationSet>;

    /// Applies dev-mode settings to every translation.
    async fn apply_dev_mode(&self, set: &TranslationSet) -> Result<()>;
}
