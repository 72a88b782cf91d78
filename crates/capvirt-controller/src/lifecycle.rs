//! Finalizer and requeue helpers shared by both reconcilers

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::Resource;
use tracing::error;

use capvirt_common::{Error, FINALIZER};

/// Requeue after adding the finalizer
pub const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
/// Requeue while another controller has not done its part yet
pub const PREREQUISITE_REQUEUE: Duration = Duration::from_secs(3);
/// Requeue after a retryable error
pub const RETRYABLE_ERROR_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue after an error that needs a configuration change
pub const FATAL_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Check if the provider finalizer is present
pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// Add the provider finalizer to the working copy
pub fn add_finalizer<K: Resource>(obj: &mut K) {
    let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|name| name == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
    }
}

/// Remove the provider finalizer from the working copy
pub fn remove_finalizer<K: Resource>(obj: &mut K) {
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|name| name != FINALIZER);
    }
}

/// Action for a failed pass of the object named `object`
pub fn requeue_after_error(kind: &str, object: &str, error: &Error) -> Action {
    let retryable = error.is_retryable();
    error!(
        %error,
        kind,
        object,
        retryable,
        "reconciliation failed"
    );
    if retryable {
        Action::requeue(RETRYABLE_ERROR_REQUEUE)
    } else {
        Action::requeue(FATAL_ERROR_REQUEUE)
    }
}
