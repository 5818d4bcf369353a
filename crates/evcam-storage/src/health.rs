//! Storage health check

use anyhow::Result;
use opendal::Operator;

/// Verify the backend answers a root listing
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

/// Non-failing variant for readiness probes
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}
