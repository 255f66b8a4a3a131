//! Remote storage health check

use anyhow::Result;
use opendal::Operator;

/// Verify the storage endpoint is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    // Listing the root is the lightest call every backend supports
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_operator_is_healthy() {
        let op = crate::operator::build_memory_operator().unwrap();
        assert!(check_health(&op).await.is_ok());
    }

    #[tokio::test]
    async fn fs_operator_on_tempdir_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let op = crate::operator::build_fs_operator(&dir.path().to_string_lossy()).unwrap();
        assert!(check_health(&op).await.is_ok());
    }
}
