use crate::{
    errors::TransferError,
    target::Target,
    transport::{Location, Transport},
};
use futures_util::future::join_all;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Copies files between the controller and targets over the same channel commands run on.
#[derive(Clone)]
pub struct ArtifactTransfer {
    transport: Arc<dyn Transport>,
}

impl ArtifactTransfer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Copies the i-th source to the i-th destination, all pairs in parallel. Returns one status
    /// per pair, in the order given.
    pub async fn push(
        &self,
        sources: &[PathBuf],
        destinations: &[Location],
    ) -> Result<Vec<Result<(), TransferError>>, TransferError> {
        if sources.len() != destinations.len() {
            return Err(TransferError::BatchMismatch {
                sources: sources.len(),
                destinations: destinations.len(),
            });
        }

        let copies = sources.iter().zip(destinations).map(|(source, destination)| {
            let source = Location::Local(source.clone());
            async move {
                info!("starting copy of {source} to {destination}");
                let result = self.copy(&source, destination).await;
                if let Err(err) = &result {
                    warn!("{err}");
                }
                result
            }
        });

        Ok(join_all(copies).await)
    }

    /// Copies a single remote artifact to `local_path`, creating its parent directory. A failed
    /// copy is returned as an error for the caller to log and move past.
    pub async fn pull(
        &self,
        target: &Target,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<PathBuf, TransferError> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| TransferError::LocalPath {
                    path: parent.to_path_buf(),
                    reason: err.to_string(),
                })?;
        }

        let source = Location::remote(target, remote_path);
        let destination = Location::Local(local_path.to_path_buf());
        self.copy(&source, &destination).await?;
        Ok(local_path.to_path_buf())
    }

    async fn copy(&self, source: &Location, destination: &Location) -> Result<(), TransferError> {
        let exit_code = self.transport.copy(source, destination).await?;
        if exit_code != 0 {
            return Err(TransferError::Failed {
                source_path: source.to_string(),
                destination: destination.to_string(),
                exit_code,
            });
        }
        debug!("copied {source} to {destination}");
        Ok(())
    }
}
