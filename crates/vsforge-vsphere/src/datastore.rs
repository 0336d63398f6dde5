//! Datastore file operations.

use std::path::Path;
use std::sync::Arc;

use crate::cdrom::{remove_datastore_prefix, DatastorePath};
use crate::error::VsphereResult;
use crate::platform::Platform;
use crate::session::Session;
use crate::types::{DatastoreFile, DatastoreSummary};

pub struct Datastore {
    session: Arc<Session>,
    summary: DatastoreSummary,
}

impl Session {
    /// Datastore handle; see [`Session::find_datastore`] for how the name is resolved.
    pub async fn datastore(self: &Arc<Self>, name: &str, host: &str) -> VsphereResult<Datastore> {
        let summary = self.find_datastore(name, host).await?;
        Ok(Datastore {
            session: self.clone(),
            summary,
        })
    }
}

impl Datastore {
    pub fn name(&self) -> &str {
        &self.summary.name
    }

    pub fn id(&self) -> &str {
        &self.summary.datastore
    }

    /// `[datastore] path` for a path relative to this datastore.
    pub fn resolve_path(&self, path: &str) -> String {
        match DatastorePath::parse(path) {
            Some(p) => p.to_string(),
            None => format!("[{}] {}", self.summary.name, path),
        }
    }

    fn file(&self, path: &str) -> DatastoreFile {
        DatastoreFile {
            datacenter: self.session.datacenter().name.clone(),
            datastore: self.summary.name.clone(),
            path: remove_datastore_prefix(path),
        }
    }

    /// Upload `src` to `dst`. With `set_host` the transfer is routed through `host`.
    pub async fn upload_file(&self, src: &Path, dst: &str, host: &str, set_host: bool) -> VsphereResult<()> {
        let file = self.file(dst);
        let via = (set_host && !host.is_empty()).then_some(host);
        log::info!("uploading {} to {file}", src.display());
        self.session
            .platform()
            .upload_file(&file, src, via)
            .await
            .map_err(|e| e.context("upload", &file.to_string()))
    }

    pub async fn delete(&self, path: &str) -> VsphereResult<()> {
        let file = self.file(path);
        log::info!("deleting {file}");
        self.session
            .platform()
            .delete_file(&file)
            .await
            .map_err(|e| e.context("delete", &file.to_string()))
    }

    pub async fn file_exists(&self, path: &str) -> VsphereResult<bool> {
        self.session.platform().file_exists(&self.file(path)).await
    }

    pub async fn make_directory(&self, path: &str) -> VsphereResult<()> {
        let dir = self.file(path);
        self.session
            .platform()
            .make_directory(&dir)
            .await
            .map_err(|e| e.context("make directory", &dir.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedPlatform;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    async fn datastore() -> (Arc<SimulatedPlatform>, Datastore) {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim.clone(), "dc1", CancellationToken::new()).await.unwrap();
        let ds = session.datastore("datastore1", "").await.unwrap();
        (sim, ds)
    }

    #[tokio::test]
    async fn resolve_path() {
        let (_, ds) = datastore().await;
        assert_eq!(ds.resolve_path("vm/a.flp"), "[datastore1] vm/a.flp");
        assert_eq!(ds.resolve_path("[other] vm/a.flp"), "[other] vm/a.flp");
    }

    #[tokio::test]
    async fn upload_exists_delete() {
        let (sim, ds) = datastore().await;
        let mut local = tempfile::NamedTempFile::new().unwrap();
        local.write_all(b"floppy").unwrap();

        ds.upload_file(local.path(), "vm/a.flp", "esxi-01", true).await.unwrap();
        assert!(ds.file_exists("vm/a.flp").await.unwrap());
        assert!(sim.calls().iter().any(|c| c == "upload_file [datastore1] vm/a.flp via esxi-01"));

        ds.delete("[datastore1] vm/a.flp").await.unwrap();
        assert!(!ds.file_exists("vm/a.flp").await.unwrap());
    }

    #[tokio::test]
    async fn upload_without_host_routing() {
        let (sim, ds) = datastore().await;
        let local = tempfile::NamedTempFile::new().unwrap();
        ds.upload_file(local.path(), "x.iso", "esxi-01", false).await.unwrap();
        assert!(sim.calls().iter().any(|c| c == "upload_file [datastore1] x.iso"));
    }

    #[tokio::test]
    async fn upload_missing_source() {
        let (_, ds) = datastore().await;
        let err = ds
            .upload_file(Path::new("/nonexistent/vsforge.flp"), "x.flp", "", false)
            .await
            .unwrap_err();
        assert!(err.message.starts_with("upload '[datastore1] x.flp'"));
    }

    #[tokio::test]
    async fn delete_missing_file() {
        let (_, ds) = datastore().await;
        assert!(ds.delete("nope.flp").await.unwrap_err().is_not_found());
    }
}
