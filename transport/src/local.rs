//! Local transport: commands and file I/O run directly in the
//! orchestrator's own process, via [`tokio::process::Command`] and
//! [`tokio::fs`].

use async_trait::async_trait;
use bytes::Bytes;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{DirEntry, EntryKind, ExecResult, Metadata, Transport, TransportError, TransportResult};

/// Executes everything in the orchestrator's own process space. Used for
/// "submit to the scheduler running on this machine" and as the transport
/// underlying tests.
#[derive(Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn exec(&self, cmd: &str, args: &[&str]) -> TransportResult<ExecResult> {
        let output = tokio::process::Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TransportError::Internal(format!("failed to execute `{cmd}`: {e}")))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn list_dir(&self, path: &str) -> TransportResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(path)
            .await
            .map_err(|e| map_io_err(e, path))?;
        while let Some(entry) = rd.next_entry().await.map_err(|e| map_io_err(e, path))? {
            let meta = entry.metadata().await.map_err(|e| map_io_err(e, path))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: kind_of(&meta),
                size: Some(meta.len()),
                modified: meta.modified().ok(),
                permissions: Some(meta.permissions().mode() & 0o777),
            });
        }
        Ok(entries)
    }

    async fn make_dirs(&self, path: &str) -> TransportResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| map_io_err(e, path))
    }

    async fn put(&self, remote_path: &str, data: Bytes, executable: bool) -> TransportResult<()> {
        if let Some(parent) = Path::new(remote_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_err(e, remote_path))?;
        }
        tokio::fs::write(remote_path, &data)
            .await
            .map_err(|e| map_io_err(e, remote_path))?;
        if executable {
            self.chmod(remote_path, 0o755).await?;
        }
        Ok(())
    }

    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        ignore_missing: bool,
    ) -> TransportResult<()> {
        match tokio::fs::metadata(remote_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && ignore_missing => return Ok(()),
            Err(e) => return Err(map_io_err(e, remote_path)),
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_err(e, &local_path.to_string_lossy()))?;
        }
        tokio::fs::copy(remote_path, local_path)
            .await
            .map_err(|e| map_io_err(e, remote_path))?;
        Ok(())
    }

    async fn open(&self, remote_path: &str, offset: u64, size: u64) -> TransportResult<Bytes> {
        let mut file = tokio::fs::File::open(remote_path)
            .await
            .map_err(|e| map_io_err(e, remote_path))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| map_io_err(e, remote_path))?;
        let mut buf = vec![0u8; size as usize];
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| map_io_err(e, remote_path))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn stat(&self, path: &str) -> TransportResult<Metadata> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io_err(e, path))?;
        Ok(Metadata {
            kind: kind_of(&meta),
            size: meta.len(),
            modified: meta.modified().ok(),
            permissions: Some(meta.permissions().mode() & 0o777),
        })
    }

    async fn remove(&self, path: &str) -> TransportResult<()> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io_err(e, path))?;
        if meta.is_dir() {
            tokio::fs::remove_dir(path)
                .await
                .map_err(|e| map_io_err(e, path))
        } else {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| map_io_err(e, path))
        }
    }

    async fn remove_tree(&self, path: &str) -> TransportResult<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_err(e, path)),
        }
    }

    async fn chmod(&self, path: &str, mode: u32) -> TransportResult<()> {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| map_io_err(e, path))
    }

    async fn is_dir(&self, path: &str) -> TransportResult<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io_err(e, path)),
        }
    }

    async fn check(&self) -> TransportResult<()> {
        Ok(())
    }

    fn description(&self) -> String {
        "local".to_string()
    }
}

fn kind_of(meta: &std::fs::Metadata) -> EntryKind {
    if meta.is_dir() {
        EntryKind::Dir
    } else if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

fn map_io_err(e: std::io::Error, path: &str) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::NotFound => TransportError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(path.to_string()),
        _ => TransportError::RemoteError(format!("{path}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let t = LocalTransport::new();
        let result = t.exec("sh", &["-c", "echo hi"]).await.unwrap();
        assert_eq!(result.stdout_str(), "hi\n");
        assert!(result.success());
    }

    #[tokio::test]
    async fn exec_nonexistent_binary_is_internal_error() {
        let t = LocalTransport::new();
        let err = t.exec("definitely-not-a-real-binary", &[]).await.unwrap_err();
        assert!(matches!(err, TransportError::Internal(_)));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("nested/out.txt");
        let t = LocalTransport::new();
        t.put(remote.to_str().unwrap(), Bytes::from_static(b"payload"), false)
            .await
            .unwrap();

        let local = dir.path().join("copy.txt");
        t.get(remote.to_str().unwrap(), &local, false).await.unwrap();
        assert_eq!(tokio::fs::read(&local).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn get_missing_source_with_ignore_missing_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let t = LocalTransport::new();
        let local = dir.path().join("copy.txt");
        t.get(dir.path().join("absent").to_str().unwrap(), &local, true)
            .await
            .unwrap();
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn get_missing_source_without_ignore_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let t = LocalTransport::new();
        let local = dir.path().join("copy.txt");
        let err = t
            .get(dir.path().join("absent").to_str().unwrap(), &local, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn put_executable_sets_the_executable_bit() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("script.sh");
        let t = LocalTransport::new();
        t.put(remote.to_str().unwrap(), Bytes::from_static(b"#!/bin/sh\n"), true)
            .await
            .unwrap();
        let mode = tokio::fs::metadata(&remote).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    #[tokio::test]
    async fn open_reads_a_byte_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        let t = LocalTransport::new();
        let chunk = t.open(path.to_str().unwrap(), 3, 4).await.unwrap();
        assert_eq!(&chunk[..], b"3456");
    }

    #[tokio::test]
    async fn is_dir_distinguishes_files_directories_and_absent_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        tokio::fs::write(&file, b"x").await.unwrap();
        let t = LocalTransport::new();
        assert!(t.is_dir(dir.path().to_str().unwrap()).await.unwrap());
        assert!(!t.is_dir(file.to_str().unwrap()).await.unwrap());
        assert!(!t.is_dir(dir.path().join("absent").to_str().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn list_dir_reports_names_and_kinds() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        let t = LocalTransport::new();
        let mut entries = t.list_dir(dir.path().to_str().unwrap()).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[1].name, "sub");
        assert_eq!(entries[1].kind, EntryKind::Dir);
    }

    #[tokio::test]
    async fn remove_tree_on_missing_path_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let t = LocalTransport::new();
        t.remove_tree(dir.path().join("absent").to_str().unwrap())
            .await
            .unwrap();
    }
}
