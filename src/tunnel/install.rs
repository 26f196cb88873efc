//! Tunnel binary installation.
//!
//! [`ensure_binary_available`] is a no-op when the binary already exists.
//! Otherwise the platform artifact is streamed to a temp file next to the
//! target, unpacked if it is an archive, marked executable on Unix, and
//! renamed over the target. Readers never see a partial binary.

use std::io::Read;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::platform::{self, Artifact, ArtifactKind};
use crate::error::TunnelError;

/// Make sure the tunnel binary exists at `binary`, downloading it if needed.
///
/// `on_progress` receives whole percentages (0–100) while bytes arrive; it is
/// never called when the binary is already present. Returns `true` if a
/// download happened.
pub async fn ensure_binary_available(
    binary: &Path,
    on_progress: impl FnMut(u8),
) -> Result<bool, TunnelError> {
    if tokio::fs::try_exists(binary).await.unwrap_or(false) {
        return Ok(false);
    }
    let key = platform::host_key();
    let artifact =
        platform::artifact_for(&key).ok_or_else(|| TunnelError::PlatformUnsupported(key))?;
    info!(url = %artifact.url, path = %binary.display(), "Tunnel binary missing, downloading");
    install_artifact(&artifact, binary, on_progress).await?;
    Ok(true)
}

/// Download `artifact` and install it at `binary`.
pub async fn install_artifact(
    artifact: &Artifact,
    binary: &Path,
    on_progress: impl FnMut(u8),
) -> Result<(), TunnelError> {
    let parent = binary
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| TunnelError::Download(format!("cannot create {}: {e}", parent.display())))?;

    let download_path = parent.join(format!(".tunnelgate_dl_{}", std::process::id()));
    let unpacked_path = parent.join(format!(".tunnelgate_bin_{}", std::process::id()));
    let result = async {
        download(&artifact.url, &download_path, on_progress).await?;
        let ready = match artifact.kind {
            ArtifactKind::Binary => download_path.clone(),
            ArtifactKind::TarGz => {
                extract_tar_gz(&download_path, &unpacked_path, binary_name(binary)).await?;
                let _ = tokio::fs::remove_file(&download_path).await;
                unpacked_path.clone()
            }
        };
        mark_executable(&ready).await?;
        tokio::fs::rename(&ready, binary)
            .await
            .map_err(|e| TunnelError::Extract(format!("failed to finalize binary: {e}")))?;
        Ok::<(), TunnelError>(())
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&download_path).await;
        let _ = tokio::fs::remove_file(&unpacked_path).await;
    } else {
        info!(path = %binary.display(), "Tunnel binary installed");
    }
    result
}

fn binary_name(binary: &Path) -> String {
    binary
        .file_name()
        .map_or_else(|| "cloudflared".to_string(), |n| n.to_string_lossy().into_owned())
}

/// Stream `url` into `dest`, reporting percent progress when the length is known.
async fn download(url: &str, dest: &Path, mut on_progress: impl FnMut(u8)) -> Result<(), TunnelError> {
    let resp = reqwest::get(url)
        .await
        .map_err(|e| TunnelError::Download(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(TunnelError::Download(format!("HTTP {} from {url}", resp.status())));
    }
    let total = resp.content_length();
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| TunnelError::Download(format!("cannot create {}: {e}", dest.display())))?;

    let mut received: u64 = 0;
    let mut last_percent: Option<u8> = None;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TunnelError::Download(e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| TunnelError::Download(format!("write failed: {e}")))?;
        received += chunk.len() as u64;
        if let Some(total) = total.filter(|t| *t > 0) {
            let percent = percent_of(received, total);
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                on_progress(percent);
            }
        }
    }
    file.flush()
        .await
        .map_err(|e| TunnelError::Download(format!("flush failed: {e}")))?;
    if last_percent != Some(100) {
        on_progress(100);
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn percent_of(received: u64, total: u64) -> u8 {
    (received.saturating_mul(100) / total).min(100) as u8
}

/// Unpack the entry named `name` (or the first regular file) from a `.tgz`.
async fn extract_tar_gz(archive: &Path, dest: &Path, name: String) -> Result<(), TunnelError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_tar_gz_blocking(&archive, &dest, &name))
        .await
        .map_err(|e| TunnelError::Extract(format!("extract task failed: {e}")))?
}

fn extract_tar_gz_blocking(archive: &Path, dest: &Path, name: &str) -> Result<(), TunnelError> {
    let file = std::fs::File::open(archive).map_err(|e| TunnelError::Extract(e.to_string()))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let entries = tar.entries().map_err(|e| TunnelError::Extract(e.to_string()))?;

    let mut fallback: Option<Vec<u8>> = None;
    for entry in entries {
        let mut entry = entry.map_err(|e| TunnelError::Extract(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy() == name))
            .unwrap_or(false);
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| TunnelError::Extract(e.to_string()))?;
        if matches {
            return std::fs::write(dest, data).map_err(|e| TunnelError::Extract(e.to_string()));
        }
        if fallback.is_none() {
            fallback = Some(data);
        }
    }
    match fallback {
        Some(data) => {
            warn!(name, "Archive has no entry with the expected name, using first file");
            std::fs::write(dest, data).map_err(|e| TunnelError::Extract(e.to_string()))
        }
        None => Err(TunnelError::Extract("archive contains no files".to_string())),
    }
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> Result<(), TunnelError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| TunnelError::Extract(format!("chmod failed: {e}")))
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> Result<(), TunnelError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};

    async fn serve_bytes(body: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/artifact", get(move || {
            let body = body.clone();
            async move { body }
        }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/artifact")
    }

    fn tar_gz_with(name: &str, data: &[u8]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn existing_binary_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudflared");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        let mut calls = 0;
        let downloaded = ensure_binary_available(&path, |_| calls += 1).await.unwrap();
        assert!(!downloaded);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn plain_binary_is_installed_with_progress() {
        let url = serve_bytes(vec![7u8; 64 * 1024]).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin").join("cloudflared");
        let mut progress = Vec::new();
        let artifact = Artifact {
            url,
            kind: ArtifactKind::Binary,
        };
        install_artifact(&artifact, &path, |p| progress.push(p))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap().len(), 64 * 1024);
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn archive_is_extracted() {
        let url = serve_bytes(tar_gz_with("cloudflared", b"tunnel-binary")).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudflared");
        let artifact = Artifact {
            url,
            kind: ArtifactKind::TarGz,
        };
        install_artifact(&artifact, &path, |_| {}).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"tunnel-binary");
    }

    #[tokio::test]
    async fn corrupt_archive_is_an_extract_error() {
        let url = serve_bytes(b"not a tarball".to_vec()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudflared");
        let artifact = Artifact {
            url,
            kind: ArtifactKind::TarGz,
        };
        let err = install_artifact(&artifact, &path, |_| {}).await.unwrap_err();
        assert!(matches!(err, TunnelError::Extract(_)));
        assert!(!path.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".tunnelgate_"))
            .collect()
    }

    #[tokio::test]
    async fn failed_finalize_removes_unpacked_file() {
        let url = serve_bytes(tar_gz_with("cloudflared", b"tunnel-binary")).await;
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the target makes the final rename fail.
        let path = dir.path().join("cloudflared");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
        let artifact = Artifact {
            url,
            kind: ArtifactKind::TarGz,
        };
        let err = install_artifact(&artifact, &path, |_| {}).await.unwrap_err();
        assert!(matches!(err, TunnelError::Extract(_)));
        assert!(leftovers(dir.path()).is_empty());
        assert!(path.join("keep").exists());
    }

    #[tokio::test]
    async fn http_error_is_a_download_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new()).await.unwrap();
        });
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            url: format!("http://{addr}/missing"),
            kind: ArtifactKind::Binary,
        };
        let err = install_artifact(&artifact, &dir.path().join("cloudflared"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Download(_)));
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(0, 10), 0);
        assert_eq!(percent_of(5, 10), 50);
        assert_eq!(percent_of(20, 10), 100);
    }
}
