//! Platform-keyed download table for the tunnel client binary.

use std::env::consts::{ARCH, OS};

const RELEASE_BASE: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download";

/// How the downloaded artifact has to be treated before it is runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// The download is the executable itself.
    Binary,
    /// A gzip-compressed tarball containing the executable.
    TarGz,
}

/// A resolved download for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub kind: ArtifactKind,
}

/// `(os-arch, file name)` pairs published by the vendor.
const ARTIFACTS: &[(&str, &str)] = &[
    ("linux-x86_64", "cloudflared-linux-amd64"),
    ("linux-x86", "cloudflared-linux-386"),
    ("linux-aarch64", "cloudflared-linux-arm64"),
    ("linux-arm", "cloudflared-linux-arm"),
    ("macos-x86_64", "cloudflared-darwin-amd64.tgz"),
    ("macos-aarch64", "cloudflared-darwin-arm64.tgz"),
    ("windows-x86_64", "cloudflared-windows-amd64.exe"),
    ("windows-x86", "cloudflared-windows-386.exe"),
];

/// Table key for the running host, e.g. `linux-x86_64`.
pub fn host_key() -> String {
    platform_key(OS, ARCH)
}

pub fn platform_key(os: &str, arch: &str) -> String {
    format!("{os}-{arch}")
}

/// Resolve the artifact for a platform key, or `None` if unmapped.
pub fn artifact_for(key: &str) -> Option<Artifact> {
    ARTIFACTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, file)| Artifact {
            url: format!("{RELEASE_BASE}/{file}"),
            kind: if file.ends_with(".tgz") {
                ArtifactKind::TarGz
            } else {
                ArtifactKind::Binary
            },
        })
}
