//! Release table for the pinned `cloudflared` build.

/// Pinned release; bumping it changes every download URL below.
pub const CLOUDFLARED_VERSION: &str = "2024.11.1";

const RELEASE_BASE: &str = "https://github.com/cloudflare/cloudflared/releases/download";

/// How a release asset is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    RawExecutable,
    TarGz,
}

/// Download target for one platform/architecture pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRecord {
    pub platform: String,
    pub url: String,
    pub archive: ArchiveKind,
}

impl BinaryRecord {
    pub fn new(platform: impl Into<String>, url: impl Into<String>, archive: ArchiveKind) -> Self {
        Self {
            platform: platform.into(),
            url: url.into(),
            archive,
        }
    }
}

pub fn platform_key(os: &str, arch: &str) -> String {
    format!("{os}-{arch}")
}

pub fn current_platform() -> String {
    platform_key(std::env::consts::OS, std::env::consts::ARCH)
}

/// Resolves the release asset for `os`/`arch` (Rust `std::env::consts` names).
pub fn lookup(os: &str, arch: &str) -> Option<BinaryRecord> {
    let (asset, archive) = match (os, arch) {
        ("windows", "x86_64") => ("cloudflared-windows-amd64.exe", ArchiveKind::RawExecutable),
        ("macos", "x86_64") => ("cloudflared-darwin-amd64.tgz", ArchiveKind::TarGz),
        ("macos", "aarch64") => ("cloudflared-darwin-arm64.tgz", ArchiveKind::TarGz),
        ("linux", "x86_64") => ("cloudflared-linux-amd64", ArchiveKind::RawExecutable),
        ("linux", "aarch64") => ("cloudflared-linux-arm64", ArchiveKind::RawExecutable),
        _ => return None,
    };

    Some(BinaryRecord::new(
        platform_key(os, arch),
        format!("{RELEASE_BASE}/{CLOUDFLARED_VERSION}/{asset}"),
        archive,
    ))
}

pub fn binary_name_for(os: &str) -> &'static str {
    if os == "windows" {
        "cloudflared.exe"
    } else {
        "cloudflared"
    }
}

pub fn binary_name() -> &'static str {
    binary_name_for(std::env::consts::OS)
}
