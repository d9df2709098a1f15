use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use ureq::{AgentBuilder, Error as UreqError};
use walkdir::WalkDir;
use zip::read::ZipArchive;

const DEFAULT_PDFIUM_VERSION: &str = "7350";
const DEFAULT_BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

const WATCHED_ENV: &[&str] = &[
    "FOLIO_PDFIUM_SKIP_DOWNLOAD",
    "FOLIO_PDFIUM_ARCHIVE_PATH",
    "FOLIO_PDFIUM_VERSION",
    "FOLIO_PDFIUM_RELEASE_TAG",
    "FOLIO_PDFIUM_PLATFORM",
    "FOLIO_PDFIUM_BASE_URL",
    "FOLIO_PDFIUM_FORCE_DOWNLOAD",
    "PDFIUM_DYNAMIC_LIB_PATH",
    "PDFIUM_STATIC_LIB_PATH",
];

/// Where and what to download, resolved once from the build environment.
struct Release {
    version: String,
    tag: String,
    base_url: String,
    platform: String,
    force: bool,
}

impl Release {
    fn from_env(target_os: &str, target_arch: &str) -> Self {
        let version =
            env::var("FOLIO_PDFIUM_VERSION").unwrap_or_else(|_| DEFAULT_PDFIUM_VERSION.into());
        let tag = env::var("FOLIO_PDFIUM_RELEASE_TAG")
            .unwrap_or_else(|_| format!("chromium/{}", version));
        Self {
            tag,
            version,
            base_url: env::var("FOLIO_PDFIUM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            platform: env::var("FOLIO_PDFIUM_PLATFORM")
                .unwrap_or_else(|_| default_platform(target_os, target_arch)),
            force: env::var_os("FOLIO_PDFIUM_FORCE_DOWNLOAD").is_some(),
        }
    }

    fn archive_names(&self) -> [String; 4] {
        [
            format!("pdfium-{}.tgz", self.platform),
            format!("pdfium-{}-{}.tgz", self.version, self.platform),
            format!("pdfium-{}.zip", self.platform),
            format!("pdfium-{}-{}.zip", self.version, self.platform),
        ]
    }

    fn url_for(&self, archive: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.tag.trim_matches('/'),
            archive
        )
    }
}

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    for name in WATCHED_ENV {
        println!("cargo:rerun-if-env-changed={}", name);
    }

    // Raster-only builds never touch pdfium.
    if env::var_os("CARGO_FEATURE_PDF").is_none()
        || env::var_os("FOLIO_PDFIUM_SKIP_DOWNLOAD").is_some()
        || env::var_os("PDFIUM_DYNAMIC_LIB_PATH").is_some()
        || env::var_os("PDFIUM_STATIC_LIB_PATH").is_some()
    {
        return Ok(());
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").context("OUT_DIR env var not set")?);
    let staging_dir = out_dir.join("pdfium");
    fs::create_dir_all(&staging_dir).context("failed to create staging directory")?;

    let target_os =
        env::var("CARGO_CFG_TARGET_OS").context("CARGO_CFG_TARGET_OS env var missing")?;
    let target_arch =
        env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH env var missing")?;

    if let Some(path) = locate_library(&staging_dir, &target_os) {
        return publish_library_path(&path);
    }

    let archive = match env::var_os("FOLIO_PDFIUM_ARCHIVE_PATH") {
        Some(path) => PathBuf::from(path),
        None => download(&Release::from_env(&target_os, &target_arch), &staging_dir)?,
    };
    extract_archive(&archive, &staging_dir)?;

    let library = locate_library(&staging_dir, &target_os).with_context(|| {
        format!("pdfium library not found in {:?} after extraction", staging_dir)
    })?;
    publish_library_path(&library)
}

fn publish_library_path(path: &Path) -> Result<()> {
    let path = path
        .to_str()
        .ok_or_else(|| anyhow!("library path {:?} is not UTF-8", path))?;
    println!("cargo:rustc-env=FOLIO_PDFIUM_LIBRARY_PATH={}", path);
    Ok(())
}

fn default_platform(target_os: &str, target_arch: &str) -> String {
    let platform = match (target_os, target_arch) {
        ("macos", "aarch64") => "mac-arm64",
        ("macos", "x86_64") => "mac-x64",
        ("linux", "aarch64") => "linux-arm64",
        ("linux", "arm") => "linux-arm",
        ("linux", "x86_64") => "linux-x64",
        ("windows", "aarch64") => "windows-arm64",
        ("windows", "x86_64") => "windows-x64",
        ("windows", "x86") => "windows-x86",
        (os, arch) => return format!("{}-{}", os, arch),
    };
    platform.to_string()
}

fn library_name(target_os: &str) -> &'static str {
    match target_os {
        "windows" => "pdfium.dll",
        "macos" => "libpdfium.dylib",
        _ => "libpdfium.so",
    }
}

fn locate_library(root: &Path, target_os: &str) -> Option<PathBuf> {
    let wanted = library_name(target_os);
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| entry.file_name().to_string_lossy() == wanted)
        .map(|entry| entry.into_path())
}

fn download(release: &Release, staging_dir: &Path) -> Result<PathBuf> {
    let cache = staging_dir.join("downloads");
    fs::create_dir_all(&cache).context("failed to create download cache directory")?;

    let mut failures = Vec::new();
    for name in release.archive_names() {
        let archive = cache.join(&name);
        if archive.exists() && !release.force {
            return Ok(archive);
        }
        let url = release.url_for(&name);
        match fetch_to(&url, &archive) {
            Ok(()) => return Ok(archive),
            Err(err) => failures.push(err.to_string()),
        }
    }

    Err(anyhow!(
        "failed to download pdfium {} for {}: {}",
        release.version,
        release.platform,
        failures.join("; ")
    ))
}

fn fetch_to(url: &str, destination: &Path) -> Result<()> {
    let agent = AgentBuilder::new()
        .timeout_read(Duration::from_secs(120))
        .timeout_write(Duration::from_secs(120))
        .build();

    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(UreqError::Status(code, _)) => return Err(anyhow!("GET {} returned {}", url, code)),
        Err(err) => return Err(anyhow!("GET {} failed: {}", url, err)),
    };

    let mut reader = response.into_reader();
    let mut file =
        File::create(destination).with_context(|| format!("failed to create {:?}", destination))?;
    io::copy(&mut reader, &mut file)
        .with_context(|| format!("failed to write {:?}", destination))?;
    file.flush().ok();
    Ok(())
}

fn extract_archive(archive: &Path, destination: &Path) -> Result<()> {
    // Keep the download cache, drop any previous extraction.
    for entry in fs::read_dir(destination)? {
        let entry = entry?;
        if entry.file_name() == "downloads" {
            continue;
        }
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.with_context(|| format!("failed to remove stale {:?}", path))?;
    }

    let extension = archive
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let file = File::open(archive).with_context(|| format!("failed to open {:?}", archive))?;

    match extension.as_str() {
        "tgz" | "gz" => Archive::new(GzDecoder::new(file))
            .unpack(destination)
            .with_context(|| format!("failed to unpack {:?}", archive)),
        "zip" => ZipArchive::new(file)
            .with_context(|| format!("failed to read zip archive {:?}", archive))?
            .extract(destination)
            .with_context(|| format!("failed to extract {:?}", archive)),
        _ => Err(anyhow!("unsupported archive format for {:?}", archive)),
    }
}
