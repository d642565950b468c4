//! `livegate setup`: downloads the ONNX models listed in the manifest and
//! checks the operator-supplied ones.

use anyhow::{bail, Context, Result};
use livegate_models::{sha256_file_hex, verify_models_dir, ModelFile, MODELS};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Determine the model directory.
///
/// When running as root (UID 0), defaults to `/var/lib/livegate/models` (system-wide).
/// Otherwise defaults to `$XDG_DATA_HOME/livegate/models`.
fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/livegate/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("livegate/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Download a single model file with progress output.
fn download_model(model: &ModelFile, url: &str, expected: &str, dest: &Path) -> Result<()> {
    let tmp_path = dest.with_extension("onnx.part");

    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        if let Some(len) = content_length.filter(|len| *len > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    print!("  verifying checksum... ");
    io::stdout().flush().ok();
    let digest = sha256_file_hex(&tmp_path)?;
    if digest != expected {
        fs::remove_file(&tmp_path).ok();
        bail!(
            "checksum mismatch for {}:\n  expected: {}\n  got:      {}",
            model.name,
            expected,
            digest
        );
    }
    println!("ok");

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    Ok(())
}

/// Run the setup command: download and verify ONNX models.
pub fn run(model_dir: Option<String>) -> Result<()> {
    let dir = match model_dir {
        Some(d) => PathBuf::from(d),
        None => default_model_dir(),
    };

    println!("Model directory: {}", dir.display());

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut downloaded = 0;
    let mut skipped = 0;
    let mut operator_missing = Vec::new();

    for model in MODELS {
        let dest = dir.join(model.name);
        let (Some(url), Some(expected)) = (model.url, model.sha256) else {
            if dest.is_file() {
                println!("  {} present (operator supplied)", model.name);
            } else {
                operator_missing.push(model.name);
            }
            continue;
        };

        if dest.exists() {
            match sha256_file_hex(&dest) {
                Ok(digest) if digest == expected => {
                    println!("  {} already present (checksum ok)", model.name);
                    skipped += 1;
                    continue;
                }
                Ok(_) => {
                    println!("  {} exists but checksum differs, re-downloading", model.name);
                }
                Err(_) => {
                    println!("  {} exists but unreadable, re-downloading", model.name);
                }
            }
        }

        download_model(model, url, expected, &dest)?;
        downloaded += 1;
    }

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All downloadable models already present. Nothing to download.");
    }

    println!();
    match verify_models_dir(&dir) {
        Ok(()) => println!("All models verified."),
        Err(e) => {
            println!("Model set incomplete: {e}");
            if !operator_missing.is_empty() {
                println!("Models to install manually into {}:", dir.display());
                for name in &operator_missing {
                    println!("  {name}");
                }
            }
            println!("The daemon runs without them, with the matching capability disabled.");
        }
    }

    Ok(())
}
