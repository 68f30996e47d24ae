//! Post-processing of downloaded products: splitting stored multipart
//! responses into their parts and writing the manifest consumed by the ODA
//! registration scripts.

use crate::error::{Error, Result};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// Splits any `multipart/mixed` response file stored in `product_dir` into
/// its parts, then writes the `MANIFEST` file pointing the ODA scripts at
/// the metadata and data files. Returns the manifest path.
///
/// # Errors
///
/// Fails if the directory cannot be read or contains no product files.
pub fn split_and_create_mf(product_dir: &Path, ncn_id: &str) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(product_dir)? {
        let path = entry?.path();
        if path.is_file() && path.file_name().map(|n| n != MANIFEST_FILE_NAME) == Some(true) {
            entries.push(path);
        }
    }
    entries.sort();

    let mut files = Vec::new();
    for path in entries {
        match split_multipart_file(&path)? {
            Some(mut parts) => files.append(&mut parts),
            None => files.push(path),
        }
    }
    if files.is_empty() {
        return Err(Error::Ingestion {
            message: format!("No product files in {}", product_dir.display()),
        });
    }

    let (metadata, data): (Vec<&PathBuf>, Vec<&PathBuf>) = files
        .iter()
        .partition(|p| p.extension().map(|e| e == "xml") == Some(true));

    write_manifest(product_dir, ncn_id, metadata.first().copied(), &data)
}

/// Writes a manifest for an already unpacked local product.
pub fn create_manifest(
    product_dir: &Path,
    ncn_id: &str,
    metadata: &Path,
    data: &Path,
) -> Result<PathBuf> {
    write_manifest(
        product_dir,
        ncn_id,
        Some(&metadata.to_path_buf()),
        &[&data.to_path_buf()],
    )
}

fn write_manifest(
    product_dir: &Path,
    ncn_id: &str,
    metadata: Option<&PathBuf>,
    data: &[&PathBuf],
) -> Result<PathBuf> {
    let mf_path = product_dir.join(MANIFEST_FILE_NAME);
    let mut mf = std::fs::File::create(&mf_path)?;

    writeln!(mf, "SCENARIO_NCN_ID=\"{ncn_id}\"")?;
    writeln!(mf, "DOWNLOAD_DIR=\"{}\"", product_dir.display())?;
    if let Some(metadata) = metadata {
        writeln!(mf, "METADATA=\"{}\"", metadata.display())?;
    }
    let data_list: Vec<String> = data.iter().map(|p| p.display().to_string()).collect();
    writeln!(mf, "DATA=\"{}\"", data_list.join(","))?;

    info!("Wrote manifest {}", mf_path.display());
    Ok(mf_path)
}

/// Splits `path` when it holds a MIME multipart body; returns the written
/// part files, or `None` for ordinary files. The original file is removed
/// after a successful split.
fn split_multipart_file(path: &Path) -> Result<Option<Vec<PathBuf>>> {
    let content = std::fs::read(path)?;
    let boundary = match multipart_boundary(&content) {
        Some(boundary) => boundary,
        None => return Ok(None),
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "part".to_owned());

    let mut parts = Vec::new();
    let delimiter = [b"--" as &[u8], boundary.as_bytes()].concat();
    for (i, raw_part) in split_on(&content, &delimiter).into_iter().enumerate() {
        let Some((headers, body)) = split_headers(raw_part) else {
            continue;
        };
        if body.is_empty() {
            continue;
        }
        let headers = String::from_utf8_lossy(headers).to_lowercase();
        let ext = if headers.contains("xml") {
            "xml"
        } else if headers.contains("tiff") {
            "tif"
        } else {
            "dat"
        };
        let part_path = dir.join(format!("{stem}_part{}.{ext}", i + 1));
        std::fs::write(&part_path, body)?;
        parts.push(part_path);
    }

    if parts.is_empty() {
        warn!(
            "{} looks multipart but yielded no parts, keeping it as-is",
            path.display()
        );
        return Ok(None);
    }
    std::fs::remove_file(path)?;
    Ok(Some(parts))
}

/// The boundary token when the file starts with a multipart delimiter line.
fn multipart_boundary(content: &[u8]) -> Option<String> {
    if !content.starts_with(b"--") {
        return None;
    }
    let line_end = content.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&content[2..line_end]);
    let boundary = line.trim_end_matches('\r').trim();
    if boundary.is_empty() {
        return None;
    }
    // a delimiter line must reappear, otherwise this is not multipart
    Some(boundary.to_owned()).filter(|b| {
        let delimiter = format!("--{b}");
        content[line_end..]
            .windows(delimiter.len())
            .any(|w| w == delimiter.as_bytes())
    })
}

fn split_on<'a>(content: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + delimiter.len() <= content.len() {
        if &content[i..i + delimiter.len()] == delimiter {
            if i > start {
                sections.push(&content[start..i]);
            }
            i += delimiter.len();
            start = i;
        } else {
            i += 1;
        }
    }
    if start < content.len() {
        sections.push(&content[start..]);
    }
    sections
}

/// Splits a part into its header block and body at the first empty line.
fn split_headers(part: &[u8]) -> Option<(&[u8], &[u8])> {
    for sep in [b"\r\n\r\n" as &[u8], b"\n\n"] {
        if let Some(at) = part.windows(sep.len()).position(|w| w == sep) {
            let body = &part[at + sep.len()..];
            let body = strip_trailing_newline(body);
            return Some((&part[..at], body));
        }
    }
    None
}

fn strip_trailing_newline(body: &[u8]) -> &[u8] {
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    body.strip_suffix(b"\r").unwrap_or(body)
}

/// Arguments for one ODA ingestion script invocation. When the scenario has
/// catalogue registration enabled, the script additionally receives the
/// site's registration helper.
pub fn script_args(script: &Path, manifest: &Path, catreg: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        script.display().to_string(),
        manifest.display().to_string(),
    ];
    if let Some(catreg) = catreg {
        args.push(format!("-catreg={}", catreg.display()));
    }
    args
}
