//! In-memory ZIP archives for multi-path and directory downloads.
//!
//! The remote tree is read first; the archive itself is built on the
//! blocking pool. The whole archive lives in memory until it is sent.

use super::{basename, join_path, RemoteFs};
use sshgate_core::{GateError, GateResult};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One archive member. `data == None` marks a directory.
#[derive(Debug)]
struct ArchiveItem {
    name: String,
    data: Option<Vec<u8>>,
}

/// Archive name for a downloaded directory, without the `.zip` suffix.
pub fn archive_stem(path: &str) -> &str {
    match basename(path) {
        "" => "root",
        name => name,
    }
}

/// Build a ZIP holding every path in `paths`. Directories are walked
/// recursively and stored under their own name; files sit at the top level.
pub async fn build_zip(fs: &dyn RemoteFs, paths: &[&str]) -> GateResult<Vec<u8>> {
    let mut items = Vec::new();
    let mut top_level = HashSet::new();

    for path in paths {
        let attrs = fs.stat(path).await?;
        let name = unique_name(&mut top_level, archive_stem(path));
        if attrs.is_dir {
            collect_dir(fs, path, &name, &mut items).await?;
        } else {
            let data = fs.read_file(path).await?;
            items.push(ArchiveItem {
                name,
                data: Some(data),
            });
        }
    }

    debug!(members = items.len(), "building archive");
    tokio::task::spawn_blocking(move || write_zip(items))
        .await
        .map_err(|e| GateError::Other(format!("archive task failed: {e}")))?
}

async fn collect_dir(
    fs: &dyn RemoteFs,
    root: &str,
    prefix: &str,
    items: &mut Vec<ArchiveItem>,
) -> GateResult<()> {
    let mut pending = vec![(root.to_string(), prefix.to_string())];

    while let Some((dir, rel)) = pending.pop() {
        items.push(ArchiveItem {
            name: format!("{rel}/"),
            data: None,
        });

        for entry in fs.read_dir(&dir).await? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let remote = join_path(&dir, &entry.name);
            let member = format!("{rel}/{}", entry.name);
            if entry.attrs.is_dir {
                pending.push((remote, member));
                continue;
            }
            // Links to files are archived as the file. Links to directories
            // are not followed, so a link back up the tree cannot loop.
            if entry.attrs.is_symlink() {
                match fs.stat(&remote).await {
                    Ok(target) if !target.is_dir => {}
                    Ok(_) => {
                        debug!(path = %remote, "skipping link to a directory");
                        continue;
                    }
                    Err(GateError::Transfer(e)) => {
                        debug!(path = %remote, error = %e, "skipping dangling link");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let data = fs.read_file(&remote).await?;
            items.push(ArchiveItem {
                name: member,
                data: Some(data),
            });
        }
    }

    Ok(())
}

/// `name`, or `name (2)`, `name (3)`... if already taken.
fn unique_name(taken: &mut HashSet<String>, name: &str) -> String {
    let mut candidate = name.to_string();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{name} ({n})");
        n += 1;
    }
    candidate
}

fn write_zip(items: Vec<ArchiveItem>) -> GateResult<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for item in items {
        match item.data {
            None => zip
                .add_directory(item.name, options)
                .map_err(zip_error)?,
            Some(bytes) => {
                zip.start_file(item.name, options).map_err(zip_error)?;
                zip.write_all(&bytes)?;
            }
        }
    }

    let cursor = zip.finish().map_err(zip_error)?;
    Ok(cursor.into_inner())
}

fn zip_error(e: zip::result::ZipError) -> GateError {
    GateError::Transfer(format!("archive: {e}"))
}
