//! Directory listing assembly.

use super::{join_path, RemoteAttrs, RemoteEntry};
use chrono::{DateTime, Utc};
use sshgate_core::FileEntry;
use std::cmp::Ordering;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Turn raw entries of `dir` into the listing sent to the browser.
///
/// `.` and `..` from the server are dropped; a synthetic `..` is put first
/// unless `dir` is the root. The rest is directories first, then names
/// compared case-insensitively.
pub fn build_listing(dir: &str, raw: Vec<RemoteEntry>) -> Vec<FileEntry> {
    let mut files: Vec<FileEntry> = raw
        .into_iter()
        .filter(|e| e.name != "." && e.name != ".." && !e.name.is_empty())
        .map(|e| FileEntry {
            longname: longname(&e.name, &e.attrs),
            path: join_path(dir, &e.name),
            is_directory: e.attrs.is_dir,
            size: e.attrs.size,
            mtime: e.attrs.mtime,
            name: e.name,
        })
        .collect();

    files.sort_by(listing_order);

    if dir != "/" {
        let attrs = RemoteAttrs {
            is_dir: true,
            permissions: Some(S_IFDIR | 0o755),
            ..Default::default()
        };
        files.insert(
            0,
            FileEntry {
                name: "..".into(),
                longname: longname("..", &attrs),
                is_directory: true,
                size: 0,
                mtime: 0,
                path: parent(dir).to_string(),
            },
        );
    }

    files
}

/// Directories before files, then case-insensitive name, then exact name so
/// the order is total.
pub fn listing_order(a: &FileEntry, b: &FileEntry) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

/// Parent of an absolute path. The parent of a top-level entry is `/`.
pub fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// `ls -l` style line for one entry.
pub fn longname(name: &str, attrs: &RemoteAttrs) -> String {
    let date = DateTime::<Utc>::from_timestamp(attrs.mtime as i64, 0)
        .map(|t| t.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "Jan 01 00:00".to_string());
    format!(
        "{} 1 - - {:>10} {} {}",
        mode_string(attrs),
        attrs.size,
        date,
        name
    )
}

fn mode_string(attrs: &RemoteAttrs) -> String {
    let Some(mode) = attrs.permissions else {
        let kind = if attrs.is_dir { 'd' } else { '-' };
        return format!("{kind}?????????");
    };

    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        0 if attrs.is_dir => 'd',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
