//! Directory listing and timestamp formats

use chrono::{DateTime, TimeDelta, Utc};
use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// `ls -l` switches from time to year for entries older than this.
const RECENT_DAYS: i64 = 180;

/// One directory entry, read at call time.
#[derive(Debug)]
pub struct Entry {
    pub name: String,
    pub metadata: Metadata,
}

/// Read `dir`, sorted by name.
pub async fn read_entries(dir: &Path) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let metadata = entry.metadata().await?;
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            metadata,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// A `LIST` line in unix `ls -l` style.
#[must_use]
pub fn list_line(entry: &Entry, now: DateTime<Utc>) -> String {
    let meta = &entry.metadata;
    let modified = meta
        .modified()
        .map_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH), DateTime::<Utc>::from);
    let when = if now.signed_duration_since(modified) < TimeDelta::days(RECENT_DAYS) {
        modified.format("%b %e %H:%M")
    } else {
        modified.format("%b %e  %Y")
    };
    format!(
        "{} 1 ftp ftp {:>12} {} {}\r\n",
        permissions(meta),
        meta.len(),
        when,
        entry.name
    )
}

/// An `MDTM` timestamp, `YYYYMMDDHHMMSS` in UTC.
#[must_use]
pub fn mdtm(meta: &Metadata) -> Option<String> {
    let modified = DateTime::<Utc>::from(meta.modified().ok()?);
    Some(modified.format("%Y%m%d%H%M%S").to_string())
}

#[cfg(unix)]
fn permissions(meta: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    mode_string(meta.permissions().mode(), meta.is_dir())
}

#[cfg(not(unix))]
fn permissions(meta: &Metadata) -> String {
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    mode_string(if meta.is_dir() { mode | 0o111 } else { mode }, meta.is_dir())
}

fn mode_string(mode: u32, is_dir: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 == 0 { '-' } else { 'r' });
        out.push(if bits & 0o2 == 0 { '-' } else { 'w' });
        out.push(if bits & 0o1 == 0 { '-' } else { 'x' });
    }
    out
}
