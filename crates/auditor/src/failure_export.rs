use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

/// A wallet that exhausted its retries in some run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEntry {
    pub wallet: String,
    pub error_kind: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureEntry {
    pub fn now(wallet: &str, error_kind: &str) -> Self {
        Self {
            wallet: wallet.to_string(),
            error_kind: error_kind.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.wallet,
            self.error_kind,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Parse one export line. Two-field `wallet,reason` lines from older files
/// carry no timestamp and sort before anything newer.
pub fn parse_line(line: &str) -> Option<FailureEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (wallet, rest) = line.split_once(',').unwrap_or((line, ""));
    let wallet = wallet.trim();
    if wallet.is_empty() {
        return None;
    }
    let (error_kind, timestamp) = match rest.rsplit_once(',') {
        Some((kind, raw)) => match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => (kind, ts.with_timezone(&Utc)),
            Err(_) => (rest, DateTime::UNIX_EPOCH),
        },
        None => (rest, DateTime::UNIX_EPOCH),
    };
    let error_kind = error_kind.trim();
    Some(FailureEntry {
        wallet: wallet.to_string(),
        error_kind: if error_kind.is_empty() { "unknown" } else { error_kind }.to_string(),
        timestamp,
    })
}

/// Merge `new` into the export at `path`. Keeps one entry per wallet (the
/// newest), sorted by wallet, with a fresh comment header. Returns the
/// number of wallets in the file afterwards.
pub fn merge_into_file(path: &Path, new: &[FailureEntry]) -> Result<usize> {
    let mut merged: BTreeMap<String, FailureEntry> = BTreeMap::new();

    match std::fs::read_to_string(path) {
        Ok(existing) => {
            for entry in existing.lines().filter_map(parse_line) {
                keep_newest(&mut merged, entry);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    }
    for entry in new {
        keep_newest(&mut merged, entry.clone());
    }

    let mut out = String::new();
    out.push_str("# Wallets that exhausted retries during audit runs.\n");
    out.push_str("# Format: wallet,error_kind,timestamp (RFC 3339)\n");
    out.push_str(&format!("# Updated: {}\n", Utc::now().to_rfc3339()));
    for entry in merged.values() {
        out.push_str(&entry.to_line());
        out.push('\n');
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // Write then rename so a crash never leaves a half-written export.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, out).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(merged.len())
}

fn keep_newest(merged: &mut BTreeMap<String, FailureEntry>, entry: FailureEntry) {
    match merged.get(&entry.wallet) {
        Some(current) if current.timestamp > entry.timestamp => {}
        _ => {
            merged.insert(entry.wallet.clone(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(wallet: &str, kind: &str, secs: i64) -> FailureEntry {
        FailureEntry {
            wallet: wallet.into(),
            error_kind: kind.into(),
            timestamp: at(secs),
        }
    }

    fn data_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_line_formats() {
        assert_eq!(
            parse_line("W1,rate_limited,1970-01-01T00:01:40+00:00"),
            Some(entry("W1", "rate_limited", 100))
        );
        assert_eq!(
            parse_line("W2,timeout"),
            Some(FailureEntry {
                wallet: "W2".into(),
                error_kind: "timeout".into(),
                timestamp: DateTime::UNIX_EPOCH,
            })
        );
        assert_eq!(parse_line("# header"), None);
        assert_eq!(parse_line("   "), None);
        // A legacy reason may itself contain commas.
        assert_eq!(
            parse_line("W3,bad payload, no pnl").map(|e| e.error_kind),
            Some("bad payload, no pnl".to_string())
        );
    }

    #[test]
    fn test_merge_creates_file_with_header_and_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("failed_wallets.txt");

        let n = merge_into_file(
            &path,
            &[entry("Zed", "network", 10), entry("Abe", "circuit_open", 20)],
        )
        .unwrap();
        assert_eq!(n, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Wallets that exhausted retries"));
        let lines = data_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Abe,circuit_open,"));
        assert!(lines[1].starts_with("Zed,network,"));
    }

    #[test]
    fn test_merge_keeps_old_entries_and_newest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_wallets.txt");
        std::fs::write(
            &path,
            "# old header\nLegacy,some reason\nW1,rate_limited,1970-01-01T00:16:40+00:00\n",
        )
        .unwrap();

        let n = merge_into_file(
            &path,
            &[entry("W1", "forbidden", 2_000), entry("W2", "malformed", 5)],
        )
        .unwrap();
        assert_eq!(n, 3);

        let lines = data_lines(&path);
        assert_eq!(lines[0], "Legacy,some reason,1970-01-01T00:00:00+00:00");
        assert!(lines[1].starts_with("W1,forbidden,"));
        assert!(lines[2].starts_with("W2,malformed,"));

        // An older entry for W1 does not replace the newer one.
        merge_into_file(&path, &[entry("W1", "network", 1)]).unwrap();
        assert!(data_lines(&path)[1].starts_with("W1,forbidden,"));
        assert!(!dir.path().join("failed_wallets.tmp").exists());
    }
}
