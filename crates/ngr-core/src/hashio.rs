//! Content hashing and atomic file I/O.
//!
//! Everything the agent writes to disk goes through [`write_file`]: parents
//! are created, the content lands in `<path>.tmp` and is renamed over the
//! target. A stale `.tmp` after a crash is discardable.
//!
//! Hashing a missing file yields the empty string and no error; the empty
//! hash is a signal ("nothing there"), not a failure.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha3::{Digest, Sha3_512};
use tracing::error;

use crate::config::Sha3V512;

/// Hex encoded SHA3-512 of a byte buffer.
#[must_use]
pub fn sha3_bytes(buf: &[u8]) -> Sha3V512 {
    let mut hasher = Sha3_512::new();
    hasher.update(buf);
    Sha3V512(hex::encode(hasher.finalize()))
}

/// Hex encoded SHA3-512 of a file, streamed.
///
/// A non-existent path yields the empty hash and no error.
///
/// # Errors
///
/// Returns any I/O error other than the file being absent.
pub fn sha3_file(path: impl AsRef<Path>) -> io::Result<Sha3V512> {
    let mut file = match fs::File::open(path.as_ref()) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Sha3V512::default()),
        Err(err) => return Err(err),
    };

    let mut hasher = Sha3_512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Sha3V512(hex::encode(hasher.finalize())))
}

/// Atomically writes `data` to `path` with the given Unix mode.
///
/// Missing parent directories are created with mode 0755. The data is first
/// written to `<path>.tmp` and then renamed; on failure the temp file is
/// removed again.
///
/// # Errors
///
/// Returns the underlying I/O error of the failing step.
pub fn write_file(path: impl AsRef<Path>, data: &[u8], mode: u32) -> io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
            }
        }
    }

    let tmp = tmp_path(path);

    let write_result = (|| {
        fs::write(&tmp, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        fs::rename(&tmp, path)
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp);
    }

    write_result
}

/// Atomically writes `obj` as pretty-printed JSON.
///
/// # Errors
///
/// Returns serialization failures as [`io::ErrorKind::InvalidData`] and I/O
/// failures verbatim.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, obj: &T, mode: u32) -> io::Result<()> {
    let buf = serde_json::to_vec_pretty(obj)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_file(path, &buf, mode)
}

/// Whether the file at `path` has exactly the content `other`.
///
/// A missing file is simply "not equal"; other read errors are logged and
/// treated the same way.
#[must_use]
pub fn equal_buf(path: impl AsRef<Path>, other: &[u8]) -> bool {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(buf) => buf == other,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            error!(file = %path.display(), %err, "failed to read file for comparison");
            false
        }
    }
}

/// Whether the JSON document at `path` decodes to a value equal to `other`.
///
/// A missing file is "not equal"; read and parse errors are logged and
/// treated the same way.
#[must_use]
pub fn equal_json<T: DeserializeOwned + PartialEq>(path: impl AsRef<Path>, other: &T) -> bool {
    let path = path.as_ref();
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return false,
        Err(err) => {
            error!(file = %path.display(), %err, "failed to read file for json comparison");
            return false;
        }
    };

    match serde_json::from_slice::<T>(&buf) {
        Ok(obj) => obj == *other,
        Err(err) => {
            error!(file = %path.display(), %err, "failed to parse file for json comparison");
            false
        }
    }
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    os.into()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn hash_of_missing_file_is_the_empty_signal() {
        let dir = TempDir::new().unwrap();
        let hash = sha3_file(dir.path().join("nope")).unwrap();
        assert!(hash.is_empty());
    }

    #[test]
    fn buffer_and_file_hashes_agree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"content addressed").unwrap();

        assert_eq!(sha3_file(&path).unwrap(), sha3_bytes(b"content addressed"));
    }

    #[test]
    fn known_digest() {
        // sha3-512 of the empty input
        assert_eq!(
            sha3_bytes(b"").as_str(),
            "a69f73cca23a9ac5c8b567dc185a756e97c982164fe25859e0d1dcc1475c80a6\
             15b2123af1f5f94c11e3e9402c3ac558f500199d95b6d3e301758586281dcd26"
        );
    }

    #[test]
    fn write_file_creates_parents_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.json");

        write_file(&path, b"{}", 0o644).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(!tmp_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn write_file_applies_the_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret");
        write_file(&path, b"s3", 0o600).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_file_replaces_content_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unit.service");
        write_file(&path, b"old", 0o644).unwrap();
        write_file(&path, b"new", 0o644).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn equal_buf_is_false_for_missing_files() {
        let dir = TempDir::new().unwrap();
        assert!(!equal_buf(dir.path().join("nope"), b"x"));

        let path = dir.path().join("present");
        fs::write(&path, b"x").unwrap();
        assert!(equal_buf(&path, b"x"));
        assert!(!equal_buf(&path, b"y"));
    }

    #[test]
    fn equal_json_compares_decoded_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj.json");
        fs::write(&path, "{\n  \"key\": \"v\",\n  \"value\": \"w\"\n}").unwrap();

        let same = crate::config::EnvVar {
            key: "v".into(),
            value: "w".into(),
        };
        assert!(equal_json(&path, &same));

        let different = crate::config::EnvVar {
            key: "v".into(),
            value: "other".into(),
        };
        assert!(!equal_json(&path, &different));
    }
}
