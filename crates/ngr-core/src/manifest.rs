//! Backup manifest model.
//!
//! A [`Manifest`] is the record committed at the end of a backup run. It names
//! every blob that composes an instance and is the sole source of truth for a
//! later restore; runner-local path layout is derived from the runner version,
//! never from the manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Sha3V512;

/// One backed-up regular file.
///
/// `name` is always relative to the backup root and contains all relevant
/// directory fragments, e.g. `/var/lib/ngr/1234/files/a/b.bin` becomes
/// `files/a/b.bin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content hash of the stored blob. For uploaded files this is the hash
    /// the server computed, which is canonical.
    #[serde(default, skip_serializing_if = "Sha3V512::is_empty")]
    pub hash: Sha3V512,

    /// Size in bytes.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,

    /// Modification time observed when the file was read.
    #[serde(rename = "lastModified", default = "unix_epoch")]
    pub last_modified: DateTime<Utc>,

    /// When this entry was recorded at the remote side.
    #[serde(rename = "uploadedAt", default = "unix_epoch")]
    pub uploaded_at: DateTime<Utc>,

    /// Unix file mode bits, restored verbatim.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mode: u32,

    /// Tree-relative file name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Default for FileEntry {
    fn default() -> Self {
        Self {
            hash: Sha3V512::default(),
            size: 0,
            last_modified: unix_epoch(),
            uploaded_at: unix_epoch(),
            mode: 0,
            name: String::new(),
        }
    }
}

/// The committed description of one instance backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    /// The instance this backup belongs to.
    #[serde(rename = "instanceId", skip_serializing_if = "String::is_empty")]
    pub instance_id: String,

    /// The instance executable. Backup root is `/opt/ngr/`, which is implicit
    /// and may change between runner versions.
    pub exec: FileEntry,

    /// All regular files of the data tree. Backup root is
    /// `/var/lib/ngr/<instance id>`, implicit as well.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<FileEntry>,
}

pub(crate) fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips() {
        let manifest = Manifest {
            instance_id: "svc-a".into(),
            exec: FileEntry {
                hash: Sha3V512("ab".into()),
                size: 4,
                mode: 0o755,
                name: "svc-a".into(),
                ..FileEntry::default()
            },
            data: vec![FileEntry {
                hash: Sha3V512("cd".into()),
                size: 2,
                mode: 0o644,
                name: "files/x".into(),
                ..FileEntry::default()
            }],
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn entry_names_stay_tree_relative() {
        let json = r#"{"hash":"ff","size":9,"mode":420,"name":"files/a/b.bin",
                       "lastModified":"2025-05-01T10:00:00Z","uploadedAt":"2025-05-01T10:00:01Z"}"#;
        let entry: FileEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.name, "files/a/b.bin");
        assert_eq!(entry.mode, 0o644);
    }
}
