//! The per-root file table and match-record rendering.
//!
//! Each watched root keeps one `FileRecord` per known (relative) name. A
//! record survives deletion with `exists = false` so that since-queries can
//! report removals; its stat fields are then stale and are not rendered.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use serde_json::{Map, Value};

use crate::clock::{clock_id, ClockSpec, Ticks};

/// Field order of rendered file records. Contractual: the binary encoding's
/// template rows are positional against this list.
pub const FILE_FIELDS: [&str; 14] = [
    "name", "exists", "size", "mode", "uid", "gid", "mtime", "ctime", "ino", "dev", "nlink",
    "new", "oclock", "cclock",
];

/// What the daemon knows about one file in a root.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub exists: bool,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub ctime: i64,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    /// Tick at which a change to this file was last observed.
    pub otime: Ticks,
    /// Tick at which this file was first observed.
    pub ctick: Ticks,
}

impl FileRecord {
    pub fn from_metadata(md: &Metadata, tick: Ticks) -> Self {
        Self {
            exists: true,
            size: md.size(),
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            mtime: md.mtime(),
            ctime: md.ctime(),
            ino: md.ino(),
            dev: md.dev(),
            nlink: md.nlink(),
            otime: tick,
            ctick: tick,
        }
    }

    /// Refreshes stat data on an already-known file.
    pub fn update_from_metadata(&mut self, md: &Metadata, tick: Ticks) {
        let ctick = if self.exists { self.ctick } else { tick };
        *self = Self::from_metadata(md, tick);
        self.ctick = ctick;
    }

    pub fn mark_deleted(&mut self, tick: Ticks) {
        self.exists = false;
        self.otime = tick;
    }
}

/// Selects the records changed since `spec`, sorted by name.
///
/// Tick-based specs match on observation ticks (deletions included); a
/// fresh instance yields the full snapshot of existing files; timestamp
/// specs match existing files on wall-clock mtime/ctime.
pub fn changed_since<'a>(
    files: &'a HashMap<String, FileRecord>,
    spec: &ClockSpec,
) -> Vec<(&'a str, &'a FileRecord)> {
    let mut matched: Vec<(&str, &FileRecord)> = files
        .iter()
        .filter(|(_, rec)| match spec {
            ClockSpec::Ticks { fresh_instance: true, .. } => rec.exists,
            ClockSpec::Ticks { ticks, .. } => rec.otime > *ticks,
            ClockSpec::Timestamp(ts) => rec.exists && (rec.mtime >= *ts || rec.ctime >= *ts),
        })
        .map(|(name, rec)| (name.as_str(), rec))
        .collect();
    matched.sort_by(|a, b| a.0.cmp(b.0));
    matched
}

/// Selects every record the root knows, deletions included, sorted by name.
pub fn all_records<'a>(files: &'a HashMap<String, FileRecord>) -> Vec<(&'a str, &'a FileRecord)> {
    let mut matched: Vec<(&str, &FileRecord)> =
        files.iter().map(|(name, rec)| (name.as_str(), rec)).collect();
    matched.sort_by(|a, b| a.0.cmp(b.0));
    matched
}

/// Selects all existing records, sorted by name.
pub fn all_existing<'a>(files: &'a HashMap<String, FileRecord>) -> Vec<(&'a str, &'a FileRecord)> {
    let mut matched: Vec<(&str, &FileRecord)> = files
        .iter()
        .filter(|(_, rec)| rec.exists)
        .map(|(name, rec)| (name.as_str(), rec))
        .collect();
    matched.sort_by(|a, b| a.0.cmp(b.0));
    matched
}

fn is_new(rec: &FileRecord, since: Option<&ClockSpec>) -> bool {
    match since {
        Some(ClockSpec::Ticks { ticks, .. }) => rec.ctick > *ticks,
        Some(ClockSpec::Timestamp(ts)) => rec.ctime >= *ts,
        None => false,
    }
}

/// Renders one match record in the fixed field order.
///
/// Stat-derived fields are only rendered while the file exists; stale stat
/// data on a deleted file would be useless to report.
pub fn file_to_value(name: &str, rec: &FileRecord, since: Option<&ClockSpec>) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), Value::String(name.to_string()));
    obj.insert("exists".into(), Value::Bool(rec.exists));
    if rec.exists {
        obj.insert("size".into(), rec.size.into());
        obj.insert("mode".into(), rec.mode.into());
        obj.insert("uid".into(), rec.uid.into());
        obj.insert("gid".into(), rec.gid.into());
        obj.insert("mtime".into(), rec.mtime.into());
        obj.insert("ctime".into(), rec.ctime.into());
        obj.insert("ino".into(), rec.ino.into());
        obj.insert("dev".into(), rec.dev.into());
        obj.insert("nlink".into(), rec.nlink.into());
        if is_new(rec, since) {
            obj.insert("new".into(), Value::Bool(true));
        }
    }
    obj.insert("oclock".into(), Value::String(clock_id(rec.otime)));
    if rec.exists {
        obj.insert("cclock".into(), Value::String(clock_id(rec.ctick)));
    }
    Value::Object(obj)
}

/// Renders a match list into the `files` response array.
pub fn render_files(matches: &[(&str, &FileRecord)], since: Option<&ClockSpec>) -> Value {
    Value::Array(
        matches
            .iter()
            .map(|(name, rec)| file_to_value(name, rec, since))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(otime: Ticks, ctick: Ticks, exists: bool) -> FileRecord {
        FileRecord {
            exists,
            size: 12,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            mtime: 1_700_000_100,
            ctime: 1_700_000_000,
            ino: 99,
            dev: 1,
            nlink: 1,
            otime,
            ctick,
        }
    }

    #[test]
    fn deleted_records_render_no_stat_fields() {
        let rec = record(5, 2, false);
        let v = file_to_value("gone.txt", &rec, None);
        assert_eq!(v["exists"], false);
        assert!(v.get("size").is_none());
        assert!(v.get("mtime").is_none());
        assert!(v.get("cclock").is_none());
        assert!(v["oclock"].as_str().unwrap().starts_with("c:"));
    }

    #[test]
    fn existing_records_render_all_fields_in_order() {
        let rec = record(5, 5, true);
        let since = ClockSpec::Ticks { ticks: 3, fresh_instance: false };
        let v = file_to_value("a.txt", &rec, Some(&since));
        let keys: Vec<&str> = v.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, FILE_FIELDS);
        assert_eq!(v["new"], true);
    }

    #[test]
    fn new_flag_requires_creation_after_since() {
        let rec = record(5, 2, true);
        let since = ClockSpec::Ticks { ticks: 3, fresh_instance: false };
        let v = file_to_value("a.txt", &rec, Some(&since));
        assert!(v.get("new").is_none());
    }

    #[test]
    fn changed_since_ticks_includes_deletions() {
        let mut files = HashMap::new();
        files.insert("kept.txt".to_string(), record(2, 1, true));
        files.insert("gone.txt".to_string(), record(6, 1, false));
        files.insert("changed.txt".to_string(), record(5, 1, true));

        let spec = ClockSpec::Ticks { ticks: 4, fresh_instance: false };
        let matched = changed_since(&files, &spec);
        let names: Vec<&str> = matched.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["changed.txt", "gone.txt"]);
    }

    #[test]
    fn fresh_instance_is_full_snapshot_of_existing() {
        let mut files = HashMap::new();
        files.insert("a".to_string(), record(1, 1, true));
        files.insert("dead".to_string(), record(9, 1, false));

        let spec = ClockSpec::Ticks { ticks: 0, fresh_instance: true };
        let matched = changed_since(&files, &spec);
        let names: Vec<&str> = matched.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn timestamp_since_matches_on_mtime_or_ctime() {
        let mut files = HashMap::new();
        files.insert("old".to_string(), record(1, 1, true));
        let matched = changed_since(&files, &ClockSpec::Timestamp(1_700_000_050));
        assert_eq!(matched.len(), 1); // mtime is newer than the cutoff
        let matched = changed_since(&files, &ClockSpec::Timestamp(1_800_000_000));
        assert!(matched.is_empty());
    }

    #[test]
    fn update_preserves_creation_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let md = std::fs::metadata(&path).unwrap();

        let mut rec = FileRecord::from_metadata(&md, 3);
        assert_eq!((rec.otime, rec.ctick), (3, 3));
        rec.update_from_metadata(&md, 8);
        assert_eq!((rec.otime, rec.ctick), (8, 3));

        rec.mark_deleted(9);
        rec.update_from_metadata(&md, 12);
        // A re-created file is new again.
        assert_eq!((rec.otime, rec.ctick), (12, 12));
    }
}
