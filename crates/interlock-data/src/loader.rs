//! Format detection (RON/JSON/TOML), file discovery, deserialization and
//! name resolution helpers used by the layout loading pipeline.

use interlock_core::network::TopologyError;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    #[error("unresolved {expected_kind} reference '{name}' in {file}")]
    UnresolvedRef {
        file: PathBuf,
        name: String,
        expected_kind: &'static str,
    },

    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// The definitions resolved but do not form a valid network.
    #[error("invalid network in {file}: {source}")]
    Topology {
        file: PathBuf,
        #[source]
        source: TopologyError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file from its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Look for `{base_name}.ron`, `.toml` or `.json` in `dir`.
///
/// `Ok(None)` when none exists; `ConflictingFormats` when more than one
/// does.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;
    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing,
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }
    Ok(found)
}

/// Like [`find_data_file`], but a missing file is an error.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, e: impl std::fmt::Display) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: e.to_string(),
    }
}

/// Read a file and deserialize it according to its extension.
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(path, e)),
    }
}

/// Deserialize a list. TOML has no top-level arrays, so there the list is
/// read from `toml_key`; RON and JSON hold the list directly.
pub fn deserialize_list<T: DeserializeOwned>(
    path: &Path,
    toml_key: &str,
) -> Result<Vec<T>, DataLoadError> {
    match detect_format(path)? {
        Format::Ron | Format::Json => deserialize_file(path),
        Format::Toml => {
            let content = std::fs::read_to_string(path)?;
            let table: toml::Value = toml::from_str(&content).map_err(|e| parse_error(path, e))?;
            let array = table
                .get(toml_key)
                .ok_or_else(|| parse_error(path, format!("missing key '{toml_key}' in TOML file")))?
                .clone();
            array
                .try_into()
                .map_err(|e: toml::de::Error| parse_error(path, e))
        }
    }
}

// ===========================================================================
// Name resolution helpers
// ===========================================================================

/// Look up a name, or fail with `UnresolvedRef`.
pub fn resolve_name<'a, V>(
    map: &'a HashMap<String, V>,
    name: &str,
    file: &Path,
    expected_kind: &'static str,
) -> Result<&'a V, DataLoadError> {
    map.get(name).ok_or_else(|| DataLoadError::UnresolvedRef {
        file: file.to_path_buf(),
        name: name.to_string(),
        expected_kind,
    })
}

/// Fail with `DuplicateName` if `name` is already in the map.
pub fn check_duplicate<V>(
    map: &HashMap<String, V>,
    name: &str,
    file: &Path,
) -> Result<(), DataLoadError> {
    if map.contains_key(name) {
        Err(DataLoadError::DuplicateName {
            file: file.to_path_buf(),
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SectionData, TrainData};
    use std::fs;

    /// A fresh directory per test.
    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "interlock_data_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    // -----------------------------------------------------------------------
    // detect_format
    // -----------------------------------------------------------------------

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format(Path::new("network.ron")).unwrap(), Format::Ron);
        assert_eq!(detect_format(Path::new("network.toml")).unwrap(), Format::Toml);
        assert_eq!(detect_format(Path::new("network.json")).unwrap(), Format::Json);
    }

    #[test]
    fn detect_format_unsupported() {
        for name in ["network.yaml", "network"] {
            assert!(matches!(
                detect_format(Path::new(name)),
                Err(DataLoadError::UnsupportedFormat { .. })
            ));
        }
    }

    // -----------------------------------------------------------------------
    // find_data_file / require_data_file
    // -----------------------------------------------------------------------

    #[test]
    fn find_data_file_found_and_missing() {
        let dir = make_test_dir("find");
        assert_eq!(find_data_file(&dir, "network").unwrap(), None);

        fs::write(dir.join("network.toml"), "").unwrap();
        assert_eq!(
            find_data_file(&dir, "network").unwrap(),
            Some(dir.join("network.toml"))
        );

        cleanup(&dir);
    }

    #[test]
    fn find_data_file_conflict() {
        let dir = make_test_dir("find_conflict");
        fs::write(dir.join("network.ron"), "()").unwrap();
        fs::write(dir.join("network.json"), "{}").unwrap();

        assert!(matches!(
            find_data_file(&dir, "network"),
            Err(DataLoadError::ConflictingFormats { .. })
        ));

        cleanup(&dir);
    }

    #[test]
    fn require_data_file_missing() {
        let dir = make_test_dir("require_missing");
        let result = require_data_file(&dir, "network");
        assert!(matches!(
            result,
            Err(DataLoadError::MissingRequired { ref file, .. }) if file == "network"
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // deserialize_file
    // -----------------------------------------------------------------------

    #[test]
    fn deserialize_file_each_format() {
        let dir = make_test_dir("deser");
        let ron_path = dir.join("a.ron");
        fs::write(&ron_path, r#"(name: "s1", length: 120.0)"#).unwrap();
        let json_path = dir.join("a.json");
        fs::write(&json_path, r#"{"name": "s1", "length": 120.0}"#).unwrap();
        let toml_path = dir.join("a.toml");
        fs::write(&toml_path, "name = \"s1\"\nlength = 120.0\n").unwrap();

        for path in [ron_path, json_path, toml_path] {
            let section: SectionData = deserialize_file(&path).unwrap();
            assert_eq!(section.name, "s1");
            assert_eq!(section.length, 120.0);
        }

        cleanup(&dir);
    }

    #[test]
    fn deserialize_file_parse_error() {
        let dir = make_test_dir("deser_parse_err");
        let path = dir.join("bad.ron");
        fs::write(&path, "this is not valid RON {{{").unwrap();

        let result: Result<SectionData, _> = deserialize_file(&path);
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));

        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // deserialize_list
    // -----------------------------------------------------------------------

    #[test]
    fn deserialize_list_toml_uses_key() {
        let dir = make_test_dir("list_toml");
        let path = dir.join("timetable.toml");
        fs::write(
            &path,
            r#"
[[trains]]
name = "IC 1"
length = 150.0

[[trains]]
name = "RE 2"
length = 80.0
priority = 3
"#,
        )
        .unwrap();

        let trains: Vec<TrainData> = deserialize_list(&path, "trains").unwrap();
        assert_eq!(trains.len(), 2);
        assert_eq!(trains[1].priority, 3);

        cleanup(&dir);
    }

    #[test]
    fn deserialize_list_toml_missing_key() {
        let dir = make_test_dir("list_toml_missing");
        let path = dir.join("timetable.toml");
        fs::write(&path, r#"foo = "bar""#).unwrap();

        let result: Result<Vec<TrainData>, _> = deserialize_list(&path, "trains");
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));

        cleanup(&dir);
    }

    #[test]
    fn deserialize_list_ron_is_bare() {
        let dir = make_test_dir("list_ron");
        let path = dir.join("timetable.ron");
        fs::write(&path, r#"[(name: "IC 1", length: 150.0)]"#).unwrap();

        let trains: Vec<TrainData> = deserialize_list(&path, "trains").unwrap();
        assert_eq!(trains[0].name, "IC 1");
        assert!(trains[0].stops.is_empty());

        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // resolve_name / check_duplicate
    // -----------------------------------------------------------------------

    #[test]
    fn resolve_name_found_and_missing() {
        let mut map = HashMap::new();
        map.insert("platform_1".to_string(), 7u32);

        let val = resolve_name(&map, "platform_1", Path::new("network.ron"), "section").unwrap();
        assert_eq!(*val, 7);

        let result = resolve_name(&map, "platform_9", Path::new("network.ron"), "section");
        assert!(matches!(
            result,
            Err(DataLoadError::UnresolvedRef { ref name, expected_kind: "section", .. }) if name == "platform_9"
        ));
    }

    #[test]
    fn check_duplicate_detects() {
        let mut map = HashMap::new();
        assert!(check_duplicate(&map, "s1", Path::new("network.ron")).is_ok());
        map.insert("s1".to_string(), 0u32);
        assert!(matches!(
            check_duplicate(&map, "s1", Path::new("network.ron")),
            Err(DataLoadError::DuplicateName { ref name, .. }) if name == "s1"
        ));
    }

    // -----------------------------------------------------------------------
    // Error display messages
    // -----------------------------------------------------------------------

    #[test]
    fn error_display_messages() {
        let e = DataLoadError::MissingRequired {
            file: "network".to_string(),
            dir: PathBuf::from("/data"),
        };
        assert!(format!("{e}").contains("network"));
        assert!(format!("{e}").contains("/data"));

        let e = DataLoadError::Topology {
            file: PathBuf::from("network.ron"),
            source: TopologyError::DuplicateName("s1".to_string()),
        };
        let msg = format!("{e}");
        assert!(msg.contains("network.ron"));
        assert!(msg.contains("s1"));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let data_err: DataLoadError = io_err.into();
        assert!(matches!(data_err, DataLoadError::Io(_)));
    }
}
