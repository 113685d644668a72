//! 8.3-style SD filename allocation: derive a base name from the local file,
//! then pick the smallest unused numeric suffix among files already on SD.

use std::collections::HashSet;
use std::path::Path;

use crate::error::FleetError;

/// First 6 characters of the stem, uppercased, spaces replaced with `_`,
/// right-padded with `0` to exactly 6 characters.
pub fn base_name(local_path: &Path) -> String {
    let stem = local_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("FILE");
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .take(6)
        .collect::<String>()
        .to_uppercase();
    let mut padded = cleaned;
    while padded.len() < 6 {
        padded.push('0');
    }
    padded
}

/// Pick the smallest unused suffix in `0..=9` for `base` among `existing_sd_files`
/// (as returned by `M20`, one name per line, trailing size info permitted).
/// Fails if all ten are taken.
pub fn allocate(local_path: &Path, existing_sd_files: &[String]) -> Result<String, FleetError> {
    let base = base_name(local_path);
    let prefix = format!("{base}_");

    let mut used = HashSet::new();
    for raw in existing_sd_files {
        let name = raw.split_whitespace().next().unwrap_or(raw);
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Some(num_str) = rest.strip_suffix(".GCO") {
                if let Ok(n) = num_str.parse::<u8>() {
                    used.insert(n);
                }
            }
        }
    }

    (0..10u8)
        .find(|n| !used.contains(n))
        .map(|n| format!("{prefix}{n}.GCO"))
        .ok_or_else(|| FleetError::value("Too many files with the same base name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn pads_short_stem_with_zeros() {
        assert_eq!(base_name(&PathBuf::from("ab.gcode")), "AB0000");
    }

    #[test]
    fn truncates_long_stem_to_six_chars() {
        assert_eq!(base_name(&PathBuf::from("a long filename.gcode")), "A_LONG");
    }

    #[test]
    fn spaces_become_underscores() {
        assert_eq!(base_name(&PathBuf::from("my part.gcode")), "MY_PAR");
    }

    #[test]
    fn first_upload_gets_suffix_zero() {
        let name = allocate(&PathBuf::from("part.gcode"), &[]).unwrap();
        assert_eq!(name, "PART00_0.GCO");
    }

    #[test]
    fn picks_smallest_unused_suffix() {
        let existing = vec!["PART00_0.GCO".to_string(), "PART00_1.GCO".to_string()];
        let name = allocate(&PathBuf::from("part.gcode"), &existing).unwrap();
        assert_eq!(name, "PART00_2.GCO");
    }

    #[test]
    fn eleventh_upload_of_same_base_fails() {
        let existing: Vec<String> = (0..10).map(|n| format!("PART00_{n}.GCO")).collect();
        let err = allocate(&PathBuf::from("part.gcode"), &existing).unwrap_err();
        assert!(matches!(err, FleetError::Value(_)));
    }

    #[test]
    fn unrelated_sd_files_do_not_block_allocation() {
        let existing = vec!["OTHER0_0.GCO".to_string()];
        let name = allocate(&PathBuf::from("part.gcode"), &existing).unwrap();
        assert_eq!(name, "PART00_0.GCO");
    }
}
