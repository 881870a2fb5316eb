//! Preset table
//!
//! A preset is a named, ordered list of option applications recorded as
//! `(name, args)` pairs and substituted into a URL wherever
//! `preset:<name>` appears. The table is built at startup from the
//! `IMGPROXY_PRESETS` variable and/or a presets file (one per line,
//! `name=opt:arg/opt:arg/…`, `#` comments and blank lines ignored) and
//! is immutable afterwards.

use std::collections::HashMap;
use std::collections::HashSet;

use super::parse::apply_option;
use super::ProcessingOptions;
use crate::error::ServiceError;

pub type PresetEntries = Vec<(String, Vec<String>)>;

#[derive(Debug, Clone, Default)]
pub struct Presets {
    table: HashMap<String, PresetEntries>,
}

impl Presets {
    pub fn get(&self, name: &str) -> Option<&PresetEntries> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    /// Parses one `name=directives` line into the table. Blank lines
    /// and `#` comments are accepted and skipped.
    pub fn insert_line(&mut self, line: &str) -> Result<(), ServiceError> {
        if let Some((name, entries)) = parse_preset_line(line)? {
            self.table.insert(name, entries);
        }
        Ok(())
    }

    /// Startup validation: every preset must apply cleanly to default
    /// options, which also rejects unknown nested presets and cycles.
    pub fn validate(&self, default_quality: u8) -> Result<(), ServiceError> {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();

        for name in names {
            let mut po = ProcessingOptions::new(default_quality);
            let mut visited = HashSet::new();
            for (opt, args) in self.get(name).expect("name from table") {
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                apply_option(&mut po, opt, &arg_refs, self, &mut visited).map_err(|e| {
                    ServiceError::invalid_path(format!(
                        "preset {} is invalid: {}",
                        name,
                        e.internal_message()
                    ))
                })?;
            }
        }
        Ok(())
    }
}

/// Parses `name=opt:arg/opt:arg/…`. Returns `None` for blank and
/// comment lines.
pub fn parse_preset_line(line: &str) -> Result<Option<(String, PresetEntries)>, ServiceError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (name, directives) = line
        .split_once('=')
        .ok_or_else(|| ServiceError::invalid_path(format!("invalid preset string: {}", line)))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::invalid_path(format!(
            "empty preset name: {}",
            line
        )));
    }

    let mut entries = Vec::new();
    for directive in directives.trim().split('/') {
        if directive.is_empty() {
            continue;
        }
        let mut args = directive.split(':');
        let opt = args.next().expect("split yields at least one item");
        entries.push((
            opt.to_string(),
            args.map(str::to_string).collect::<Vec<String>>(),
        ));
    }

    if entries.is_empty() {
        return Err(ServiceError::invalid_path(format!(
            "empty preset: {}",
            name
        )));
    }

    Ok(Some((name.to_string(), entries)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let (name, entries) = parse_preset_line("thumb=rs:fill/s:64:64/q:70")
            .unwrap()
            .unwrap();
        assert_eq!(name, "thumb");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("rs".to_string(), vec!["fill".to_string()]));
        assert_eq!(
            entries[1],
            ("s".to_string(), vec!["64".to_string(), "64".to_string()])
        );
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        assert!(parse_preset_line("").unwrap().is_none());
        assert!(parse_preset_line("   ").unwrap().is_none());
        assert!(parse_preset_line("# disabled=w:1").unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_fails() {
        assert!(parse_preset_line("no-equals-sign").is_err());
        assert!(parse_preset_line("=w:1").is_err());
        assert!(parse_preset_line("empty=").is_err());
    }

    #[test]
    fn test_validate_accepts_good_table() {
        let mut presets = Presets::default();
        presets.insert_line("thumb=s:64:64/q:70").unwrap();
        presets.insert_line("banner=rs:fill:728:90").unwrap();
        assert!(presets.validate(80).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_option() {
        let mut presets = Presets::default();
        presets.insert_line("broken=q:400").unwrap();
        let err = presets.validate(80).unwrap_err();
        assert!(err.internal_message().contains("broken"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut presets = Presets::default();
        presets.insert_line("a=pr:b").unwrap();
        presets.insert_line("b=pr:a").unwrap();
        let err = presets.validate(80).unwrap_err();
        assert!(err.internal_message().contains("cycle") || err.internal_message().contains("invalid"));
    }

    #[test]
    fn test_validate_allows_nested_presets() {
        let mut presets = Presets::default();
        presets.insert_line("base=q:70").unwrap();
        presets.insert_line("thumb=pr:base/s:64:64").unwrap();
        assert!(presets.validate(80).is_ok());
    }
}
