//! XTLDR.INI configuration parsing and kernel command-line assembly.
//!
//! Grounded on `xtldr/config.c`'s `BlpParseConfigFile`: `[Section]` headers
//! followed by `Key=Value` lines (quotes around a value are stripped, `;`
//! introduces a comment), collected per-section in file order. The
//! original's `[XTLDR]` section configures the loader itself
//! (`BlpUpdateConfiguration`); every other section names a bootable OS
//! entry. Rendered here as an owned `Vec<(String, String)>` per section
//! rather than the original's pool-allocated linked list, since the whole
//! file is read once into memory before boot and never mutated concurrently.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{LdrResult, Status};

pub struct ConfigSection {
    pub name: String,
    pub options: Vec<(String, String)>,
}

impl ConfigSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a whole `XTLDR.INI` file's text into an ordered list of sections.
pub fn parse_ini(text: &str) -> LdrResult<Vec<ConfigSection>> {
    let mut sections = Vec::new();
    let mut current: Option<ConfigSection> = None;

    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(ConfigSection {
                name: name.trim().to_string(),
                options: Vec::new(),
            });
            continue;
        }

        let (key, value) = line.split_once('=').ok_or(Status::InvalidParameter)?;
        let key = key.trim().to_string();
        let value = unquote(value.trim()).to_string();

        match current.as_mut() {
            Some(section) => section.options.push((key, value)),
            None => return Err(Status::InvalidParameter),
        }
    }

    if let Some(section) = current.take() {
        sections.push(section);
    }

    Ok(sections)
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// The loader's own settings, drawn from the `[XTLDR]` section.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub default_entry: Option<String>,
    pub timeout_seconds: u32,
    pub debug: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            default_entry: None,
            timeout_seconds: 5,
            debug: None,
        }
    }
}

/// Splits the loader's own `[XTLDR]` section out of the parsed file, leaving
/// the rest as bootable entries.
pub fn extract_loader_section(sections: Vec<ConfigSection>) -> (LoaderConfig, Vec<ConfigSection>) {
    let mut config = LoaderConfig::default();
    let mut entries = Vec::with_capacity(sections.len());

    for section in sections {
        if section.name.eq_ignore_ascii_case("XTLDR") {
            if let Some(v) = section.get("DEFAULT") {
                config.default_entry = Some(v.to_string());
            }
            if let Some(v) = section.get("TIMEOUT") {
                if let Ok(n) = v.parse() {
                    config.timeout_seconds = n;
                }
            }
            if let Some(v) = section.get("DEBUG") {
                config.debug = Some(v.to_string());
            }
        } else {
            entries.push(section);
        }
    }

    (config, entries)
}

/// Splits a UEFI load-options string (`KEY=VALUE KEY2=VALUE2 ...`,
/// whitespace separated, values with embedded spaces wrapped in quotes) into
/// ordered key/value pairs. Grounded on `xtldr/xtldr.c`'s
/// `BlpParseCommandLine`, which walks the same kind of whitespace-delimited
/// `key=value` token stream carried in `LoadedImage->LoadOptions`.
pub fn parse_cli_options(raw: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = raw.trim().chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        let mut in_quotes = false;
        loop {
            match chars.peek() {
                None => break,
                Some(&c) if c == '"' => {
                    in_quotes = !in_quotes;
                    chars.next();
                }
                Some(&c) if c.is_whitespace() && !in_quotes => break,
                Some(&c) => {
                    token.push(c);
                    chars.next();
                }
            }
        }

        if let Some((key, value)) = token.split_once('=') {
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    pairs
}

/// Applies CLI key/value pairs over an already-parsed `LoaderConfig`. CLI
/// values always win over whatever `XTLDR.INI` set, since the command line
/// is the more specific, more recently supplied source of configuration.
pub fn apply_cli_overrides(config: &mut LoaderConfig, cli: &[(String, String)]) {
    for (key, value) in cli {
        if key.eq_ignore_ascii_case("DEFAULT") {
            config.default_entry = Some(value.clone());
        } else if key.eq_ignore_ascii_case("TIMEOUT") {
            if let Ok(n) = value.parse() {
                config.timeout_seconds = n;
            }
        } else if key.eq_ignore_ascii_case("DEBUG") {
            config.debug = Some(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_keys_in_order() {
        let text = "[XTLDR]\nDEFAULT=\"exectos\"\nTIMEOUT=3\n\n[exectos]\nKERNEL=\\XTOSKRNL.EXE\nDEBUG=COM1\n";
        let sections = parse_ini(text).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "XTLDR");
        assert_eq!(sections[0].get("DEFAULT"), Some("exectos"));
        assert_eq!(sections[1].get("KERNEL"), Some("\\XTOSKRNL.EXE"));
    }

    #[test]
    fn strips_inline_comments_and_blank_lines() {
        let text = "[a]\n; a comment\nKEY=VAL ; trailing comment\n";
        let sections = parse_ini(text).unwrap();
        assert_eq!(sections[0].get("KEY"), Some("VAL"));
    }

    #[test]
    fn extracts_loader_section_leaving_boot_entries() {
        let text = "[XTLDR]\nTIMEOUT=7\n[entry-one]\nKERNEL=a\n[entry-two]\nKERNEL=b\n";
        let sections = parse_ini(text).unwrap();
        let (config, entries) = extract_loader_section(sections);
        assert_eq!(config.timeout_seconds, 7);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "entry-one");
    }

    #[test]
    fn rejects_key_value_line_before_any_section() {
        let text = "KEY=VAL\n[a]\n";
        assert!(parse_ini(text).is_err());
    }

    #[test]
    fn parses_cli_tokens_with_quoted_values() {
        let pairs = parse_cli_options(r#"DEBUG=COM1 DEFAULT="my entry" TIMEOUT=9"#);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("DEBUG".to_string(), "COM1".to_string()));
        assert_eq!(pairs[1], ("DEFAULT".to_string(), "my entry".to_string()));
        assert_eq!(pairs[2], ("TIMEOUT".to_string(), "9".to_string()));
    }

    #[test]
    fn cli_overrides_take_precedence_over_ini() {
        let mut config = LoaderConfig {
            default_entry: Some("ini-entry".to_string()),
            timeout_seconds: 5,
            debug: Some("COM1".to_string()),
        };
        apply_cli_overrides(&mut config, &[("DEBUG".to_string(), "SCREEN".to_string())]);
        assert_eq!(config.debug, Some("SCREEN".to_string()));
        assert_eq!(config.default_entry, Some("ini-entry".to_string()));
    }
}
