//! Version parsing helpers.
//!
//! Package ecosystems are loose about version syntax (`3.11`, `v1.2`,
//! `1.0.0rc1`, `==8.1.7`), so parsing here is lenient and normalizes into
//! `semver` types.

use anyhow::{Context, Result, bail};
use semver::{Version, VersionReq};

/// Parse a version string, padding missing minor/patch components and
/// dropping trailing non-numeric suffixes that are not valid semver.
pub fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }

    let numeric: String = s
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u64>());

    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Parse a version constraint such as `>=2.0, <3` or `==8.1.7`.
pub fn parse_requirement(s: &str) -> Result<VersionReq> {
    let s = s.trim();
    if s.is_empty() || s == "*" {
        return Ok(VersionReq::STAR);
    }

    let mut comparators = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        let translated = if let Some(rest) = part.strip_prefix("==") {
            format!("={}", rest.trim())
        } else if let Some(rest) = part.strip_prefix("~=") {
            format!("~{}", rest.trim())
        } else if part.starts_with("!=") {
            bail!("exclusion constraints are not supported: '{}'", part);
        } else {
            part.to_string()
        };
        comparators.push(translated);
    }

    let joined = comparators.join(", ");
    VersionReq::parse(&joined).with_context(|| format!("invalid version constraint '{}'", s))
}

/// Find the first version-like token in free text, e.g. `Python 3.12.1`.
pub fn find_version_in_text(text: &str) -> Option<Version> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter(|token| {
            let token = token.strip_prefix('v').unwrap_or(token);
            token.starts_with(|c: char| c.is_ascii_digit()) && token.contains('.')
        })
        .find_map(parse_version)
}

/// Infer a version from an archive file name like `click-8.1.7.tar.gz` or
/// `respec_ai-0.6.3-py3-none-any.whl`.
pub fn version_from_file_name(package: &str, file_name: &str) -> Option<String> {
    let stem = strip_archive_extension(file_name);
    let wanted = normalize_name(package);

    stem.match_indices('-').find_map(|(i, _)| {
        if normalize_name(&stem[..i]) != wanted {
            return None;
        }
        let version = stem[i + 1..].split('-').next()?;
        parse_version(version).map(|_| version.to_string())
    })
}

fn strip_archive_extension(file_name: &str) -> &str {
    for ext in [".tar.gz", ".tgz", ".zip", ".whl"] {
        if file_name.len() > ext.len() && file_name.to_ascii_lowercase().ends_with(ext) {
            return &file_name[..file_name.len() - ext.len()];
        }
    }
    file_name
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_lenient() {
        assert_eq!(parse_version("0.6.3"), Some(Version::new(0, 6, 3)));
        assert_eq!(parse_version("v1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_version("1.0.0rc1"), Some(Version::new(1, 0, 0)));
        assert_eq!(
            parse_version("2.0.0-beta.1"),
            Some(Version::parse("2.0.0-beta.1").unwrap())
        );
        assert_eq!(parse_version("latest"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_parse_requirement() {
        let req = parse_requirement(">=2.0, <3").unwrap();
        assert!(req.matches(&Version::new(2, 5, 0)));
        assert!(!req.matches(&Version::new(3, 0, 0)));

        let req = parse_requirement("==8.1.7").unwrap();
        assert!(req.matches(&Version::new(8, 1, 7)));
        assert!(!req.matches(&Version::new(8, 1, 8)));

        let req = parse_requirement("~=1.4").unwrap();
        assert!(req.matches(&Version::new(1, 4, 9)));

        assert!(parse_requirement("*").unwrap().matches(&Version::new(9, 9, 9)));
        assert!(parse_requirement("").unwrap().matches(&Version::new(0, 0, 1)));
        assert!(parse_requirement("!=1.0").is_err());
        assert!(parse_requirement(">>1").is_err());
    }

    #[test]
    fn test_find_version_in_text() {
        assert_eq!(
            find_version_in_text("Python 3.12.1"),
            Some(Version::new(3, 12, 1))
        );
        assert_eq!(
            find_version_in_text("Docker version 27.3.1, build ce12230"),
            Some(Version::new(27, 3, 1))
        );
        assert_eq!(find_version_in_text("no version here"), None);
    }

    #[test]
    fn test_version_from_file_name() {
        assert_eq!(
            version_from_file_name("respec-ai", "respec_ai-0.6.3.tar.gz"),
            Some("0.6.3".to_string())
        );
        assert_eq!(
            version_from_file_name("click", "click-8.1.7-py3-none-any.whl"),
            Some("8.1.7".to_string())
        );
        assert_eq!(
            version_from_file_name("typing-extensions", "typing_extensions-4.12.2.zip"),
            Some("4.12.2".to_string())
        );
        assert_eq!(version_from_file_name("click", "other-1.0.tar.gz"), None);
        assert_eq!(version_from_file_name("click", "click.tar.gz"), None);
    }
}
