//! Database name resolution.
//!
//! A configured name is either a literal, optionally containing the time
//! placeholders `{YYYY}` `{MM}` `{DD}` `{HH}` `{mm}` `{ss}`, or a latest-match
//! pattern written as `latest:<glob>` with exactly one `*`.
//!
//! Latest-match picks the lexicographically greatest database name matching
//! the glob. That equals the most recent one only when the varying part of
//! the name sorts chronologically, i.e. fixed-width date fields such as
//! `backup_2025_11_08`. Names like `backup_2025_1_8` sort wrongly and will
//! select the wrong database without any error.

use crate::error::{EtlError, EtlResult};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::future::Future;
use tracing::{debug, info};

/// Prefix that turns a name into a latest-match pattern.
pub const LATEST_MATCH_PREFIX: &str = "latest:";

/// Parsed form of a configured database name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    /// Used as-is after placeholder expansion.
    Literal(String),
    /// Resolved against the databases present on the server.
    LatestMatch { glob: String },
}

impl NamePattern {
    /// Parse and validate a configured name.
    pub fn parse(raw: &str) -> EtlResult<Self> {
        let raw = raw.trim();
        if let Some(glob) = raw.strip_prefix(LATEST_MATCH_PREFIX) {
            let glob = glob.trim();
            let wildcards = glob.matches('*').count();
            if wildcards != 1 {
                return Err(EtlError::config(format!(
                    "Latest-match pattern '{}' must contain exactly one '*' (found {})",
                    raw, wildcards
                )));
            }
            return Ok(Self::LatestMatch {
                glob: glob.to_string(),
            });
        }

        if raw.is_empty() {
            return Err(EtlError::config("Database name cannot be empty"));
        }
        if raw.contains('*') {
            return Err(EtlError::config(format!(
                "Database name '{}' contains '*'; prefix it with '{}' to select the latest match",
                raw, LATEST_MATCH_PREFIX
            )));
        }
        Ok(Self::Literal(raw.to_string()))
    }
}

/// Replace the time placeholders with the given UTC time, zero padded.
pub fn expand_placeholders(template: &str, now: DateTime<Utc>) -> String {
    template
        .replace("{YYYY}", &format!("{:04}", now.year()))
        .replace("{MM}", &format!("{:02}", now.month()))
        .replace("{DD}", &format!("{:02}", now.day()))
        .replace("{HH}", &format!("{:02}", now.hour()))
        .replace("{mm}", &format!("{:02}", now.minute()))
        .replace("{ss}", &format!("{:02}", now.second()))
}

/// Anchored glob match where `*` matches any run of characters.
pub fn glob_matches(glob: &str, name: &str) -> bool {
    let mut parts = glob.split('*');
    let Some(first) = parts.next() else {
        return name.is_empty();
    };
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Pick the lexicographically greatest name matching `glob`.
pub fn select_latest<'a, I>(glob: &str, names: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut matches: Vec<&str> = names
        .into_iter()
        .filter(|name| glob_matches(glob, name))
        .collect();
    matches.sort_unstable();
    matches.last().map(|s| s.to_string())
}

/// Source of the database names visible on a server.
pub trait DatabaseLister: Send + Sync {
    fn list_databases(&self) -> impl Future<Output = EtlResult<Vec<String>>> + Send;
}

/// Database names resolved for one run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResolvedNames {
    pub source: String,
    pub destination: String,
}

/// Resolve a configured name at time `now`.
///
/// Literal names never touch the server. Latest-match patterns list the
/// server's databases and fail with [`EtlError::NoMatch`] when nothing matches.
pub async fn resolve_name<L: DatabaseLister>(
    raw: &str,
    now: DateTime<Utc>,
    lister: &L,
) -> EtlResult<String> {
    match NamePattern::parse(raw)? {
        NamePattern::Literal(template) => {
            let name = expand_placeholders(&template, now);
            debug!(pattern = %template, name = %name, "Resolved literal database name");
            Ok(name)
        }
        NamePattern::LatestMatch { glob } => {
            let glob = expand_placeholders(&glob, now);
            let databases = lister.list_databases().await?;
            let name = select_latest(&glob, databases.iter().map(String::as_str))
                .ok_or_else(|| EtlError::no_match(glob.clone()))?;
            info!(
                pattern = %glob,
                candidates = databases.len(),
                name = %name,
                "Resolved latest matching database"
            );
            Ok(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedLister(Vec<&'static str>);

    impl DatabaseLister for FixedLister {
        async fn list_databases(&self) -> EtlResult<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 8, 14, 30, 45).unwrap()
    }

    #[test]
    fn test_expand_date_placeholders() {
        assert_eq!(
            expand_placeholders("medkku_{YYYY}_{MM}_{DD}", clock()),
            "medkku_2025_11_08"
        );
        assert_eq!(
            expand_placeholders("snap_{HH}{mm}{ss}", clock()),
            "snap_143045"
        );
    }

    #[test]
    fn test_expand_pads_small_values() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            expand_placeholders("{YYYY}-{MM}-{DD}T{HH}:{mm}:{ss}", early),
            "2026-01-02T03:04:05"
        );
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!(
            NamePattern::parse("latest:backup_*").unwrap(),
            NamePattern::LatestMatch {
                glob: "backup_*".to_string()
            }
        );
        assert_eq!(
            NamePattern::parse("sales").unwrap(),
            NamePattern::Literal("sales".to_string())
        );
        assert!(NamePattern::parse("latest:backup").is_err());
        assert!(NamePattern::parse("latest:*_*").is_err());
        assert!(NamePattern::parse("backup_*").is_err());
        assert!(NamePattern::parse("  ").is_err());
    }

    #[test]
    fn test_glob_is_anchored() {
        assert!(glob_matches("backup_*", "backup_2025_11_08"));
        assert!(glob_matches("backup_*", "backup_"));
        assert!(!glob_matches("backup_*", "old_backup_2025"));
        assert!(glob_matches("*_archive", "2025_archive"));
        assert!(!glob_matches("*_archive", "2025_archive_x"));
        assert!(glob_matches("db_*_v2", "db_2025_v2"));
        assert!(!glob_matches("db_*_v2", "db_v2"));
        assert!(glob_matches("tmp_*_*", "tmp_a_b"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exact1"));
    }

    #[test]
    fn test_select_latest_is_lexicographic_max() {
        let names = [
            "backup_2025_11_07",
            "backup_2025_11_08",
            "backup_2025_10_31",
            "other",
        ];
        assert_eq!(
            select_latest("backup_*", names),
            Some("backup_2025_11_08".to_string())
        );
        assert_eq!(select_latest("missing_*", names), None);
    }

    #[tokio::test]
    async fn test_resolve_latest_match() {
        let lister = FixedLister(vec![
            "backup_2025_11_07",
            "backup_2025_11_08",
            "backup_2025_10_31",
            "mysql",
        ]);
        let name = resolve_name("latest:backup_*", clock(), &lister).await.unwrap();
        assert_eq!(name, "backup_2025_11_08");
    }

    #[tokio::test]
    async fn test_resolve_no_match_fails() {
        let lister = FixedLister(vec!["mysql", "information_schema"]);
        let err = resolve_name("latest:backup_*", clock(), &lister)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_resolve_latest_with_placeholders() {
        let lister = FixedLister(vec![
            "backup_2025_11_08_a",
            "backup_2025_11_08_b",
            "backup_2025_11_09_z",
        ]);
        let name = resolve_name("latest:backup_{YYYY}_{MM}_{DD}_*", clock(), &lister)
            .await
            .unwrap();
        assert_eq!(name, "backup_2025_11_08_b");
    }

    #[tokio::test]
    async fn test_resolve_literal_does_not_list() {
        struct PanicLister;
        impl DatabaseLister for PanicLister {
            async fn list_databases(&self) -> EtlResult<Vec<String>> {
                Err(EtlError::internal("literal names must not list databases"))
            }
        }
        let name = resolve_name("medkku_{YYYY}_{MM}_{DD}", clock(), &PanicLister)
            .await
            .unwrap();
        assert_eq!(name, "medkku_2025_11_08");
    }
}
