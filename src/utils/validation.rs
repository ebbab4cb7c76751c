// Input validation utilities

use anyhow::Result;
use regex::Regex;

/// Validate a site name.
///
/// The site name is the instance's unique key: it becomes a store entry name,
/// part of the service unit names, and part of filesystem paths, so only a
/// conservative character set is allowed.
pub fn validate_site_name(name: &str) -> Result<()> {
    let s = name.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Site name is required"));
    }
    if s.len() > 64 {
        return Err(anyhow::anyhow!("Site name cannot exceed 64 characters"));
    }

    let re = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$")
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile site name regex: {}", e))?;
    if !re.is_match(s) {
        return Err(anyhow::anyhow!(
            "Site name must start with a letter and contain only letters, numbers, '-' and '_'"
        ));
    }

    Ok(())
}

/// Derive the unit/file-safe slug for a site name (lowercased).
pub fn site_slug(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Validate a database name (PostgreSQL).
///
/// Security: database names get interpolated into SQL as identifiers (not
/// values), so only simple identifiers are accepted.
pub fn validate_database_name(name: &str) -> Result<()> {
    let s = name.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Database name is required"));
    }
    if s.len() > 63 {
        return Err(anyhow::anyhow!("Database name cannot exceed 63 characters"));
    }

    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| {
        anyhow::anyhow!("Internal error: failed to compile identifier regex: {}", e)
    })?;
    if !re.is_match(s) {
        return Err(anyhow::anyhow!(
            "Database name must start with a letter or underscore and contain only letters, numbers, and underscores"
        ));
    }

    let reserved = ["postgres", "template0", "template1"];
    if reserved.iter().any(|r| r.eq_ignore_ascii_case(s)) {
        return Err(anyhow::anyhow!("'{}' is a reserved database name", s));
    }

    Ok(())
}

/// Validate a role/user identifier for SQL interpolation.
pub fn validate_role_name(name: &str) -> Result<()> {
    let s = name.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Role name is required"));
    }
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| {
        anyhow::anyhow!("Internal error: failed to compile identifier regex: {}", e)
    })?;
    if !re.is_match(s) {
        return Err(anyhow::anyhow!("Role name contains invalid characters"));
    }
    Ok(())
}

/// Quote a string as a SQL literal (single quotes doubled).
///
/// Used for the few places a value must be inlined into a script handed to the
/// database client tool; identifiers go through the validators above instead.
pub fn quote_sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Normalize a display version to exactly three numeric components.
///
/// "2.1" -> "2.1.0", "2.1.4.77" -> "2.1.4", "garbage" -> "0.0.0".
pub fn normalize_display_version(version: &str) -> String {
    let mut parts: Vec<u64> = version
        .trim()
        .split('.')
        .map(|p| p.trim().parse::<u64>().unwrap_or(0))
        .collect();
    parts.truncate(3);
    while parts.len() < 3 {
        parts.push(0);
    }
    format!("{}.{}.{}", parts[0], parts[1], parts[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_name_accepts_typical_names() {
        assert!(validate_site_name("DemoShop").is_ok());
        assert!(validate_site_name("shop-eu_2").is_ok());
    }

    #[test]
    fn site_name_rejects_path_and_sql_metacharacters() {
        assert!(validate_site_name("").is_err());
        assert!(validate_site_name("../etc").is_err());
        assert!(validate_site_name("shop;drop").is_err());
        assert!(validate_site_name("1shop").is_err());
    }

    #[test]
    fn database_name_rules() {
        assert!(validate_database_name("DemoShopDb").is_ok());
        assert!(validate_database_name("demo-shop").is_err());
        assert!(validate_database_name("postgres").is_err());
        assert!(validate_database_name("").is_err());
    }

    #[test]
    fn sql_literal_doubles_quotes() {
        assert_eq!(quote_sql_literal("o'neil"), "'o''neil'");
    }

    #[test]
    fn display_version_normalizes_to_three_components() {
        assert_eq!(normalize_display_version("2.1"), "2.1.0");
        assert_eq!(normalize_display_version("2.1.4.77"), "2.1.4");
        assert_eq!(normalize_display_version("4.2.0"), "4.2.0");
        assert_eq!(normalize_display_version("weird"), "0.0.0");
    }
}
