use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ldap_csv: String,
    pub gad_csv: String,
    pub sync_csv: String,
    pub gad_groups_csv: String,
    pub output_directory: Option<String>,
    /// Header prefix the spreadsheet export uses for columns without a name
    pub anonymous_column_prefix: String,
    pub ldap_columns: DirectoryColumns,
    pub gad_columns: DirectoryColumns,
    pub sync_columns: SyncColumns,
    pub group_columns: GroupColumns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryColumns {
    pub email: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncColumns {
    pub email: String,
    pub username: String,
    /// First column of the group block; holds the primary group and is never written
    pub block_start: String,
    /// First column after the group block; nothing is written at or past it
    pub block_end: String,
    /// Rows with this column filled count as logged-in users
    pub last_auth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupColumns {
    pub email: String,
    pub group: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ldap_csv: "data-source/ldap_users.csv".to_string(),
            gad_csv: "data-source/gad_users.csv".to_string(),
            sync_csv: "data-source/sync_export.csv".to_string(),
            gad_groups_csv: "data-source/gad_groups.csv".to_string(),
            output_directory: Some("output".to_string()),
            anonymous_column_prefix: "Unnamed:".to_string(),
            ldap_columns: DirectoryColumns {
                email: "mail".to_string(),
                username: "uid".to_string(),
            },
            gad_columns: DirectoryColumns {
                email: "email_add".to_string(),
                username: "user_name".to_string(),
            },
            sync_columns: SyncColumns {
                email: "ATTR_EMAIL".to_string(),
                username: "ATTR_USERNAME".to_string(),
                block_start: "ATTR_GROUPS".to_string(),
                block_end: "ATTR_USER_KEY".to_string(),
                last_auth: Some("ATTR_LAST_AUTH_CONSOLIDATED".to_string()),
            },
            group_columns: GroupColumns {
                email: "email_add".to_string(),
                group: "group_name".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> crate::error::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }

    /// Names of the input settings that are still blank
    pub fn missing_inputs(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("ldap_csv", &self.ldap_csv),
            ("gad_csv", &self.gad_csv),
            ("sync_csv", &self.sync_csv),
            ("gad_groups_csv", &self.gad_groups_csv),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        missing
    }
}

/// A user whose username differs between the two directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameMismatch {
    pub email: String,
    pub ldap_username: String,
    pub gad_username: String,
}

/// Normalize an email for identity comparison: trimmed and lowercased
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// A cell counts as filled when it holds something other than whitespace
pub fn is_filled(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  John.Doe@Example.COM \t"), "john.doe@example.com");
    }

    #[test]
    fn whitespace_only_is_not_filled() {
        assert!(!is_filled(None));
        assert!(!is_filled(Some("")));
        assert!(!is_filled(Some("   ")));
        assert!(is_filled(Some(" x ")));
    }

    #[test]
    fn default_config_survives_toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sync_columns.block_start, "ATTR_GROUPS");
        assert_eq!(parsed.sync_columns.block_end, "ATTR_USER_KEY");
        assert_eq!(parsed.group_columns.group, "group_name");
        assert!(parsed.missing_inputs().is_empty());
    }

    #[test]
    fn blank_inputs_are_reported() {
        let config = Config {
            sync_csv: "  ".to_string(),
            gad_groups_csv: String::new(),
            ..Config::default()
        };
        assert_eq!(config.missing_inputs(), vec!["sync_csv", "gad_groups_csv"]);
    }
}
