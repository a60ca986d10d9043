// ============================================
// OPSGUARD - Configuration Tests
// ============================================

#[cfg(test)]
mod config_tests {
    use opsguard::config::{AuditSettings, Settings, CONFIG_FILE};
    use opsguard::core::rate_limit::{RateLimit, DEFAULT_COMMAND};
    use std::fs;
    use tempfile::tempdir;

    /// Test a full config file round-trips through load
    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[rate_limits.deploy]
max = 4
window_ms = 120000

[rate_limits.default]
max = 50
window_ms = 60000

[audit]
enabled = false
max_file_bytes = 4096
max_rotated_files = 2
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert!(!settings.audit.enabled);
        assert_eq!(settings.audit.max_file_bytes, 4096);
        assert_eq!(settings.audit.max_rotated_files, 2);

        let limits = settings.rate_limit_config();
        assert_eq!(limits.limit_for("deploy"), RateLimit::new(4, 120_000));
        assert_eq!(limits.limit_for("never-configured"), RateLimit::new(50, 60_000));
        assert_eq!(limits.limit_for(DEFAULT_COMMAND).max, 50);
    }

    /// Test partial audit section falls back per field
    #[test]
    fn test_partial_audit_section() {
        let settings = Settings::from_toml("[audit]\nmax_rotated_files = 9\n").unwrap();
        assert_eq!(
            settings.audit,
            AuditSettings {
                max_rotated_files: 9,
                ..AuditSettings::default()
            }
        );
    }

    /// Test builtin limits are present without any config
    #[test]
    fn test_builtin_limits() {
        let limits = Settings::default().rate_limit_config();
        let names: Vec<&str> = limits.commands().map(|(n, _)| n.as_str()).collect();

        for expected in ["default", "deploy", "backup", "restore", "terraform-destroy", "login"] {
            assert!(names.contains(&expected), "missing builtin limit {}", expected);
        }
        assert_eq!(limits.limit_for("terraform-destroy"), RateLimit::new(2, 3_600_000));
        assert_eq!(limits.limit_for("login"), RateLimit::new(5, 900_000));
    }

    /// Test malformed TOML is an error, not silently ignored
    #[test]
    fn test_malformed_config_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[rate_limits.deploy\nmax = ").unwrap();
        assert!(Settings::load_from(&path).is_err());

        fs::write(&path, "[rate_limits.deploy]\nmax = \"ten\"\nwindow_ms = 1\n").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    /// Test save then load gives back the same settings
    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut settings = Settings::default();
        settings
            .rate_limits
            .insert("backup".to_string(), RateLimit::new(2, 30_000));
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }
}
