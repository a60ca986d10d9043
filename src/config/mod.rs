mod settings;

pub use settings::{AuditSettings, Settings, CONFIG_FILE, HOME_ENV};
