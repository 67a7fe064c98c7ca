use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use voice_integration::live_socket::DEFAULT_LIVE_ENDPOINT;

pub const SETTINGS_FILE: &str = "hemoflow.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub database_url: String,
    pub api_key: Option<String>,
    pub live_endpoint: String,
    pub live_model: String,
    pub voice_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            database_url: "sqlite://./data/hemoflow.db".into(),
            api_key: None,
            live_endpoint: DEFAULT_LIVE_ENDPOINT.into(),
            live_model: "gemini-2.5-flash-native-audio-preview-12-2025".into(),
            voice_name: "Kore".into(),
        }
    }
}

impl Settings {
    /// The hosted store is only used with an https URL and a key.
    pub fn store_configured(&self) -> bool {
        let url_ok = self
            .supabase_url
            .as_deref()
            .is_some_and(|url| url.starts_with("https://"));
        let key_ok = self
            .supabase_anon_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        url_ok && key_ok
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |name| std::env::var(name).ok())
}

/// Defaults, then the settings file, then environment variables. `APP__*`
/// variables win over the plain ones.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("supabase_url") {
                settings.supabase_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("supabase_anon_key") {
                settings.supabase_anon_key = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("live_endpoint") {
                settings.live_endpoint = v.clone();
            }
            if let Some(v) = file_cfg.get("live_model") {
                settings.live_model = v.clone();
            }
            if let Some(v) = file_cfg.get("voice_name") {
                settings.voice_name = v.clone();
            }
        }
    }

    if let Some(v) = env("SUPABASE_URL") {
        settings.supabase_url = Some(v);
    }
    if let Some(v) = env("APP__SUPABASE_URL") {
        settings.supabase_url = Some(v);
    }

    if let Some(v) = env("SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = Some(v);
    }
    if let Some(v) = env("APP__SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = Some(v);
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("API_KEY") {
        settings.api_key = Some(v);
    }
    if let Some(v) = env("APP__API_KEY") {
        settings.api_key = Some(v);
    }

    if let Some(v) = env("APP__LIVE_ENDPOINT") {
        settings.live_endpoint = v;
    }
    if let Some(v) = env("APP__LIVE_MODEL") {
        settings.live_model = v;
    }
    if let Some(v) = env("APP__VOICE_NAME") {
        settings.voice_name = v;
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn defaults_without_file_or_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings_from(&dir.path().join("missing.toml"), env_of(&[]));
        assert_eq!(settings, Settings::default());
        assert!(!settings.store_configured());
    }

    #[test]
    fn env_overrides_file_and_app_prefix_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(
            &path,
            "supabase_url = \"https://file.example.co\"\ndatabase_url = \"sqlite://file.db\"\nvoice_name = \"Puck\"\n",
        )
        .expect("write settings");

        let settings = load_settings_from(
            &path,
            env_of(&[
                ("DATABASE_URL", "sqlite://env.db"),
                ("APP__DATABASE_URL", "sqlite://app.db"),
                ("SUPABASE_ANON_KEY", "anon"),
            ]),
        );
        assert_eq!(settings.database_url, "sqlite://app.db");
        assert_eq!(settings.voice_name, "Puck");
        assert_eq!(
            settings.supabase_url.as_deref(),
            Some("https://file.example.co")
        );
        assert!(settings.store_configured());
    }

    #[test]
    fn store_requires_https_and_key() {
        let plain_http = Settings {
            supabase_url: Some("http://localhost:54321".into()),
            supabase_anon_key: Some("anon".into()),
            ..Settings::default()
        };
        assert!(!plain_http.store_configured());

        let no_key = Settings {
            supabase_url: Some("https://project.supabase.co".into()),
            supabase_anon_key: Some("  ".into()),
            ..Settings::default()
        };
        assert!(!no_key.store_configured());
    }
}
