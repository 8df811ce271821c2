use std::{collections::BTreeMap, fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use droidpanel_util::write_json_atomic;

pub const DEFAULT_PROVIDER: &str = "bigmodel";
/// Self-hosted deployments may run without a key.
pub const KEYLESS_PROVIDER: &str = "custom";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub current_provider: String,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "bigmodel".to_string(),
            ProviderConfig {
                base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
                model: "autoglm-phone".to_string(),
                api_key: String::new(),
            },
        );
        providers.insert(
            "modelscope".to_string(),
            ProviderConfig {
                base_url: "https://api-inference.modelscope.cn/v1".to_string(),
                model: "ZhipuAI/AutoGLM-Phone-9B".to_string(),
                api_key: String::new(),
            },
        );
        providers.insert(
            "custom".to_string(),
            ProviderConfig {
                base_url: "http://localhost:8000/v1".to_string(),
                model: "autoglm-phone-9b".to_string(),
                api_key: String::new(),
            },
        );
        Self {
            current_provider: DEFAULT_PROVIDER.to_string(),
            providers,
        }
    }
}

impl PanelConfig {
    /// Every known provider always has an entry; files written by older
    /// builds get the missing ones backfilled.
    fn backfill_defaults(&mut self) {
        let defaults = PanelConfig::default();
        for (name, provider) in defaults.providers {
            self.providers.entry(name).or_insert(provider);
        }
        if self.current_provider.trim().is_empty() {
            self.current_provider = DEFAULT_PROVIDER.to_string();
        }
    }

    pub fn current(&self) -> ProviderConfig {
        self.providers
            .get(&self.current_provider)
            .or_else(|| self.providers.get(DEFAULT_PROVIDER))
            .cloned()
            .unwrap_or_default()
    }
}

/// Single-writer JSON config document under the data dir.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn open_default() -> Self {
        Self::new(droidpanel_util::config_file_path())
    }

    pub fn load(&self) -> PanelConfig {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("failed to read {}: {err}", self.path.display());
                }
                return PanelConfig::default();
            }
        };
        let value: Value = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse {}: {err}", self.path.display());
                return PanelConfig::default();
            }
        };

        if value.get("providers").is_none() {
            return migrate_legacy(&value);
        }

        match serde_json::from_value::<PanelConfig>(value) {
            Ok(mut config) => {
                config.backfill_defaults();
                config
            }
            Err(err) => {
                warn!("failed to parse {}: {err}", self.path.display());
                PanelConfig::default()
            }
        }
    }

    pub fn save(&self, config: &PanelConfig) -> io::Result<()> {
        write_json_atomic(&self.path, config)
    }
}

/// Pre-multi-provider files carried the credential fields at the top
/// level; they belong to the first provider's slot under the new shape.
fn migrate_legacy(value: &Value) -> PanelConfig {
    let mut config = PanelConfig::default();
    let field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    if let Some(slot) = config.providers.get_mut(DEFAULT_PROVIDER) {
        let api_key = field("api_key");
        let base_url = field("base_url");
        let model = field("model");
        if !api_key.is_empty() {
            slot.api_key = api_key;
        }
        if !base_url.is_empty() {
            slot.base_url = base_url;
        }
        if !model.is_empty() {
            slot.model = model;
        }
    }
    config
}

/// Masked credential for the UI: long keys keep their first and last four
/// characters, anything shorter collapses to a fixed placeholder. Counted
/// in characters, not bytes, so multi-byte keys never split mid-char.
pub fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
    } else {
        "****".to_string()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SafeProvider {
    pub base_url: String,
    pub model: String,
    pub has_api_key: bool,
    pub api_key_display: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SafeConfig {
    pub current_provider: String,
    pub providers: BTreeMap<String, SafeProvider>,
}

/// View of the config with no full secret material.
pub fn display_safe(config: &PanelConfig) -> SafeConfig {
    let providers = config
        .providers
        .iter()
        .map(|(name, provider)| {
            (
                name.clone(),
                SafeProvider {
                    base_url: provider.base_url.clone(),
                    model: provider.model.clone(),
                    has_api_key: !provider.api_key.is_empty(),
                    api_key_display: mask_key(&provider.api_key),
                },
            )
        })
        .collect();
    SafeConfig {
        current_provider: config.current_provider.clone(),
        providers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("config.json"))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = store_in(&dir).load();
        assert_eq!(config.current_provider, "bigmodel");
        assert_eq!(config.providers.len(), 3);
        assert!(config.providers.contains_key("custom"));
    }

    #[test]
    fn legacy_single_provider_shape_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            dir.path().join("config.json"),
            r#"{"api_key": "legacy-key-12345", "base_url": "https://legacy.example/v1", "model": "legacy-model"}"#,
        )
        .unwrap();

        let config = store.load();
        let bigmodel = &config.providers["bigmodel"];
        assert_eq!(bigmodel.api_key, "legacy-key-12345");
        assert_eq!(bigmodel.base_url, "https://legacy.example/v1");
        assert_eq!(bigmodel.model, "legacy-model");
        assert_eq!(config.providers.len(), 3);
    }

    #[test]
    fn migration_is_idempotent_after_one_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            dir.path().join("config.json"),
            r#"{"api_key": "legacy-key-12345"}"#,
        )
        .unwrap();

        let migrated = store.load();
        store.save(&migrated).unwrap();
        let reloaded = store.load();
        assert_eq!(
            serde_json::to_value(&migrated).unwrap(),
            serde_json::to_value(&reloaded).unwrap()
        );
    }

    #[test]
    fn missing_known_provider_is_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            dir.path().join("config.json"),
            r#"{"current_provider": "modelscope", "providers": {"modelscope": {"base_url": "https://x/v1", "model": "m", "api_key": "k"}}}"#,
        )
        .unwrap();

        let config = store.load();
        assert_eq!(config.current_provider, "modelscope");
        assert!(config.providers.contains_key("bigmodel"));
        assert!(config.providers.contains_key("custom"));
        assert_eq!(config.providers["modelscope"].api_key, "k");
    }

    #[test]
    fn masks_keys_by_length() {
        assert_eq!(mask_key("abcd1234efgh"), "abcd****efgh");
        assert_eq!(mask_key("abcd1234efgh").len(), 12);
        assert_eq!(mask_key("abc"), "****");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn masks_multibyte_keys_by_characters() {
        // 4 chars but 12 bytes; must take the short-key branch.
        assert_eq!(mask_key("€€€€"), "****");
        // 10 chars; head and tail must land on char boundaries.
        assert_eq!(mask_key("€€€€567890"), "€€€€**7890");
        assert_eq!(mask_key("ключ-секрет"), "ключ***крет");
    }

    #[test]
    fn safe_view_never_contains_raw_key() {
        let mut config = PanelConfig::default();
        config
            .providers
            .get_mut("bigmodel")
            .unwrap()
            .api_key = "super-secret-key-000".to_string();
        let safe = display_safe(&config);
        let json = serde_json::to_string(&safe).unwrap();
        assert!(!json.contains("super-secret-key-000"));
        assert!(safe.providers["bigmodel"].has_api_key);
    }
}
