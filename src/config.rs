use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::BotError;
use crate::registry::{VmEntry, VmRegistry};

/// Default config location, matching the container image layout.
pub const DEFAULT_CONFIG_PATH: &str = "/workspace/azure-bot-config.yml";

/// Environment variable that overrides `--config`.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

#[derive(Debug, Clone, Facet)]
pub struct Config {
    #[facet(default)]
    pub vms: Vec<VmConfig>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VmConfig {
    pub logical_name: String,
    pub azurevm_name: String,
    pub resource_group: String,
    pub subscription_id: String,
}

impl From<VmConfig> for VmEntry {
    fn from(vm: VmConfig) -> Self {
        VmEntry {
            logical_name: vm.logical_name,
            resource_group: vm.resource_group,
            vm_name: vm.azurevm_name,
            subscription_id: vm.subscription_id,
        }
    }
}

/// Pick the config path: the environment override wins over the flag.
pub fn resolve_path(flag: &Path, env_override: Option<&str>) -> PathBuf {
    match env_override {
        Some(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => flag.to_path_buf(),
    }
}

/// The path must exist and be a regular file.
pub fn validate_path(path: &Path) -> Result<(), BotError> {
    let meta = std::fs::metadata(path).map_err(|source| BotError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    if meta.is_dir() {
        return Err(BotError::Validation {
            message: format!("'{}' is a directory, not a normal file", path.display()),
        });
    }
    Ok(())
}

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, BotError> {
    facet_yaml::from_str(contents).map_err(|e| BotError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load, parse and validate the config file into a ready registry.
///
/// Any failure is fatal to startup; a partially loaded registry is never
/// returned.
pub fn load_registry(path: &Path) -> Result<VmRegistry, BotError> {
    validate_path(path)?;

    let contents = std::fs::read_to_string(path).map_err(|source| BotError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents, path)?;
    if config.vms.is_empty() {
        return Err(BotError::Validation {
            message: format!("no VMs configured in {}", path.display()),
        });
    }

    let registry = VmRegistry::new(config.vms.into_iter().map(VmEntry::from).collect())?;
    tracing::debug!(path = %path.display(), vms = registry.len(), "config loaded");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
vms:
  - logical_name: web1
    azurevm_name: vm-web1
    resource_group: rg1
    subscription_id: sub1
  - logical_name: db1
    azurevm_name: vm-db1
    resource_group: rg2
    subscription_id: sub2
"#;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("azure-bot-config.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parse_sample_config() {
        let config = parse_config(SAMPLE, Path::new("test.yml")).unwrap();
        assert_eq!(config.vms.len(), 2);
        assert_eq!(config.vms[0].logical_name, "web1");
        assert_eq!(config.vms[0].azurevm_name, "vm-web1");
        assert_eq!(config.vms[1].subscription_id, "sub2");
    }

    #[test]
    fn load_registry_maps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, SAMPLE);
        let registry = load_registry(&path).unwrap();
        let web1 = registry.resolve("web1").unwrap();
        assert_eq!(web1.vm_name, "vm-web1");
        assert_eq!(web1.resource_group, "rg1");
        assert_eq!(web1.subscription_id, "sub1");
    }

    #[test]
    fn directory_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_registry(dir.path()).unwrap_err();
        assert!(err.to_string().contains("is a directory"));
    }

    #[test]
    fn missing_file_rejected() {
        let err = load_registry(Path::new("/nonexistent/azure-bot-config.yml")).unwrap_err();
        assert!(matches!(err, BotError::ConfigLoad { .. }));
    }

    #[test]
    fn malformed_yaml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "vms: [unclosed\n");
        let err = load_registry(&path).unwrap_err();
        assert!(matches!(err, BotError::ConfigParse { .. }));
    }

    #[test]
    fn empty_vm_list_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "vms: []\n");
        assert!(load_registry(&path).is_err());
    }

    #[test]
    fn missing_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "vms:\n  - logical_name: web1\n    resource_group: rg1\n    subscription_id: sub1\n",
        );
        let err = load_registry(&path).unwrap_err();
        assert!(err.to_string().contains("azurevm_name"));
    }

    #[test]
    fn env_override_wins_over_flag() {
        let flag = Path::new("/from/flag.yml");
        assert_eq!(
            resolve_path(flag, Some("/from/env.yml")),
            PathBuf::from("/from/env.yml")
        );
        assert_eq!(resolve_path(flag, None), PathBuf::from("/from/flag.yml"));
        assert_eq!(resolve_path(flag, Some("")), PathBuf::from("/from/flag.yml"));
    }
}
