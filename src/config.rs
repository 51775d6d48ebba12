use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use audit_channel::ChannelOptions;
use audit_rule::{Abi, Action, FilterList, RuleBuilder, RuleError, perm};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/kaudit/kaudit.ini";

/// Configuration backed by an `INI` file, one [`SectionConfig`] per section.
#[derive(Debug, Clone, Default)]
pub struct KauditConfig {
    sections: HashMap<String, SectionConfig>,
}

impl KauditConfig {
    /// Load the default file, or an empty configuration if it doesn't exist.
    pub fn new() -> Result<Self> {
        let config_file = Path::new(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(&config_file)
    }

    fn from_config_file(config_file: &Path) -> Result<Self> {
        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    pub fn from_ini_str(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str(content).context("Error parsing configuration")?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let config = sections.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    config.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self { sections }
    }

    /// Section configuration, empty if the section is missing.
    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    pub fn channel(&self) -> Result<ChannelConfig, ConfigError> {
        ChannelConfig::try_from(&self.section("channel"))
    }

    pub fn rule(&self) -> Result<RuleConfig, ConfigError> {
        RuleConfig::try_from(&self.section("rule"))
    }
}

/// Key-value pairs of one section.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl SectionConfig {
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return a comma separed list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(item, config_name))
            .collect()
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// `[channel]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub poll_interval: Duration,
    pub raw_delivery: bool,
    pub enable_auditing: bool,
    pub register_listener: bool,
}

impl TryFrom<&SectionConfig> for ChannelConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            poll_interval: Duration::from_millis(config.with_default("poll_interval_ms", 250)?),
            raw_delivery: config.with_default("raw_delivery", false)?,
            enable_auditing: config.with_default("enable_auditing", true)?,
            register_listener: config.with_default("register_listener", true)?,
        })
    }
}

impl ChannelConfig {
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions {
            poll_interval: self.poll_interval,
            raw_delivery: self.raw_delivery,
            ..Default::default()
        }
    }
}

/// `[rule]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    pub filter_list: FilterList,
    pub action: Action,
    pub syscalls: Vec<String>,
    pub watch: Vec<PathBuf>,
    pub watch_files: Vec<PathBuf>,
    pub fields: Vec<String>,
    pub perm: Option<u32>,
    pub key: Option<String>,
}

impl TryFrom<&SectionConfig> for RuleConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let perm = config
            .get_raw("perm")
            .map(|value| {
                perm::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                    field: "perm".to_string(),
                    value: value.to_string(),
                    err: "expected a combination of r, w, x, a".to_string(),
                })
            })
            .transpose()?;
        Ok(Self {
            filter_list: config.with_default("filter_list", FilterList::Exit)?,
            action: config.with_default("action", Action::Always)?,
            syscalls: config.get_list("syscalls")?,
            watch: config.get_list("watch")?,
            watch_files: config.get_list("watch_files")?,
            fields: config.get_list("fields")?,
            perm,
            key: config.optional("key")?,
        })
    }
}

impl RuleConfig {
    pub fn is_empty(&self) -> bool {
        self.syscalls.is_empty()
            && self.watch.is_empty()
            && self.watch_files.is_empty()
            && self.fields.is_empty()
    }

    /// Apply to `builder`, stopping at the first rejected entry.
    pub fn apply<A: Abi>(&self, builder: &mut RuleBuilder<A>) -> Result<(), RuleError> {
        builder.filter_list(self.filter_list).action(self.action);
        for syscall in &self.syscalls {
            builder.add_syscall_by_name(syscall)?;
        }
        for dir in &self.watch {
            builder.add_watch_path(dir)?;
        }
        for file in &self.watch_files {
            builder.add_file_watch(file)?;
        }
        if let Some(perm) = self.perm {
            builder.add_watch_perms(perm)?;
        }
        for expr in &self.fields {
            builder.add_field_expr(expr)?;
        }
        if let Some(key) = &self.key {
            builder.add_key(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use audit_rule::{Field, Machine};

    use super::*;

    const SAMPLE: &str = "
[channel]
poll_interval_ms = 100
raw_delivery = true

[rule]
filter_list = exit
action = always
syscalls = mkdir, rmdir
watch = /home/user/watched
perm = wa
fields = uid>=1000
key = watched
";

    #[test]
    fn channel_defaults() {
        let config = KauditConfig::default().channel().unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(!config.raw_delivery);
        assert!(config.enable_auditing);
        assert!(config.register_listener);
    }

    #[test]
    fn parse_sections() {
        let config = KauditConfig::from_ini_str(SAMPLE).unwrap();
        let channel = config.channel().unwrap();
        assert_eq!(channel.poll_interval, Duration::from_millis(100));
        assert!(channel.raw_delivery);
        assert!(channel.options().raw_delivery);

        let rule = config.rule().unwrap();
        assert_eq!(rule.filter_list, FilterList::Exit);
        assert_eq!(rule.syscalls, vec!["mkdir", "rmdir"]);
        assert_eq!(rule.watch, vec![PathBuf::from("/home/user/watched")]);
        assert_eq!(rule.perm, Some(perm::WRITE | perm::ATTR));
        assert_eq!(rule.key.as_deref(), Some("watched"));
        assert!(!rule.is_empty());
    }

    #[test]
    fn invalid_values() {
        let config = KauditConfig::from_ini_str("[channel]\nraw_delivery = maybe\n").unwrap();
        assert!(matches!(
            config.channel(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "raw_delivery"
        ));
        let config = KauditConfig::from_ini_str("[rule]\naction = sometimes\n").unwrap();
        assert!(matches!(config.rule(), Err(ConfigError::InvalidValue { .. })));
        let config = KauditConfig::from_ini_str("[rule]\nperm = q\n").unwrap();
        assert!(matches!(config.rule(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn required_value() {
        let section = SectionConfig::default();
        assert!(matches!(
            section.required::<u32>("missing"),
            Err(ConfigError::RequiredValue { .. })
        ));
    }

    #[test]
    fn apply_to_builder() {
        let rule = KauditConfig::from_ini_str(SAMPLE).unwrap().rule().unwrap();
        let mut builder = RuleBuilder::new(Machine::X86_64);
        rule.apply(&mut builder).unwrap();
        let built = builder.rule();
        assert_eq!(built.flags(), FilterList::Exit);
        assert_eq!(built.action(), Action::Always);
        assert!(built.has_syscall(83));
        assert!(built.has_syscall(84));
        let fields: Vec<_> = built.predicates().iter().map(|p| p.field()).collect();
        assert_eq!(
            fields,
            vec![Field::Arch, Field::Dir, Field::Perm, Field::Uid, Field::FilterKey]
        );
    }
}
