//! Layered agent settings with reload-on-change
//!
//! Settings come from built-in defaults, the bundled `appsettings.json`, an
//! environment-specific overlay, the platform configuration directory,
//! `LCM_`-prefixed environment variables, and finally the command line.
//! A reload that fails validation logs every failure and keeps the previous
//! valid snapshot; valid snapshots are published atomically with a
//! monotonically increasing generation the worker's delay loop observes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;

use opendsc_core::types::{ConfigurationMode, ConfigurationSource};

use crate::paths;

/// Where the agent loads its client certificate from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    /// Generated and rotated by the agent under the data directory
    Managed,
    /// Loaded from a path configured by the platform
    Platform,
}

/// Validated Pull Server connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct PullServerSettings {
    pub server_url: String,
    pub registration_key: String,
    pub report_compliance: bool,
    pub certificate_source: CertificateSource,
    pub certificate_thumbprint: Option<String>,
    pub certificate_path: Option<PathBuf>,
    pub certificate_password: Option<String>,
}

/// Validated agent settings
#[derive(Debug, Clone, PartialEq)]
pub struct LcmSettings {
    pub configuration_mode: ConfigurationMode,
    pub configuration_source: ConfigurationSource,
    pub configuration_path: PathBuf,
    pub configuration_mode_interval: Duration,
    pub dsc_executable_path: Option<PathBuf>,
    pub log_level: String,
    pub pull_server: Option<PullServerSettings>,
}

impl Default for LcmSettings {
    fn default() -> Self {
        Self {
            configuration_mode: ConfigurationMode::Monitor,
            configuration_source: ConfigurationSource::Local,
            configuration_path: paths::config_dir().join("configuration.dsc.yaml"),
            configuration_mode_interval: Duration::from_secs(15 * 60),
            dsc_executable_path: None,
            log_level: "info".to_string(),
            pull_server: None,
        }
    }
}

/// Parse an `HH:MM:SS` interval
pub fn parse_interval(raw: &str) -> Result<Duration, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return Err(format!("interval {:?} is not HH:MM:SS", raw));
    }
    let numbers: Vec<u64> = parts
        .iter()
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("interval {:?} is not HH:MM:SS", raw))?;
    if numbers[1] >= 60 || numbers[2] >= 60 {
        return Err(format!("interval {:?} has out-of-range minutes or seconds", raw));
    }
    let total = numbers[0] * 3600 + numbers[1] * 60 + numbers[2];
    if total == 0 {
        return Err("ConfigurationModeInterval must be greater than zero".to_string());
    }
    Ok(Duration::from_secs(total))
}

// Raw (pre-validation) shapes; the config crate lowercases keys from files
// and environment sources, so each field carries both spellings.

#[derive(Debug, Clone, Default, Deserialize)]
struct RawRoot {
    #[serde(default, alias = "LCM")]
    lcm: RawLcm,
    /// Environment variables land at the root rather than under the LCM
    /// table; they overlay the table below.
    #[serde(flatten)]
    root: RawLcm,
}

impl RawRoot {
    /// Collapse the two layers; root-level (environment) keys win
    fn into_lcm(self) -> RawLcm {
        let base = self.lcm;
        let over = self.root;
        RawLcm {
            configuration_mode: over.configuration_mode.or(base.configuration_mode),
            configuration_source: over.configuration_source.or(base.configuration_source),
            configuration_path: over.configuration_path.or(base.configuration_path),
            configuration_mode_interval: over
                .configuration_mode_interval
                .or(base.configuration_mode_interval),
            dsc_executable_path: over.dsc_executable_path.or(base.dsc_executable_path),
            log_level: over.log_level.or(base.log_level),
            pull_server: match (base.pull_server, over.pull_server) {
                (Some(base), Some(over)) => Some(RawPullServer {
                    server_url: over.server_url.or(base.server_url),
                    registration_key: over.registration_key.or(base.registration_key),
                    report_compliance: over.report_compliance.or(base.report_compliance),
                    certificate_source: over.certificate_source.or(base.certificate_source),
                    certificate_thumbprint: over
                        .certificate_thumbprint
                        .or(base.certificate_thumbprint),
                    certificate_path: over.certificate_path.or(base.certificate_path),
                    certificate_password: over.certificate_password.or(base.certificate_password),
                }),
                (base, over) => over.or(base),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawLcm {
    #[serde(default, alias = "ConfigurationMode", alias = "configurationmode")]
    configuration_mode: Option<String>,
    #[serde(default, alias = "ConfigurationSource", alias = "configurationsource")]
    configuration_source: Option<String>,
    #[serde(default, alias = "ConfigurationPath", alias = "configurationpath")]
    configuration_path: Option<String>,
    #[serde(default, alias = "ConfigurationModeInterval", alias = "configurationmodeinterval")]
    configuration_mode_interval: Option<String>,
    #[serde(default, alias = "DscExecutablePath", alias = "dscexecutablepath")]
    dsc_executable_path: Option<String>,
    #[serde(default, alias = "LogLevel", alias = "loglevel")]
    log_level: Option<String>,
    #[serde(default, alias = "PullServer", alias = "pullserver")]
    pull_server: Option<RawPullServer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawPullServer {
    #[serde(default, alias = "ServerUrl", alias = "serverurl")]
    server_url: Option<String>,
    #[serde(default, alias = "RegistrationKey", alias = "registrationkey")]
    registration_key: Option<String>,
    #[serde(default, alias = "ReportCompliance", alias = "reportcompliance")]
    report_compliance: Option<bool>,
    #[serde(default, alias = "CertificateSource", alias = "certificatesource")]
    certificate_source: Option<String>,
    #[serde(default, alias = "CertificateThumbprint", alias = "certificatethumbprint")]
    certificate_thumbprint: Option<String>,
    #[serde(default, alias = "CertificatePath", alias = "certificatepath")]
    certificate_path: Option<String>,
    #[serde(default, alias = "CertificatePassword", alias = "certificatepassword")]
    certificate_password: Option<String>,
}

/// Command-line overrides, applied last
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub configuration_mode: Option<String>,
    pub configuration_source: Option<String>,
    pub configuration_path: Option<PathBuf>,
    pub configuration_mode_interval: Option<String>,
    pub server_url: Option<String>,
}

/// Rebuildable settings loader
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    /// Configuration files in layering order, low to high
    pub files: Vec<PathBuf>,
    pub overrides: CliOverrides,
}

impl SettingsLoader {
    /// Standard layering: bundled file, environment overlay, platform
    /// directory
    pub fn standard(environment: Option<&str>, overrides: CliOverrides) -> Self {
        let mut files = vec![PathBuf::from("appsettings.json")];
        if let Some(environment) = environment {
            files.push(PathBuf::from(format!("appsettings.{}.json", environment)));
        }
        files.push(paths::config_dir().join("appsettings.json"));
        Self { files, overrides }
    }

    /// Build and validate a settings snapshot
    ///
    /// All validation failures are returned together so each can be logged.
    pub fn load(&self) -> Result<LcmSettings, Vec<String>> {
        let mut builder = config::Config::builder();
        for file in &self.files {
            builder = builder.add_source(
                config::File::from(file.as_path())
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("LCM")
                .separator("__")
                .try_parsing(true),
        );

        let raw: RawRoot = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| vec![format!("cannot read configuration: {}", e)])?;

        self.validate(raw.into_lcm())
    }

    fn validate(&self, raw: RawLcm) -> Result<LcmSettings, Vec<String>> {
        let defaults = LcmSettings::default();
        let mut errors = Vec::new();

        let mode_raw = self
            .overrides
            .configuration_mode
            .clone()
            .or(raw.configuration_mode);
        let configuration_mode = match mode_raw.as_deref() {
            None => defaults.configuration_mode,
            Some(raw) => match raw.parse::<ConfigurationMode>() {
                Ok(mode) => mode,
                Err(e) => {
                    errors.push(e.to_string());
                    defaults.configuration_mode
                }
            },
        };

        let source_raw = self
            .overrides
            .configuration_source
            .clone()
            .or(raw.configuration_source);
        let configuration_source = match source_raw.as_deref() {
            None => defaults.configuration_source,
            Some(raw) => match raw.parse::<ConfigurationSource>() {
                Ok(source) => source,
                Err(e) => {
                    errors.push(e.to_string());
                    defaults.configuration_source
                }
            },
        };

        let configuration_path = self
            .overrides
            .configuration_path
            .clone()
            .or_else(|| raw.configuration_path.map(PathBuf::from))
            .unwrap_or_else(|| defaults.configuration_path.clone());

        let interval_raw = self
            .overrides
            .configuration_mode_interval
            .clone()
            .or(raw.configuration_mode_interval);
        let configuration_mode_interval = match interval_raw.as_deref() {
            None => defaults.configuration_mode_interval,
            Some(raw) => match parse_interval(raw) {
                Ok(interval) => interval,
                Err(e) => {
                    errors.push(e);
                    defaults.configuration_mode_interval
                }
            },
        };

        let pull_server = self.validate_pull_server(raw.pull_server, &mut errors);

        if configuration_source == ConfigurationSource::Pull && pull_server.is_none() {
            errors.push("ConfigurationSource is Pull but PullServer is not configured".to_string());
        }

        let settings = LcmSettings {
            configuration_mode,
            configuration_source,
            configuration_path,
            configuration_mode_interval,
            dsc_executable_path: raw.dsc_executable_path.map(PathBuf::from),
            log_level: raw.log_level.unwrap_or(defaults.log_level),
            pull_server,
        };

        if errors.is_empty() {
            Ok(settings)
        } else {
            Err(errors)
        }
    }

    fn validate_pull_server(
        &self,
        raw: Option<RawPullServer>,
        errors: &mut Vec<String>,
    ) -> Option<PullServerSettings> {
        let raw = raw?;
        let server_url = self.overrides.server_url.clone().or(raw.server_url);

        let server_url = match server_url {
            Some(url) if !url.is_empty() => url,
            _ => {
                errors.push("PullServer.ServerUrl is required".to_string());
                return None;
            }
        };

        let certificate_source = match raw.certificate_source.as_deref() {
            None | Some("Managed") => CertificateSource::Managed,
            Some("Platform") => CertificateSource::Platform,
            Some(other) => {
                errors.push(format!(
                    "invalid CertificateSource {:?} (expected Managed or Platform)",
                    other
                ));
                CertificateSource::Managed
            }
        };

        if certificate_source == CertificateSource::Platform && raw.certificate_path.is_none() {
            errors.push("CertificateSource Platform requires CertificatePath".to_string());
        }

        Some(PullServerSettings {
            server_url,
            registration_key: raw.registration_key.unwrap_or_default(),
            report_compliance: raw.report_compliance.unwrap_or(true),
            certificate_source,
            certificate_thumbprint: raw.certificate_thumbprint,
            certificate_path: raw.certificate_path.map(PathBuf::from),
            certificate_password: raw.certificate_password,
        })
    }
}

/// Atomically published settings snapshots
pub struct SettingsStore {
    current: ArcSwap<LcmSettings>,
    generation: AtomicU64,
}

impl SettingsStore {
    pub fn new(initial: LcmSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(0),
        }
    }

    /// The current snapshot
    pub fn load(&self) -> Arc<LcmSettings> {
        self.current.load_full()
    }

    /// Generation counter; bumped on every publish
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Publish a new snapshot
    pub fn publish(&self, settings: LcmSettings) {
        self.current.store(Arc::new(settings));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Reload through the loader; failures keep the previous snapshot
    pub fn reload(&self, loader: &SettingsLoader) {
        match loader.load() {
            Ok(settings) => {
                if settings != *self.load() {
                    tracing::info!("configuration changed, publishing new snapshot");
                    self.publish(settings);
                }
            }
            Err(errors) => {
                for error in &errors {
                    tracing::error!(%error, "configuration reload failed; keeping previous settings");
                }
            }
        }
    }
}

/// Watch the loader's files and reload on any change
pub fn watch(
    store: Arc<SettingsStore>,
    loader: SettingsLoader,
) -> notify::Result<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let watch_targets: Vec<PathBuf> = loader
        .files
        .iter()
        .filter(|f| f.exists())
        .cloned()
        .collect();

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                store.reload(&loader);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "configuration watcher error"),
        }
    })?;

    for target in &watch_targets {
        watcher.watch(target, RecursiveMode::NonRecursive)?;
    }
    Ok(watcher)
}

/// Resolve the enforcement executable: configured path or `dsc` on PATH
pub fn resolve_executable(settings: &LcmSettings) -> PathBuf {
    settings
        .dsc_executable_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("dsc"))
}

/// True when the two snapshots differ only in the interval
pub fn only_interval_changed(old: &LcmSettings, new: &LcmSettings) -> bool {
    let mut normalized = new.clone();
    normalized.configuration_mode_interval = old.configuration_mode_interval;
    old == &normalized && old.configuration_mode_interval != new.configuration_mode_interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("00:15:00").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_interval("01:00:30").unwrap(), Duration::from_secs(3630));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(parse_interval("00:00:00").is_err());
    }

    #[test]
    fn test_malformed_interval_rejected() {
        for raw in ["15:00", "00:61:00", "00:00:99", "abc", "1:2:3:4", ""] {
            assert!(parse_interval(raw).is_err(), "{raw} accepted");
        }
    }

    fn loader_with(overrides: CliOverrides) -> SettingsLoader {
        SettingsLoader {
            files: Vec::new(),
            overrides,
        }
    }

    #[test]
    fn test_defaults_when_nothing_configured() {
        let settings = loader_with(CliOverrides::default())
            .validate(RawLcm::default())
            .unwrap();
        assert_eq!(settings.configuration_mode, ConfigurationMode::Monitor);
        assert_eq!(settings.configuration_source, ConfigurationSource::Local);
        assert_eq!(settings.configuration_mode_interval, Duration::from_secs(900));
    }

    #[test]
    fn test_cli_overrides_win() {
        let raw = RawLcm {
            configuration_mode: Some("Monitor".into()),
            configuration_mode_interval: Some("00:15:00".into()),
            ..RawLcm::default()
        };
        let overrides = CliOverrides {
            configuration_mode: Some("Remediate".into()),
            configuration_mode_interval: Some("00:01:00".into()),
            ..CliOverrides::default()
        };
        let settings = loader_with(overrides).validate(raw).unwrap();
        assert_eq!(settings.configuration_mode, ConfigurationMode::Remediate);
        assert_eq!(settings.configuration_mode_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_pull_without_server_is_invalid() {
        let raw = RawLcm {
            configuration_source: Some("Pull".into()),
            ..RawLcm::default()
        };
        let errors = loader_with(CliOverrides::default()).validate(raw).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("PullServer")));
    }

    #[test]
    fn test_platform_source_requires_path() {
        let raw = RawLcm {
            pull_server: Some(RawPullServer {
                server_url: Some("https://pull.example".into()),
                certificate_source: Some("Platform".into()),
                ..RawPullServer::default()
            }),
            ..RawLcm::default()
        };
        let errors = loader_with(CliOverrides::default()).validate(raw).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("CertificatePath")));
    }

    #[test]
    fn test_invalid_mode_reports_error() {
        let raw = RawLcm {
            configuration_mode: Some("Audit".into()),
            ..RawLcm::default()
        };
        let errors = loader_with(CliOverrides::default()).validate(raw).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("configuration mode")));
    }

    #[test]
    fn test_store_publish_bumps_generation() {
        let store = SettingsStore::new(LcmSettings::default());
        assert_eq!(store.generation(), 0);

        let mut changed = LcmSettings::default();
        changed.configuration_mode = ConfigurationMode::Remediate;
        store.publish(changed);

        assert_eq!(store.generation(), 1);
        assert_eq!(store.load().configuration_mode, ConfigurationMode::Remediate);
    }

    #[test]
    fn test_only_interval_changed() {
        let old = LcmSettings::default();
        let mut new = old.clone();
        new.configuration_mode_interval = Duration::from_secs(60);
        assert!(only_interval_changed(&old, &new));

        new.configuration_mode = ConfigurationMode::Remediate;
        assert!(!only_interval_changed(&old, &new));

        assert!(!only_interval_changed(&old, &old.clone()));
    }
}
