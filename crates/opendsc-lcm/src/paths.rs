//! Platform directories for configuration, data, and logs

use std::path::PathBuf;

/// Directory holding `appsettings.json` overlays
pub fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
            .join("OpenDSC")
            .join("LCM")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Preferences/OpenDSC/LCM")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        PathBuf::from("/etc/opendsc/lcm")
    }
}

/// Directory for managed state: certificates, pulled bundles, checksums
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        config_dir().join("data")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Application Support/OpenDSC/LCM")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        PathBuf::from("/var/lib/opendsc/lcm")
    }
}

/// Directory for log files when file logging is used
pub fn log_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        config_dir().join("logs")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Logs/OpenDSC")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        PathBuf::from("/var/log/opendsc")
    }
}
