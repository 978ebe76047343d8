use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "switchboard.toml";
pub const ENV_PREFIX: &str = "SWITCHBOARD_";
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen: SocketAddr,
    pub credentials_path: PathBuf,
    pub max_frame_len: usize,
    /// Seconds a started frame may wait for its terminator.
    pub frame_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Bound on a CALC round trip. Unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_timeout_secs: Option<u64>,
    pub log_json: bool,
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            credentials_path: PathBuf::from("./database.txt"),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            frame_timeout_secs: 30,
            write_timeout_secs: 5,
            dispatch_timeout_secs: None,
            log_json: false,
            verbose: false,
            log_file: None,
        }
    }
}

impl AppConfig {
    /// Merge defaults, the TOML file, `SWITCHBOARD_*` variables and
    /// command-line overrides, later sources winning.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        Self::figment(config_file, overrides).extract()
    }

    pub fn figment<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Figment {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        listen: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    }

    #[test]
    fn defaults_apply_without_sources() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::new(None, None::<&Overrides>)?;
            assert_eq!(config, AppConfig::default());
            assert!(config.dispatch_timeout().is_none());
            Ok(())
        });
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                    listen = "127.0.0.1:9000"
                    credentials_path = "users.txt"
                    dispatch_timeout_secs = 10
                "#,
            )?;
            jail.set_env("SWITCHBOARD_CREDENTIALS_PATH", "from-env.txt");

            let overrides = Overrides {
                listen: Some("127.0.0.1:9100".into()),
                verbose: None,
            };
            let config = AppConfig::new(None, Some(&overrides))?;

            assert_eq!(config.listen, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
            assert_eq!(config.credentials_path, PathBuf::from("from-env.txt"));
            assert_eq!(config.dispatch_timeout(), Some(Duration::from_secs(10)));
            assert!(!config.verbose);
            Ok(())
        });
    }

    #[test]
    fn explicit_config_file_is_used() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "max_frame_len = 128")?;
            let config = AppConfig::new(Some(Path::new("custom.toml")), None::<&Overrides>)?;
            assert_eq!(config.max_frame_len, 128);
            Ok(())
        });
    }
}
