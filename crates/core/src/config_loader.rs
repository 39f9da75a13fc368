use crate::config::AppConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads engine configuration by merging TOML, environment variables, and JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file("config/Condor.toml"))
            .merge(Env::prefixed("CONDOR_").split("__"))
            .join(Json::file("config/Condor.json"))
            .extract()?;

        Ok(config)
    }

    /// Loads configuration with a profile overlay (e.g. "paper", "live").
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file("config/Condor.toml"))
            .merge(Toml::file(format!("config/Condor.{profile}.toml")))
            .merge(Env::prefixed("CONDOR_").split("__"))
            .join(Json::file("config/Condor.json"))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_files_yields_defaults() {
        // No config files present in the test environment; figment falls
        // through to serde defaults.
        let config = ConfigLoader::load().expect("defaults should load");
        assert_eq!(config.engine.fill_timeout_secs, 30);
    }
}
