use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::net::SocketAddr;
use std::path::Path;

use super::schema::Config;
use crate::error::{ConfigError, Result};
use crate::plugin::PluginKind;

const ENV_PREFIX: &str = "PLUGIN_PROXY_";

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("plugin-proxy.toml"))
        .merge(Json::file("plugin-proxy.json"))
        .merge(Yaml::file("plugin-proxy.yaml"))
        .merge(Yaml::file("plugin-proxy.yml"))
        // Override with environment variables (PLUGIN_PROXY_ prefix)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, entry) in &config.entry_points {
        if entry.address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Entry point '{}' has invalid address '{}'",
                name, entry.address
            ))
            .into());
        }

        match url::Url::parse(&entry.upstream) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "Entry point '{}' has invalid upstream URL '{}'",
                    name, entry.upstream
                ))
                .into())
            }
        }
    }

    for plugin in &config.plugins {
        if plugin.entry_name.is_empty() {
            return Err(ConfigError::MissingField("plugins[].entryName".into()).into());
        }

        if !config.entry_points.contains_key(&plugin.entry_name) {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' refers to unknown entry point '{}'",
                plugin.path, plugin.entry_name
            ))
            .into());
        }

        if plugin.kind == PluginKind::RemoteProcedure && plugin.path.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Remote plugin for entry point '{}' has no address",
                plugin.entry_name
            ))
            .into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for plugin in &mut config.plugins {
        plugin.path = substitute_env_vars(&plugin.path)?;
    }

    for entry in config.entry_points.values_mut() {
        entry.address = substitute_env_vars(&entry.address)?;
        entry.upstream = substitute_env_vars(&entry.upstream)?;
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
