use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "CAPTURE_PROXY_";

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("capture-proxy.toml"))
        .merge(Json::file("capture-proxy.json"))
        .merge(Yaml::file("capture-proxy.yaml"))
        .merge(Yaml::file("capture-proxy.yml"))
        // CAPTURE_PROXY_PROXY__PORT=8080 -> proxy.port
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
    if config.proxy.host.parse::<std::net::IpAddr>().is_err() {
        return Err(ConfigError::Validation(format!(
            "Proxy host '{}' is not an IP address",
            config.proxy.host
        ))
        .into());
    }

    if config.proxy.max_captures == 0 {
        return Err(
            ConfigError::Validation("maxCaptures must be greater than 0".into()).into(),
        );
    }

    if config.proxy.max_head_bytes < 1024 {
        return Err(
            ConfigError::Validation("maxHeadBytes must be at least 1024".into()).into(),
        );
    }

    if config.authority.root_validity_days < 365 {
        return Err(ConfigError::Validation(
            "rootValidityDays must be at least 365".into(),
        )
        .into());
    }

    if !(1..=30).contains(&config.authority.leaf_validity_days) {
        return Err(ConfigError::Validation(
            "leafValidityDays must be between 1 and 30".into(),
        )
        .into());
    }

    if config.tls.client_cert_path().is_some() != config.tls.client_key_path().is_some() {
        return Err(ConfigError::Validation(
            "TLS client certificate and key must be configured together".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for path in [
        &mut config.tls.client_cert_path,
        &mut config.tls.client_key_path,
        &mut config.tls.custom_ca_path,
    ]
    .into_iter()
    .flatten()
    {
        let raw = path.to_string_lossy().into_owned();
        *path = PathBuf::from(substitute_env_vars(&raw)?);
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        // ${VAR:-default}
        if let Some((name, default)) = var_name.split_once(":-") {
            match std::env::var(name) {
                Ok(value) => result = result.replace(&cap[0], &value),
                Err(_) => result = result.replace(&cap[0], default),
            }
            continue;
        }

        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    var_name
                ))
                .into());
            }
        }
    }

    Ok(result)
}
