use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    serde_json::{Map, Value},
    tracing::{debug, info, warn},
};

use crate::{env_subst::substitute_env, schema::GatewayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "hostgate.toml",
    "hostgate.yaml",
    "hostgate.yml",
    "hostgate.json",
];

/// Section holding values shared by every identity.
const GENERAL_SECTION: &str = "general";

/// Load config from the given path (any supported format).
///
/// `identity` selects an override section: keys under `[<identity>]` replace
/// the ones under `[general]`.
pub fn load_config(path: &Path, identity: Option<&str>) -> anyhow::Result<GatewayConfig> {
    let value = load_config_value(path)?;
    let merged = resolve_sections(value, identity);
    let config: GatewayConfig = serde_json::from_value(merged)
        .with_context(|| format!("invalid config in {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Read, env-substitute and parse a config file into a JSON value.
pub fn load_config_value(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config_value(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./hostgate.{toml,yaml,yml,json}`
/// 2. `~/.config/hostgate/hostgate.{toml,yaml,yml,json}`
///
/// Writes and returns the defaults if nothing is found; falls back to the
/// defaults (with a warning) if the file found cannot be loaded.
pub fn discover_and_load(identity: Option<&str>) -> GatewayConfig {
    let dirs = search_dirs();
    if let Some(path) = find_config_file(&dirs) {
        debug!(path = %path.display(), "loading config");
        match load_config(&path, identity) {
            Ok(cfg) => {
                info!(path = %path.display(), identity, "config loaded");
                return cfg;
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                return GatewayConfig::default();
            },
        }
    }

    let config = GatewayConfig::default();
    let target = config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILENAMES[0]);
    debug!(path = %target.display(), "no config file found, writing default config");
    if let Err(e) = write_default_config(&target, &config) {
        warn!(error = %e, "failed to write default config file");
    }
    config
}

fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(dir) = config_dir() {
        dirs.push(dir);
    }
    dirs
}

/// First existing config file across `dirs`, in order.
pub fn find_config_file(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.is_file())
}

/// `~/.config/hostgate/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("hostgate"))
}

/// Write `config` as TOML under a `[general]` section. Existing files are kept.
pub fn write_default_config(path: &Path, config: &GatewayConfig) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut root = toml::Table::new();
    root.insert(
        GENERAL_SECTION.into(),
        toml::Value::try_from(config).context("serialize config")?,
    );
    let toml_str = toml::to_string_pretty(&root).context("serialize config")?;
    std::fs::write(path, toml_str)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(())
}

/// Flatten sectioned config into the effective key set.
///
/// Precedence, lowest first: top-level scalar keys, `[general]`, then
/// `[<identity>]`. Sections for other identities are ignored.
pub fn resolve_sections(value: Value, identity: Option<&str>) -> Value {
    let Value::Object(mut root) = value else {
        return Value::Object(Map::new());
    };

    let general = take_section(&mut root, GENERAL_SECTION);
    let overrides = identity.and_then(|id| take_section(&mut root, id));

    let mut merged: Map<String, Value> = root
        .into_iter()
        .filter(|(_, v)| !v.is_object())
        .collect();
    for section in [general, overrides].into_iter().flatten() {
        merged.extend(section);
    }
    Value::Object(merged)
}

fn take_section(root: &mut Map<String, Value>, name: &str) -> Option<Map<String, Value>> {
    match root.remove(name) {
        Some(Value::Object(section)) => Some(section),
        Some(other) => {
            // not a table; keep it as a plain key
            root.insert(name.to_string(), other);
            None
        },
        None => None,
    }
}

fn parse_config_value(raw: &str, path: &Path) -> anyhow::Result<Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
