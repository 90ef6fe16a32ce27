// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, VizError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::VizError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let lease = parse_duration(&raw.queue.lease)
            .map_err(|e| VizError::Config(format!("[queue].lease: {e}")))?;
        Ok(ConfigFile::new_unchecked(raw, lease))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine(cfg)?;
    validate_queue(cfg)?;
    validate_container(cfg)?;
    validate_packages(cfg)?;
    Ok(())
}

fn validate_engine(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.pool_size == 0 {
        return Err(VizError::Config(
            "[engine].pool_size must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_queue(cfg: &RawConfigFile) -> Result<()> {
    if cfg.queue.workers == 0 {
        return Err(VizError::Config(
            "[queue].workers must be >= 1 (got 0)".to_string(),
        ));
    }

    let lease = parse_duration(&cfg.queue.lease)
        .map_err(|e| VizError::Config(format!("[queue].lease: {e}")))?;
    if lease.is_zero() {
        return Err(VizError::Config("[queue].lease must be positive".to_string()));
    }

    for (key, queue) in cfg.queue.routes.iter() {
        if split_command_key(key).is_none() {
            return Err(VizError::Config(format!(
                "[queue.routes] key '{}' must have the form \"package.command\"",
                key
            )));
        }
        if queue.trim().is_empty() {
            return Err(VizError::Config(format!(
                "[queue.routes] '{}' maps to an empty queue name",
                key
            )));
        }
    }
    Ok(())
}

fn validate_container(cfg: &RawConfigFile) -> Result<()> {
    if cfg.container.pool_size == 0 {
        return Err(VizError::Config(
            "[container].pool_size must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.container.rpc_buffer == 0 {
        return Err(VizError::Config(
            "[container].rpc_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_packages(cfg: &RawConfigFile) -> Result<()> {
    for (package, commands) in cfg.packages.iter() {
        for (command, flags) in commands.iter() {
            if package.contains('.') || command.contains('.') {
                return Err(VizError::Config(format!(
                    "[packages.{package}.{command}]: identifiers must not contain '.'"
                )));
            }
            if flags.synchronous && !flags.enabled {
                return Err(VizError::Config(format!(
                    "[packages.{package}.{command}]: a disabled command cannot be synchronous"
                )));
            }
        }
    }
    Ok(())
}

/// Split `"package.command"` into its two halves.
pub fn split_command_key(key: &str) -> Option<(&str, &str)> {
    let (package, command) = key.split_once('.')?;
    if package.is_empty() || command.is_empty() || command.contains('.') {
        return None;
    }
    Some((package, command))
}

/// Parse a duration string such as `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_all_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn command_keys_need_exactly_one_dot() {
        assert_eq!(split_command_key("shell.run"), Some(("shell", "run")));
        assert_eq!(split_command_key("shell"), None);
        assert_eq!(split_command_key("a.b.c"), None);
        assert_eq!(split_command_key(".run"), None);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut raw = RawConfigFile::default();
        raw.engine.pool_size = 0;
        let err = ConfigFile::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }
}
