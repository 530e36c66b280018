// Environment-driven configuration helpers.
//
// Each component owns its config struct (with `Default`); the `from_env`
// loaders go through a lookup function so they can be exercised without
// touching the process environment.

use std::{str::FromStr, time::Duration};

use tracing::warn;

pub const ENV_PREFIX: &str = "HOTELMSG";

pub trait EnvLookup {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl<F> EnvLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

pub fn env_key(section: &str, name: &str) -> String {
    format!("{ENV_PREFIX}_{}_{}", section.to_uppercase(), name.to_uppercase())
}

// Parse `key` or fall back to `default`. Values rejected by `valid` also fall back.
pub fn parse_or<T, L>(env: &L, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + std::fmt::Debug,
    L: EnvLookup + ?Sized,
{
    let Some(raw) = env.get(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(key = %key, value = %raw, default = ?default, "Invalid config value, using default");
            default
        }
    }
}

pub fn seconds_or<L>(env: &L, key: &str, default: Duration) -> Duration
where
    L: EnvLookup + ?Sized,
{
    Duration::from_secs(parse_or(env, key, default.as_secs(), |v| *v > 0))
}

pub fn millis_or<L>(env: &L, key: &str, default: Duration) -> Duration
where
    L: EnvLookup + ?Sized,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_or(env, key, default_ms, |v| *v > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_env_key_format() {
        assert_eq!(
            env_key("cb_pms", "failure_threshold"),
            "HOTELMSG_CB_PMS_FAILURE_THRESHOLD"
        );
    }

    #[test]
    fn test_parse_or_falls_back_on_invalid() {
        let lookup = env(&[("A", "7"), ("B", "zero"), ("C", "0")]);
        assert_eq!(parse_or(&lookup, "A", 3u32, |v| *v > 0), 7);
        assert_eq!(parse_or(&lookup, "B", 3u32, |v| *v > 0), 3);
        assert_eq!(parse_or(&lookup, "C", 3u32, |v| *v > 0), 3);
        assert_eq!(parse_or(&lookup, "missing", 3u32, |v| *v > 0), 3);
    }

    #[test]
    fn test_duration_helpers() {
        let lookup = env(&[("T", "45"), ("M", "250")]);
        assert_eq!(
            seconds_or(&lookup, "T", Duration::from_secs(1)),
            Duration::from_secs(45)
        );
        assert_eq!(
            millis_or(&lookup, "M", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
    }
}
