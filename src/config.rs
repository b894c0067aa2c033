use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::auth::MIN_SECRET_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Bootstrap admin created in every tenant that has none yet.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminSeed {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSeed")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Server settings, read from `HOTDESK_*` environment variables.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// `None` leaves reconciliation to an external scheduler.
    pub sweep_interval: Option<Duration>,
    pub admin: Option<AdminSeed>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("max_connections", &self.max_connections)
            .field("compact_threshold", &self.compact_threshold)
            .field("tls", &self.tls_cert.is_some())
            .field("metrics_port", &self.metrics_port)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("sweep_interval", &self.sweep_interval)
            .field("admin", &self.admin)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = get("HOTDESK_JWT_SECRET").ok_or(ConfigError::Missing {
            key: "HOTDESK_JWT_SECRET",
        })?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                key: "HOTDESK_JWT_SECRET",
                value: "<redacted>".into(),
                reason: format!("must be at least {} characters", MIN_SECRET_LEN),
            });
        }

        let tls_cert = get("HOTDESK_TLS_CERT");
        let tls_key = get("HOTDESK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Invalid {
                key: "HOTDESK_TLS_CERT",
                value: tls_cert.or(tls_key).unwrap_or_default(),
                reason: "HOTDESK_TLS_CERT and HOTDESK_TLS_KEY must be set together".into(),
            });
        }

        let admin = match (get("HOTDESK_ADMIN_EMAIL"), get("HOTDESK_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminSeed { email, password }),
            (None, None) => None,
            (Some(email), None) => {
                return Err(ConfigError::Invalid {
                    key: "HOTDESK_ADMIN_PASSWORD",
                    value: String::new(),
                    reason: format!("required when HOTDESK_ADMIN_EMAIL={email} is set"),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing {
                    key: "HOTDESK_ADMIN_EMAIL",
                });
            }
        };

        let sweep_secs: u64 = parse_or(&get, "HOTDESK_SWEEP_INTERVAL_SECS", 0)?;

        Ok(Self {
            bind: get("HOTDESK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "HOTDESK_PORT", 5433)?,
            data_dir: PathBuf::from(get("HOTDESK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("HOTDESK_PASSWORD").unwrap_or_else(|| "hotdesk".into()),
            max_connections: parse_or(&get, "HOTDESK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "HOTDESK_COMPACT_THRESHOLD", 1000)?,
            tls_cert,
            tls_key,
            metrics_port: parse_opt(&get, "HOTDESK_METRICS_PORT")?,
            jwt_secret,
            access_ttl_secs: parse_or(&get, "HOTDESK_ACCESS_TTL_SECS", 900)?,
            refresh_ttl_secs: parse_or(&get, "HOTDESK_REFRESH_TTL_SECS", 7 * 24 * 3600)?,
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            admin,
        })
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_or<T: FromStr + Display>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    match parse_opt(get, key)? {
        Some(value) => Ok(value),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = load(&[("HOTDESK_JWT_SECRET", SECRET)]).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.password, "hotdesk");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.access_ttl_secs, 900);
        assert_eq!(cfg.refresh_ttl_secs, 604_800);
        assert_eq!(cfg.sweep_interval, None);
        assert_eq!(cfg.metrics_port, None);
        assert!(cfg.admin.is_none());
    }

    #[test]
    fn secret_required_and_long() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing { key: "HOTDESK_JWT_SECRET" })));
        assert!(matches!(
            load(&[("HOTDESK_JWT_SECRET", "short")]),
            Err(ConfigError::Invalid { key: "HOTDESK_JWT_SECRET", .. })
        ));
    }

    #[test]
    fn overrides_parse() {
        let cfg = load(&[
            ("HOTDESK_JWT_SECRET", SECRET),
            ("HOTDESK_PORT", "6000"),
            ("HOTDESK_SWEEP_INTERVAL_SECS", "60"),
            ("HOTDESK_METRICS_PORT", "9090"),
            ("HOTDESK_ADMIN_EMAIL", "root@example.com"),
            ("HOTDESK_ADMIN_PASSWORD", "change-me-please"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.sweep_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.metrics_port, Some(9090));
        assert_eq!(cfg.admin.unwrap().email, "root@example.com");
    }

    #[test]
    fn bad_number_is_reported() {
        let err = load(&[("HOTDESK_JWT_SECRET", SECRET), ("HOTDESK_PORT", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HOTDESK_PORT", .. }));
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    fn tls_needs_both_files() {
        let result = load(&[("HOTDESK_JWT_SECRET", SECRET), ("HOTDESK_TLS_CERT", "cert.pem")]);
        assert!(matches!(result, Err(ConfigError::Invalid { key: "HOTDESK_TLS_CERT", .. })));
    }

    #[test]
    fn admin_seed_needs_password() {
        let result = load(&[
            ("HOTDESK_JWT_SECRET", SECRET),
            ("HOTDESK_ADMIN_EMAIL", "root@example.com"),
        ]);
        assert!(matches!(result, Err(ConfigError::Invalid { key: "HOTDESK_ADMIN_PASSWORD", .. })));
    }

    #[test]
    fn secrets_stay_out_of_debug() {
        let cfg = load(&[
            ("HOTDESK_JWT_SECRET", SECRET),
            ("HOTDESK_ADMIN_EMAIL", "root@example.com"),
            ("HOTDESK_ADMIN_PASSWORD", "change-me-please"),
        ])
        .unwrap();
        let shown = format!("{cfg:?}");
        assert!(!shown.contains(SECRET));
        assert!(!shown.contains("change-me-please"));
    }
}
