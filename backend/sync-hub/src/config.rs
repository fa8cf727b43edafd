use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub udp: UdpConfig,
    pub tcp: TcpConfig,
    pub control: ControlConfig,
    pub delivery: DeliveryConfig,
}

/// UDP notification broadcaster settings
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub bind_addr: String,
    /// Upper bound on concurrent outbound sends per broadcast
    pub max_concurrent_sends: usize,
    pub send_timeout: Duration,
    /// Expire subscribers not seen for this long; `None` keeps them forever
    pub subscriber_ttl: Option<Duration>,
}

/// TCP progress sync server settings
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub bind_addr: String,
    pub backlog_capacity: usize,
    pub channel_capacity: usize,
    pub heartbeat_timeout: Duration,
    pub reaper_interval: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind_addr: String,
}

/// Delivery bridge target; `api_url: None` disables forwarding
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub api_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9091".to_string(),
            max_concurrent_sends: 10,
            send_timeout: Duration::from_secs(2),
            subscriber_ttl: None,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8082".to_string(),
            backlog_capacity: 50,
            channel_capacity: 100,
            heartbeat_timeout: Duration::from_secs(15),
            reaper_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9094".to_string(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_url: Some("http://localhost:8080/users/progress".to_string()),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let udp_defaults = UdpConfig::default();
        let tcp_defaults = TcpConfig::default();
        let delivery_defaults = DeliveryConfig::default();

        let ttl_secs: u64 = parse_or(&lookup, "UDP_SUBSCRIBER_TTL_SECS", 0)?;

        let udp = UdpConfig {
            bind_addr: lookup("UDP_BIND_ADDR").unwrap_or(udp_defaults.bind_addr),
            max_concurrent_sends: parse_or(
                &lookup,
                "UDP_MAX_CONCURRENT_SENDS",
                udp_defaults.max_concurrent_sends,
            )?,
            send_timeout: Duration::from_millis(parse_or(&lookup, "UDP_SEND_TIMEOUT_MS", 2000)?),
            subscriber_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
        };

        let tcp = TcpConfig {
            bind_addr: lookup("TCP_BIND_ADDR").unwrap_or(tcp_defaults.bind_addr),
            backlog_capacity: parse_or(
                &lookup,
                "TCP_BACKLOG_CAPACITY",
                tcp_defaults.backlog_capacity,
            )?,
            channel_capacity: parse_or(
                &lookup,
                "TCP_CHANNEL_CAPACITY",
                tcp_defaults.channel_capacity,
            )?,
            heartbeat_timeout: Duration::from_secs(parse_or(
                &lookup,
                "TCP_HEARTBEAT_TIMEOUT_SECS",
                15,
            )?),
            reaper_interval: Duration::from_secs(parse_or(&lookup, "TCP_REAPER_INTERVAL_SECS", 10)?),
            write_timeout: Duration::from_millis(parse_or(&lookup, "TCP_WRITE_TIMEOUT_MS", 2000)?),
        };

        let control = ControlConfig {
            bind_addr: lookup("CONTROL_BIND_ADDR").unwrap_or_else(|| ControlConfig::default().bind_addr),
        };

        let api_url = match lookup("PROGRESS_API_URL") {
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url),
            None => delivery_defaults.api_url,
        };
        let delivery = DeliveryConfig {
            api_url,
            request_timeout: Duration::from_millis(parse_or(
                &lookup,
                "PROGRESS_API_TIMEOUT_MS",
                5000,
            )?),
        };

        let config = Config {
            udp,
            tcp,
            control,
            delivery,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.udp.max_concurrent_sends == 0 {
            return Err(AppError::Config(
                "UDP_MAX_CONCURRENT_SENDS must be at least 1".into(),
            ));
        }
        if self.tcp.backlog_capacity == 0 {
            return Err(AppError::Config(
                "TCP_BACKLOG_CAPACITY must be at least 1".into(),
            ));
        }
        if self.tcp.channel_capacity == 0 {
            return Err(AppError::Config(
                "TCP_CHANNEL_CAPACITY must be at least 1".into(),
            ));
        }
        if self.tcp.reaper_interval.is_zero() {
            return Err(AppError::Config(
                "TCP_REAPER_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.udp.bind_addr, "0.0.0.0:9091");
        assert_eq!(config.udp.max_concurrent_sends, 10);
        assert_eq!(config.udp.send_timeout, Duration::from_secs(2));
        assert!(config.udp.subscriber_ttl.is_none());
        assert_eq!(config.tcp.bind_addr, "0.0.0.0:8082");
        assert_eq!(config.tcp.channel_capacity, 100);
        assert_eq!(config.tcp.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.tcp.reaper_interval, Duration::from_secs(10));
        assert_eq!(config.control.bind_addr, "127.0.0.1:9094");
        assert!(config.delivery.api_url.is_some());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("UDP_MAX_CONCURRENT_SENDS", "4"),
            ("UDP_SUBSCRIBER_TTL_SECS", "300"),
            ("TCP_BACKLOG_CAPACITY", "8"),
            ("PROGRESS_API_URL", ""),
        ]))
        .unwrap();

        assert_eq!(config.udp.max_concurrent_sends, 4);
        assert_eq!(config.udp.subscriber_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.tcp.backlog_capacity, 8);
        assert!(config.delivery.api_url.is_none());
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = Config::from_lookup(lookup_from(&[("TCP_CHANNEL_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_zero_worker_pool_rejected() {
        let err = Config::from_lookup(lookup_from(&[("UDP_MAX_CONCURRENT_SENDS", "0")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
