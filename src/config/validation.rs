//! Configuration validation

use super::Config;
use crate::dataplane::{Action, PolicyRule};
use std::net::SocketAddr;

/// Smallest buffer that holds an IPv4 header plus a transport header
const MIN_BUFFER_SIZE: usize = 40;
const MAX_BUFFER_SIZE: usize = 65535;
/// IPv4 minimum link MTU
const MIN_MTU: u32 = 68;
const MAX_MTU: u32 = 65535;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
///
/// Policy problems are warnings: the engine skips bad rules and keeps going.
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_listener(config, &mut result);
    validate_tun(config, &mut result);
    validate_engine(config, &mut result);
    validate_log(config, &mut result);
    validate_policies(config, &mut result);

    result
}

fn validate_listener(config: &Config, result: &mut ValidationResult) {
    if config.address.parse::<SocketAddr>().is_err() {
        result.error(format!(
            "address: {:?} is not an ip:port socket address",
            config.address
        ));
    }

    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&config.max_buffer_size) {
        result.error(format!(
            "max_buffer_size: {} outside {}..={}",
            config.max_buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
        ));
    }
}

fn validate_tun(config: &Config, result: &mut ValidationResult) {
    let Some(tun) = &config.tun else {
        return;
    };

    if !(MIN_MTU..=MAX_MTU).contains(&tun.mtu) {
        result.error(format!("tun.mtu: {} outside {}..={}", tun.mtu, MIN_MTU, MAX_MTU));
    }

    if let Err(e) = tun.parse_address() {
        result.error(e.to_string());
    } else if tun.address.is_none() {
        result.warn("tun: no address configured, the interface will come up unnumbered");
    }

    if tun.mtu as usize > config.max_buffer_size {
        result.warn(format!(
            "tun.mtu: {} exceeds max_buffer_size {}, large packets will be truncated",
            tun.mtu, config.max_buffer_size
        ));
    }
}

fn validate_engine(config: &Config, result: &mut ValidationResult) {
    if config.engine.read_timeout_ms == 0 {
        result.error("engine.read_timeout_ms: must be greater than zero");
    }
    if config.engine.queue_capacity == 0 {
        result.warn("engine.queue_capacity: 0, using 1");
    }
    if config.proxy.queue_capacity == 0 {
        result.warn("proxy.queue_capacity: 0, using 1");
    }
}

fn validate_log(config: &Config, result: &mut ValidationResult) {
    if let Some(log) = &config.log {
        if !log.is_known_format() {
            result.warn(format!("log.format: unknown format {:?}, using pretty", log.format));
        }
        if !log.is_known_level() {
            result.warn(format!("log.level: unknown level {:?}, using info", log.level));
        }
    }
}

fn validate_policies(config: &Config, result: &mut ValidationResult) {
    if config.policies.is_empty() {
        result.warn("policies: none defined, every packet will be dropped");
    }

    for (index, policy) in config.policies.iter().enumerate() {
        match PolicyRule::from_config(policy) {
            Ok(rule) => {
                if rule.action == Action::Local && config.tun.is_none() {
                    result.warn(format!(
                        "policies[{}]: action local requires [tun], rule will be skipped",
                        index
                    ));
                }
            }
            Err(e) => result.warn(format!("policies[{}]: {}, rule will be skipped", index, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, TunConfig};
    use crate::telemetry::LogConfig;

    fn make_config() -> Config {
        let mut config = Config::default();
        config.policies.push(PolicyConfig {
            dst_addr: "10.0.0.0/24".into(),
            action: "drop".into(),
            ..Default::default()
        });
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        let result = validate(&make_config());
        assert!(!result.has_errors(), "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_bad_address() {
        let mut config = make_config();
        config.address = "localhost".into();
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("address")));
    }

    #[test]
    fn test_buffer_size_bounds() {
        let mut config = make_config();
        config.max_buffer_size = 20;
        assert!(validate(&config).has_errors());

        config.max_buffer_size = 70000;
        assert!(validate(&config).has_errors());

        config.max_buffer_size = 40;
        assert!(!validate(&config).has_errors());
    }

    #[test]
    fn test_unknown_log_settings_warn() {
        let mut config = make_config();
        config.log = Some(LogConfig {
            level: "loud".into(),
            format: "xml".into(),
        });
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("log.level")));
        assert!(result.warnings.iter().any(|w| w.contains("log.format")));
    }

    #[test]
    fn test_tun_checks() {
        let mut config = make_config();
        config.tun = Some(TunConfig {
            address: Some("10.10.0.1/40".into()),
            mtu: 10,
            ..TunConfig::default()
        });
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("tun.mtu")));
        assert!(result.errors.iter().any(|e| e.contains("tun.address")));
    }

    #[test]
    fn test_bad_policies_are_warnings() {
        let mut config = make_config();
        config.policies.push(PolicyConfig {
            action: "drop".into(),
            ..Default::default()
        });
        config.policies.push(PolicyConfig {
            dst_port: "tcp:http".into(),
            action: "drop".into(),
            ..Default::default()
        });
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("policies[1]")));
        assert!(result.warnings.iter().any(|w| w.contains("policies[2]")));
    }

    #[test]
    fn test_local_without_tun() {
        let mut config = make_config();
        config.policies[0].action = "local".into();
        let result = validate(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("requires [tun]")));

        config.tun = Some(TunConfig {
            address: Some("10.10.0.1/24".into()),
            ..TunConfig::default()
        });
        let result = validate(&config);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }
}
