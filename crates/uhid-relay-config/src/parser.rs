//! KDL configuration parser
//!
//! Accepted layout:
//!
//! ```kdl
//! log-level "debug"
//!
//! relay {
//!     uhid-path "/dev/uhid"
//!     port 4242
//!     settle-delay-ms 20
//!     listen-backlog 5
//! }
//!
//! device {
//!     name "virtual-keyboard"
//!     vendor 0x15d9
//!     product 0x0a37
//!     version 0
//!     country 0
//!     discovery-delay-ms 500
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::*;

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl depends on an older miette, so rebuild the span on our side
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "log-level" => {
                let val = string_arg(node)?;
                config.log_level = Some(
                    val.parse::<LogLevel>()
                        .map_err(|message| ConfigError::Invalid { message })?,
                );
            }
            "relay" => {
                config.relay = parse_relay(node)?;
            }
            "device" => {
                config.device = parse_device(node)?;
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(config)
}

fn parse_relay(node: &kdl::KdlNode) -> Result<RelayConfig, ConfigError> {
    let mut relay = RelayConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "uhid-path" => {
                    let val = string_arg(child)?;
                    relay.uhid_path = shellexpand::tilde(val).into_owned().into();
                }
                "port" => {
                    let port = int_arg(child)?;
                    relay.port = match u16::try_from(port) {
                        Ok(0) | Err(_) => {
                            return Err(ConfigError::Invalid {
                                message: format!("port must be between 1 and 65535, got {}", port),
                            })
                        }
                        Ok(port) => port,
                    };
                }
                "settle-delay-ms" => {
                    let ms = int_arg(child)?;
                    if !(0..=MAX_SETTLE_DELAY_MS as i64).contains(&ms) {
                        return Err(ConfigError::Invalid {
                            message: format!(
                                "settle-delay-ms must be between 0 and {}, got {}",
                                MAX_SETTLE_DELAY_MS, ms
                            ),
                        });
                    }
                    relay.settle_delay = Duration::from_millis(ms as u64);
                }
                "listen-backlog" => {
                    relay.listen_backlog = u32_arg(child)?;
                }
                name => {
                    tracing::warn!("Unknown relay option: {}", name);
                }
            }
        }
    }

    Ok(relay)
}

fn parse_device(node: &kdl::KdlNode) -> Result<DeviceConfig, ConfigError> {
    let mut device = DeviceConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "name" => {
                    let name = string_arg(child)?;
                    if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
                        return Err(ConfigError::Invalid {
                            message: format!(
                                "device name must be 1 to {} bytes long, got {}",
                                MAX_DEVICE_NAME_LEN,
                                name.len()
                            ),
                        });
                    }
                    device.name = name.to_string();
                }
                "vendor" => device.vendor = u32_arg(child)?,
                "product" => device.product = u32_arg(child)?,
                "version" => device.version = u32_arg(child)?,
                "country" => device.country = u32_arg(child)?,
                "discovery-delay-ms" => {
                    device.discovery_delay = Duration::from_millis(u32_arg(child)? as u64);
                }
                name => {
                    tracing::warn!("Unknown device option: {}", name);
                }
            }
        }
    }

    Ok(device)
}

fn first_value<'a>(node: &'a kdl::KdlNode) -> Result<&'a kdl::KdlValue, ConfigError> {
    node.entries()
        .first()
        .map(|entry| entry.value())
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("'{}' requires a value", node.name().value()),
        })
}

fn string_arg(node: &kdl::KdlNode) -> Result<&str, ConfigError> {
    first_value(node)?
        .as_string()
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("'{}' expects a string", node.name().value()),
        })
}

fn int_arg(node: &kdl::KdlNode) -> Result<i64, ConfigError> {
    first_value(node)?
        .as_i64()
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("'{}' expects an integer", node.name().value()),
        })
}

fn u32_arg(node: &kdl::KdlNode) -> Result<u32, ConfigError> {
    let val = int_arg(node)?;
    u32::try_from(val).map_err(|_| ConfigError::Invalid {
        message: format!(
            "'{}' must fit in an unsigned 32-bit integer, got {}",
            node.name().value(),
            val
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = r#"
            log-level "debug"

            relay {
                uhid-path "/tmp/fake-uhid"
                port 5151
                settle-delay-ms 35
                listen-backlog 1
            }

            device {
                name "relay-test-keyboard"
                vendor 0x1234
                product 0xabcd
                version 2
                country 9
                discovery-delay-ms 100
            }
        "#;

        let result = parse_config_str(config).unwrap();
        assert_eq!(result.log_level, Some(LogLevel::Debug));
        assert_eq!(result.relay.uhid_path, std::path::PathBuf::from("/tmp/fake-uhid"));
        assert_eq!(result.relay.port, 5151);
        assert_eq!(result.relay.settle_delay, Duration::from_millis(35));
        assert_eq!(result.relay.listen_backlog, 1);
        assert_eq!(result.device.name, "relay-test-keyboard");
        assert_eq!(result.device.vendor, 0x1234);
        assert_eq!(result.device.product, 0xabcd);
        assert_eq!(result.device.version, 2);
        assert_eq!(result.device.country, 9);
        assert_eq!(result.device.discovery_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_relay_block_keeps_other_defaults() {
        let config = r#"
            relay {
                port 9000
            }
        "#;

        let result = parse_config_str(config).unwrap();
        assert_eq!(result.relay.port, 9000);
        assert_eq!(result.relay.uhid_path, std::path::PathBuf::from(DEFAULT_UHID_PATH));
        assert_eq!(result.relay.settle_delay, Duration::from_millis(20));
        assert_eq!(result.device, DeviceConfig::default());
    }

    #[test]
    fn test_port_zero_rejected() {
        let result = parse_config_str("relay {\n    port 0\n}");
        match result {
            Err(ConfigError::Invalid { message }) => assert!(message.contains("port")),
            other => panic!("Expected Invalid error, got: {:?}", other),
        }
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let result = parse_config_str("relay {\n    port 70000\n}");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_settle_delay_bounds() {
        assert!(parse_config_str("relay {\n    settle-delay-ms 0\n}").is_ok());
        assert!(matches!(
            parse_config_str("relay {\n    settle-delay-ms 10001\n}"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_config_str("relay {\n    settle-delay-ms -1\n}"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_device_name_length_limits() {
        let long_name = "k".repeat(MAX_DEVICE_NAME_LEN + 1);
        let config = format!("device {{\n    name \"{}\"\n}}", long_name);
        assert!(matches!(
            parse_config_str(&config),
            Err(ConfigError::Invalid { .. })
        ));

        assert!(matches!(
            parse_config_str("device {\n    name \"\"\n}"),
            Err(ConfigError::Invalid { .. })
        ));

        let max_name = "k".repeat(MAX_DEVICE_NAME_LEN);
        let config = format!("device {{\n    name \"{}\"\n}}", max_name);
        assert_eq!(parse_config_str(&config).unwrap().device.name, max_name);
    }

    #[test]
    fn test_wrong_value_type_rejected() {
        let result = parse_config_str("relay {\n    port \"4242\"\n}");
        match result {
            Err(ConfigError::Invalid { message }) => assert!(message.contains("integer")),
            other => panic!("Expected Invalid error, got: {:?}", other),
        }

        let result = parse_config_str("relay {\n    uhid-path 12\n}");
        match result {
            Err(ConfigError::Invalid { message }) => assert!(message.contains("string")),
            other => panic!("Expected Invalid error, got: {:?}", other),
        }
    }

    #[test]
    fn test_missing_value_rejected() {
        let result = parse_config_str("device {\n    vendor\n}");
        match result {
            Err(ConfigError::Invalid { message }) => assert!(message.contains("requires a value")),
            other => panic!("Expected Invalid error, got: {:?}", other),
        }
    }

    #[test]
    fn test_negative_vendor_rejected() {
        assert!(matches!(
            parse_config_str("device {\n    vendor -5\n}"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        assert!(matches!(
            parse_config_str("log-level \"chatty\""),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let config = r#"
            mouse {
                speed 3
            }
            relay {
                color "blue"
                port 4343
            }
        "#;

        let result = parse_config_str(config).unwrap();
        assert_eq!(result.relay.port, 4343);
    }

    #[test]
    fn test_malformed_kdl_reports_parse_error() {
        let result = parse_config_str("relay {\n    port 4242\n");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_parse_config_missing_file() {
        let result = parse_config(Path::new("/nonexistent/uhid-relay/config.kdl"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
