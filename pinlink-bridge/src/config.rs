use anyhow::Context;
use pinlink::PortSelector;

const BIND_ADDRESS: &str = "0.0.0.0:39027";

#[derive(Debug)]
pub struct Config {
    pub bind_address: String,
    pub selector: PortSelector,
}

impl Config {
    /// `PINLINK_BIND` overrides the listen address. `PINLINK_PORT` names a
    /// serial device, `PINLINK_USB` (`VID:PID`, hex) picks one by USB id;
    /// without either the first USB serial device is used.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_address = var("PINLINK_BIND").unwrap_or_else(|| BIND_ADDRESS.to_owned());

        let selector = match (var("PINLINK_PORT"), var("PINLINK_USB")) {
            (Some(port_name), _) => PortSelector::Named(port_name),
            (None, Some(id)) => {
                parse_usb_id(&id).with_context(|| format!("invalid PINLINK_USB `{id}`"))?
            }
            (None, None) => PortSelector::FirstAvailable,
        };

        Ok(Self {
            bind_address,
            selector,
        })
    }
}

fn parse_usb_id(id: &str) -> anyhow::Result<PortSelector> {
    let (vid, pid) = id.split_once(':').context("expected VID:PID")?;
    Ok(PortSelector::Usb {
        vid: u16::from_str_radix(vid.trim(), 16)?,
        pid: u16::from_str_radix(pid.trim(), 16)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:39027");
        assert_eq!(config.selector, PortSelector::FirstAvailable);
    }

    #[test]
    fn named_port_wins_over_usb_id() {
        let config = config(&[("PINLINK_PORT", "/dev/ttyACM0"), ("PINLINK_USB", "2341:0043")]).unwrap();
        assert_eq!(config.selector, PortSelector::Named("/dev/ttyACM0".to_owned()));
    }

    #[test]
    fn usb_id_is_hex() {
        let config = config(&[("PINLINK_USB", "2341:0043"), ("PINLINK_BIND", "127.0.0.1:8080")]).unwrap();
        assert_eq!(
            config.selector,
            PortSelector::Usb {
                vid: 0x2341,
                pid: 0x0043
            }
        );
        assert_eq!(config.bind_address, "127.0.0.1:8080");
    }

    #[test]
    fn malformed_usb_id_is_an_error() {
        assert!(config(&[("PINLINK_USB", "2341")]).is_err());
        assert!(config(&[("PINLINK_USB", "zz:0043")]).is_err());
    }
}
