//! MessagePack messages exchanged with the page.

use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "0")]
    Toggle,

    #[serde(rename = "1")]
    Send { data: String },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Label { text: String },
    Data { text: String },
    Error { message: String },
}

impl Command {
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Event {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn map(entries: &[(&str, &str)]) -> Vec<u8> {
        let map: BTreeMap<&str, &str> = entries.iter().copied().collect();
        rmp_serde::to_vec_named(&map).unwrap()
    }

    #[test]
    fn decodes_page_commands() {
        assert_eq!(Command::decode(&map(&[("type", "0")])).unwrap(), Command::Toggle);
        assert_eq!(
            Command::decode(&map(&[("type", "1"), ("data", "D13=1\n")])).unwrap(),
            Command::Send {
                data: "D13=1\n".to_owned()
            }
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Command::decode(&map(&[("type", "9")])).is_err());
        assert!(Command::decode(b"\xc1").is_err());
    }

    #[test]
    fn events_carry_their_tag() {
        let bytes = Event::Label {
            text: "Connect".to_owned(),
        }
        .encode()
        .unwrap();
        let decoded: BTreeMap<String, String> = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded["type"], "label");
        assert_eq!(decoded["text"], "Connect");
    }
}
