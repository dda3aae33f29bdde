// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compressor spec strings: `"name:k=v:k=v"`, the way the original's
//! `option_map` parses a compressor configuration string without a bespoke
//! struct per codec.

use std::collections::BTreeMap;

/// A parsed compressor spec: a choice (the codec name) plus key/value
/// options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OptionMap {
    choice: String,
    options: BTreeMap<String, String>,
}

impl OptionMap {
    pub fn parse(spec: &str) -> Self {
        let mut parts = spec.split(':');
        let choice = parts.next().unwrap_or_default().to_string();
        let mut options = BTreeMap::new();
        for part in parts {
            if let Some((k, v)) = part.split_once('=') {
                options.insert(k.to_string(), v.to_string());
            } else if !part.is_empty() {
                options.insert(part.to_string(), String::new());
            }
        }
        OptionMap { choice, options }
    }

    pub fn choice(&self) -> &str {
        &self.choice
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_choice_and_options() {
        let om = OptionMap::parse("lzma:level=9:dict_size=24");
        assert_eq!(om.choice(), "lzma");
        assert_eq!(om.get("level"), Some("9"));
        assert_eq!(om.get_parsed::<u32>("dict_size"), Some(24));
    }

    #[test]
    fn parses_bare_choice() {
        let om = OptionMap::parse("zstd");
        assert_eq!(om.choice(), "zstd");
        assert_eq!(om.get("level"), None);
    }
}
