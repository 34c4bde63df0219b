//! Connection descriptors and the settings merge.
//!
//! Effective settings are built from three layers, lowest precedence first:
//! the protocol's default settings, the settings carried in the encrypted
//! token, and the allow-listed subset of the request's query parameters.

use crate::error::{GatewayError, GatewayResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

/// A single connection setting: either a scalar or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Text(String),
    List(Vec<String>),
}

/// Setting name to value, ordered for deterministic output.
pub type Settings = BTreeMap<String, SettingValue>;

impl SettingValue {
    /// The value as sent on the wire. Lists are joined with `,`.
    pub fn as_wire(&self) -> Cow<'_, str> {
        match self {
            SettingValue::Text(s) => Cow::Borrowed(s),
            SettingValue::List(items) => Cow::Owned(items.join(",")),
        }
    }

    /// The value as a list. A scalar is split on `,`, dropping empty items.
    pub fn as_list(&self) -> Vec<&str> {
        match self {
            SettingValue::Text(s) => s.split(',').filter(|s| !s.is_empty()).collect(),
            SettingValue::List(items) => items.iter().map(String::as_str).collect(),
        }
    }

    fn from_json(value: serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| scalar(item).ok_or_else(|| "nested lists are not supported".to_string()))
                .collect::<Result<Vec<_>, _>>()
                .map(SettingValue::List),
            other => scalar(other)
                .map(SettingValue::Text)
                .ok_or_else(|| "objects are not valid setting values".to_string()),
        }
    }
}

fn scalar(value: serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s),
        Value::Array(_) | Value::Object(_) => None,
    }
}

impl<'de> Deserialize<'de> for SettingValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        SettingValue::from_json(value).map_err(D::Error::custom)
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::Text(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        SettingValue::Text(s)
    }
}

/// The decrypted payload of a connection token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    /// Backend protocol name, e.g. `rdp` or `ssh`.
    pub connection_type: String,
    #[serde(default)]
    pub connection_settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_folder: Option<String>,
}

/// Merge the three settings layers. Query parameters whose name is not in
/// `allow_list` are dropped; a repeated parameter keeps its last value.
pub fn merge(
    defaults: &Settings,
    descriptor_settings: &Settings,
    query: &[(String, String)],
    allow_list: &BTreeSet<String>,
) -> Settings {
    let mut merged = defaults.clone();
    merged.extend(
        descriptor_settings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    for (name, value) in query {
        if allow_list.contains(name) {
            merged.insert(name.clone(), SettingValue::Text(value.clone()));
        }
    }
    merged
}

/// Per-protocol default settings and query-parameter allow-lists.
///
/// Both tables are keyed by connection type. A type missing from either one
/// is rejected rather than served with a generic profile.
#[derive(Debug, Clone, Default)]
pub struct ProtocolTable {
    pub defaults: BTreeMap<String, Settings>,
    pub allowed: BTreeMap<String, BTreeSet<String>>,
}

impl ProtocolTable {
    /// Register (or replace) one protocol's profile.
    pub fn insert(
        &mut self,
        connection_type: impl Into<String>,
        defaults: Settings,
        allowed: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let connection_type = connection_type.into();
        self.defaults.insert(connection_type.clone(), defaults);
        self.allowed
            .insert(connection_type, allowed.into_iter().map(Into::into).collect());
    }

    /// Profiles for `rdp`, `vnc`, `ssh` and `telnet`.
    pub fn builtin() -> Self {
        let display = ["width", "height", "dpi"];
        let terminal = ["color-scheme", "font-name", "font-size", "width", "height", "dpi"];

        let mut table = Self::default();
        table.insert("rdp", display_defaults("3389"), display);
        table.insert("vnc", display_defaults("5900"), display);
        table.insert("ssh", display_defaults("22"), terminal);
        table.insert("telnet", display_defaults("23"), terminal);
        table
    }

    pub fn supports(&self, connection_type: &str) -> bool {
        self.defaults.contains_key(connection_type) && self.allowed.contains_key(connection_type)
    }

    /// Compute the effective settings for a session.
    pub fn merge(
        &self,
        connection_type: &str,
        descriptor_settings: &Settings,
        query: &[(String, String)],
    ) -> GatewayResult<Settings> {
        let unsupported = || GatewayError::UnsupportedProtocol(connection_type.to_string());
        let defaults = self.defaults.get(connection_type).ok_or_else(unsupported)?;
        let allow_list = self.allowed.get(connection_type).ok_or_else(unsupported)?;
        Ok(merge(defaults, descriptor_settings, query, allow_list))
    }
}

fn display_defaults(port: &str) -> Settings {
    [
        ("port", port),
        ("width", "1024"),
        ("height", "768"),
        ("dpi", "96"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), SettingValue::from(v)))
    .collect()
}
