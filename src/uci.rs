//! # UCI Collaborator Contract
//!
//! Service managers built on top of [`crate::transport::Transport`] tend to
//! reuse three shapes: a dialect hook for hardware-varying argument
//! layouts, a Package → Section → Option builder chain over the `uci`
//! ubus object, and a permissive decoder for `uci.get`'s three response
//! shapes. This module implements the plumbing generically; it
//! does not ship concrete managers like `system.info` or
//! `network.interface`; those are call sites a caller builds on top of
//! [`Transport::call`] directly.

use std::collections::BTreeMap;

use crate::error::ErrorKind;
use crate::transport::{Args, Transport};
use crate::value::Value;

const UCI_SERVICE: &str = "uci";

/// Transforms a caller's request record into the wire argument tree for
/// one method call. Hardware profiles disagree on shapes for a handful of
/// ubus methods (e.g. whether a MAC address is a JSON array or a single
/// string); a manager takes a `Dialect` so callers can swap profiles
/// without the manager itself branching on hardware.
pub trait Dialect: Send + Sync {
    fn encode_args(&self, method: &str, request: &Value) -> Value;
}

/// The identity dialect: passes the request through unchanged. Correct
/// for any method that does not vary by hardware profile.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDialect;

impl Dialect for IdentityDialect {
    fn encode_args(&self, _method: &str, request: &Value) -> Value {
        request.clone()
    }
}

/// Metadata ubus attaches to a UCI section, surfaced from the `.`-prefixed
/// keys in a `uci.get` response. `index` is
/// only populated for whole-package queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UciMeta {
    pub name: Option<String>,
    pub type_: Option<String>,
    pub anonymous: Option<bool>,
    pub index: Option<i64>,
}

/// The decoded shape of a `uci.get` response, probed in this order: a bare
/// scalar (single option), a flat option table (single section), or a
/// table of sections (whole package).
#[derive(Debug, Clone, PartialEq)]
pub enum UciGet {
    Scalar(String),
    Section { options: BTreeMap<String, Value>, meta: UciMeta },
    Package(BTreeMap<String, (BTreeMap<String, Value>, UciMeta)>),
}

fn split_meta(map: &BTreeMap<String, Value>) -> (BTreeMap<String, Value>, UciMeta) {
    let mut options = BTreeMap::new();
    let mut meta = UciMeta::default();
    for (key, value) in map {
        match key.as_str() {
            ".name" => meta.name = as_string(value),
            ".type" => meta.type_ = as_string(value),
            ".anonymous" => meta.anonymous = Some(crate::bool::decode_bool(&value.to_json())),
            ".index" => meta.index = as_i64(value),
            _ => {
                options.insert(key.clone(), value.clone());
            }
        }
    }
    (options, meta)
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int64(i) => Some(*i),
        Value::Int32(i) => Some(*i as i64),
        Value::Int16(i) => Some(*i as i64),
        Value::Int8(i) => Some(*i as i64),
        _ => None,
    }
}

/// A table looks like a whole-package response when every member is
/// itself a table carrying a `.type` entry (the section-type tag every
/// UCI section has); a single-section response is a flat option table.
fn looks_like_package(map: &BTreeMap<String, Value>) -> bool {
    !map.is_empty() && map.values().all(|v| matches!(v, Value::Table(inner) if inner.contains_key(".type")))
}

fn decode_uci_get(value: &Value) -> Result<UciGet, ErrorKind> {
    match value {
        Value::String(s) => Ok(UciGet::Scalar(s.clone())),
        Value::Table(map) if looks_like_package(map) => {
            let mut sections = BTreeMap::new();
            for (name, section) in map {
                let Value::Table(section_map) = section else {
                    return Err(ErrorKind::InvalidResponse);
                };
                sections.insert(name.clone(), split_meta(section_map));
            }
            Ok(UciGet::Package(sections))
        }
        Value::Table(map) => {
            let (options, meta) = split_meta(map);
            Ok(UciGet::Section { options, meta })
        }
        _ => Err(ErrorKind::InvalidResponse),
    }
}

/// Space-separated list encoding UCI uses for multi-value options.
fn split_list(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

fn join_list(values: &[String]) -> String {
    values.join(" ")
}

/// Entry point for the UCI builder chain. Borrows the transport for the
/// lifetime of the chain; every terminal operation issues one or more
/// `uci.*` calls against it.
pub struct UciClient<'t> {
    transport: &'t dyn Transport,
}

impl<'t> UciClient<'t> {
    pub fn new(transport: &'t dyn Transport) -> Self {
        Self { transport }
    }

    pub fn package(&self, name: impl Into<String>) -> PackageContext<'t> {
        PackageContext { transport: self.transport, package: name.into() }
    }
}

pub struct PackageContext<'t> {
    transport: &'t dyn Transport,
    package: String,
}

impl<'t> PackageContext<'t> {
    pub fn section(&self, name: impl Into<String>) -> SectionContext<'t> {
        SectionContext { transport: self.transport, package: self.package.clone(), section: name.into() }
    }

    /// Fetch every section in the package (`uci.get` with no `section`).
    pub async fn get(&self) -> anyhow::Result<UciGet> {
        let args = serde_json::json!({ "config": self.package });
        let result = self.transport.call(UCI_SERVICE, "get", Args::from(args)).await?;
        get_value_field(&result)
    }

    pub async fn commit(&self) -> anyhow::Result<()> {
        let args = serde_json::json!({ "config": self.package });
        let result = self.transport.call(UCI_SERVICE, "commit", Args::from(args)).await?;
        ok_or_no_data(&result)
    }

    pub async fn revert(&self) -> anyhow::Result<()> {
        let args = serde_json::json!({ "config": self.package });
        let result = self.transport.call(UCI_SERVICE, "revert", Args::from(args)).await?;
        ok_or_no_data(&result)
    }
}

pub struct SectionContext<'t> {
    transport: &'t dyn Transport,
    package: String,
    section: String,
}

impl<'t> SectionContext<'t> {
    pub fn option(&self, name: impl Into<String>) -> OptionContext<'t> {
        OptionContext {
            transport: self.transport,
            package: self.package.clone(),
            section: self.section.clone(),
            option: name.into(),
        }
    }

    pub async fn get(&self) -> anyhow::Result<UciGet> {
        let args = serde_json::json!({ "config": self.package, "section": self.section });
        let result = self.transport.call(UCI_SERVICE, "get", Args::from(args)).await?;
        get_value_field(&result)
    }

    pub async fn delete(&self) -> anyhow::Result<()> {
        let args = serde_json::json!({ "config": self.package, "section": self.section });
        let result = self.transport.call(UCI_SERVICE, "delete", Args::from(args)).await?;
        ok_or_no_data(&result)
    }
}

pub struct OptionContext<'t> {
    transport: &'t dyn Transport,
    package: String,
    section: String,
    option: String,
}

impl<'t> OptionContext<'t> {
    pub async fn get(&self) -> anyhow::Result<UciGet> {
        let args = serde_json::json!({ "config": self.package, "section": self.section, "option": self.option });
        let result = self.transport.call(UCI_SERVICE, "get", Args::from(args)).await?;
        get_value_field(&result)
    }

    pub async fn set(&self, value: impl Into<String>) -> anyhow::Result<()> {
        let mut values = serde_json::Map::new();
        values.insert(self.option.clone(), serde_json::Value::String(value.into()));
        let args = serde_json::json!({
            "config": self.package,
            "section": self.section,
            "values": values,
        });
        let result = self.transport.call(UCI_SERVICE, "set", Args::from(args)).await?;
        ok_or_no_data(&result)
    }

    pub async fn delete(&self) -> anyhow::Result<()> {
        let args = serde_json::json!({
            "config": self.package,
            "section": self.section,
            "options": [self.option.clone()],
        });
        let result = self.transport.call(UCI_SERVICE, "delete", Args::from(args)).await?;
        ok_or_no_data(&result)
    }

    /// Read-modify-write: append `value` to the option's space-separated
    /// list. An absent option is treated as an empty list, not an error.
    pub async fn add_to_list(&self, value: impl AsRef<str>) -> anyhow::Result<()> {
        let mut current = self.current_list().await?;
        let value = value.as_ref().to_string();
        if !current.contains(&value) {
            current.push(value);
        }
        self.set(join_list(&current)).await
    }

    /// Read-modify-write: remove `value` from the option's list. Absent
    /// option or absent value is a no-op.
    pub async fn delete_from_list(&self, value: impl AsRef<str>) -> anyhow::Result<()> {
        let mut current = match self.current_list_if_present().await? {
            Some(list) => list,
            None => return Ok(()),
        };
        let before = current.len();
        current.retain(|v| v != value.as_ref());
        if current.len() == before {
            return Ok(());
        }
        self.set(join_list(&current)).await
    }

    async fn current_list_if_present(&self) -> anyhow::Result<Option<Vec<String>>> {
        match self.get().await {
            Ok(UciGet::Scalar(s)) => Ok(Some(split_list(&s))),
            Ok(UciGet::Section { options, .. }) => match options.get(&self.option) {
                Some(Value::String(s)) => Ok(Some(split_list(s))),
                _ => Ok(None),
            },
            Err(e) if crate::error::is_not_found(&e) || crate::error::is_no_data(&e) => Ok(None),
            Err(e) => Err(e),
            Ok(UciGet::Package(_)) => Err(ErrorKind::InvalidResponse.wrap("expected an option value, got a whole package")),
        }
    }

    async fn current_list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.current_list_if_present().await?.unwrap_or_default())
    }
}

/// `uci.get` wraps its payload in a `value` key for a scalar option and a
/// `values` key for a section or whole-package query, the "`Value` xor
/// `Values`" shape the decoder must probe for.
fn get_value_field(result: &crate::result::UbusResult) -> anyhow::Result<UciGet> {
    let json: serde_json::Value = result.unmarshal()?;
    let value = json.get("value").or_else(|| json.get("values")).cloned().unwrap_or_else(|| json.clone());
    let value = Value::from_json(&value).map_err(|k| k.wrap("decoding uci.get response"))?;
    decode_uci_get(&value).map_err(|k| k.wrap("decoding uci.get response"))
}

fn ok_or_no_data(result: &crate::result::UbusResult) -> anyhow::Result<()> {
    match result.unmarshal::<serde_json::Value>() {
        Ok(_) => Ok(()),
        Err(e) if crate::result::is_success_or_no_data(&e) => Ok(()),
        Err(e) => Err(e),
    }
}
