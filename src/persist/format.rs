//! Wire formats for the persisted configuration tree.

use crate::core::Snapshot;
use crate::error::{ConfigError, Result};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// On-disk serialization format.
///
/// YAML, JSON and TOML are feature-gated (`yaml`, `json`, `toml`); the ini-like
/// and dotenv formats are always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFormat {
    /// YAML document
    Yaml,
    /// Pretty-printed JSON
    Json,
    /// TOML document (null values are dropped)
    Toml,
    /// `key = value` lines grouped under `[dotted.section]` headers
    Ini,
    /// `SECTION__KEY=value` lines
    Dotenv,
}

impl StorageFormat {
    /// File extension used for `{path}/{name}.{ext}`.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Toml => "toml",
            Self::Ini => "ini",
            Self::Dotenv => "env",
        }
    }

    /// Short format name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Toml => "toml",
            Self::Ini => "ini",
            Self::Dotenv => "dotenv",
        }
    }

    /// Detect the format from a file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            "ini" | "cfg" | "conf" => Some(Self::Ini),
            "env" => Some(Self::Dotenv),
            _ => None,
        }
    }

    /// Detect the format from a path (`.env` files count as dotenv).
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        if path.file_name().and_then(|n| n.to_str()) == Some(".env") {
            return Some(Self::Dotenv);
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Serialize a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Format`] if the tree cannot be expressed in this
    /// format, or [`ConfigError::FeatureNotEnabled`] for a compiled-out format.
    pub fn serialize(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        match self {
            Self::Yaml => serialize_yaml(&snapshot.to_value()),
            Self::Json => serialize_json(&snapshot.to_value()),
            Self::Toml => serialize_toml(&snapshot.to_value().without_nulls()),
            Self::Ini => write_ini(snapshot.as_map()).map(String::into_bytes),
            Self::Dotenv => write_dotenv(snapshot.as_map()).map(String::into_bytes),
        }
    }

    /// Deserialize into a value tree. Empty input yields an empty mapping.
    ///
    /// Keys may come back dotted (ini sections, dotenv); pass the result through
    /// [`Snapshot::from_value`] to expand them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Format`] on malformed input.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(bytes).map_err(|e| ConfigError::format(self.name(), e))?;
        if text.trim().is_empty() {
            return Ok(Value::map());
        }
        match self {
            Self::Yaml => deserialize_yaml(text),
            Self::Json => deserialize_json(text),
            Self::Toml => deserialize_toml(text),
            Self::Ini => read_ini(text),
            Self::Dotenv => read_dotenv(text),
        }
    }
}

#[cfg(feature = "yaml")]
fn serialize_yaml(value: &Value) -> Result<Vec<u8>> {
    serde_yaml::to_string(value)
        .map(String::into_bytes)
        .map_err(|e| ConfigError::format("yaml", e))
}

#[cfg(not(feature = "yaml"))]
fn serialize_yaml(_: &Value) -> Result<Vec<u8>> {
    Err(ConfigError::FeatureNotEnabled("yaml"))
}

#[cfg(feature = "yaml")]
fn deserialize_yaml(text: &str) -> Result<Value> {
    serde_yaml::from_str(text).map_err(|e| ConfigError::format("yaml", e))
}

#[cfg(not(feature = "yaml"))]
fn deserialize_yaml(_: &str) -> Result<Value> {
    Err(ConfigError::FeatureNotEnabled("yaml"))
}

#[cfg(feature = "json")]
fn serialize_json(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| ConfigError::format("json", e))
}

#[cfg(not(feature = "json"))]
fn serialize_json(_: &Value) -> Result<Vec<u8>> {
    Err(ConfigError::FeatureNotEnabled("json"))
}

#[cfg(feature = "json")]
fn deserialize_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| ConfigError::format("json", e))
}

#[cfg(not(feature = "json"))]
fn deserialize_json(_: &str) -> Result<Value> {
    Err(ConfigError::FeatureNotEnabled("json"))
}

#[cfg(feature = "toml")]
fn serialize_toml(value: &Value) -> Result<Vec<u8>> {
    toml::to_string_pretty(value)
        .map(String::into_bytes)
        .map_err(|e| ConfigError::format("toml", e))
}

#[cfg(not(feature = "toml"))]
fn serialize_toml(_: &Value) -> Result<Vec<u8>> {
    Err(ConfigError::FeatureNotEnabled("toml"))
}

#[cfg(feature = "toml")]
fn deserialize_toml(text: &str) -> Result<Value> {
    toml::from_str(text).map_err(|e| ConfigError::format("toml", e))
}

#[cfg(not(feature = "toml"))]
fn deserialize_toml(_: &str) -> Result<Value> {
    Err(ConfigError::FeatureNotEnabled("toml"))
}

fn write_ini(root: &BTreeMap<String, Value>) -> Result<String> {
    let mut out = String::new();
    for (key, value) in root.iter().filter(|(_, v)| v.as_map().is_none()) {
        let _ = writeln!(out, "{key} = {}", encode_scalar("ini", value)?);
    }
    for (key, value) in root {
        if let Value::Map(section) = value {
            write_ini_section(&mut out, key, section)?;
        }
    }
    Ok(out)
}

fn write_ini_section(
    out: &mut String,
    name: &str,
    section: &BTreeMap<String, Value>,
) -> Result<()> {
    let scalars: Vec<_> = section.iter().filter(|(_, v)| v.as_map().is_none()).collect();
    if !scalars.is_empty() || section.is_empty() {
        let _ = writeln!(out, "\n[{name}]");
        for (key, value) in scalars {
            let _ = writeln!(out, "{key} = {}", encode_scalar("ini", value)?);
        }
    }
    for (key, value) in section {
        if let Value::Map(child) = value {
            write_ini_section(out, &format!("{name}.{key}"), child)?;
        }
    }
    Ok(())
}

fn read_ini(text: &str) -> Result<Value> {
    let mut flat = BTreeMap::new();
    let mut section = String::new();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
            if !section.is_empty() {
                flat.entry(section.clone()).or_insert_with(Value::map);
            }
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ConfigError::format("ini", format!("line {}: expected `key = value`", number + 1))
        })?;
        let key = key.trim();
        let path = if section.is_empty() {
            key.to_string()
        } else {
            format!("{section}.{key}")
        };
        flat.insert(path, decode_scalar("ini", value.trim())?);
    }
    Ok(Value::Map(flat))
}

fn write_dotenv(root: &BTreeMap<String, Value>) -> Result<String> {
    let mut lines = Vec::new();
    let mut failure = None;
    for (key, value) in root {
        value.for_each_leaf(key, &mut |path, leaf| {
            if failure.is_some() || matches!(leaf, Value::Map(_)) {
                return;
            }
            match encode_scalar("dotenv", leaf) {
                Ok(encoded) => {
                    lines.push(format!("{}={encoded}", path.replace('.', "__").to_uppercase()))
                }
                Err(e) => failure = Some(e),
            }
        });
    }
    if let Some(err) = failure {
        return Err(err);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

fn read_dotenv(text: &str) -> Result<Value> {
    let mut flat = BTreeMap::new();
    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ConfigError::format("dotenv", format!("line {}: expected `KEY=value`", number + 1))
        })?;
        let path = key.trim().to_lowercase().replace("__", ".");
        flat.insert(path, decode_scalar("dotenv", value.trim())?);
    }
    Ok(Value::Map(flat))
}

fn encode_scalar(format: &'static str, value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => format!("{f:?}"),
        Value::String(s) => quote(s),
        Value::List(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                if matches!(item, Value::List(_) | Value::Map(_)) {
                    return Err(ConfigError::format(
                        format,
                        "nested collections inside lists are not supported",
                    ));
                }
                parts.push(encode_scalar(format, item)?);
            }
            format!("[{}]", parts.join(", "))
        }
        Value::Map(_) => {
            return Err(ConfigError::format(format, "maps cannot be written as values"));
        }
    })
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn unquote(format: &'static str, s: &str) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut chars = s.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, i + 1)),
            '\\' => match chars.next().map(|(_, c)| c) {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(ConfigError::format(format, format!("unterminated string: {s}")))
}

fn decode_scalar(format: &'static str, raw: &str) -> Result<Value> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    if raw.starts_with('"') {
        let (text, end) = unquote(format, raw)?;
        if !raw[end..].trim().is_empty() {
            return Err(ConfigError::format(format, format!("trailing data after string: {raw}")));
        }
        return Ok(Value::String(text));
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return decode_list(format, inner);
    }
    Ok(match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw
            .parse::<i64>()
            .map(Value::Integer)
            .or_else(|_| raw.parse::<f64>().map(Value::Float))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    })
}

fn decode_list(format: &'static str, inner: &str) -> Result<Value> {
    let mut items = Vec::new();
    let mut rest = inner.trim();
    while !rest.is_empty() {
        let (item, remaining) = if rest.starts_with('"') {
            let (text, end) = unquote(format, rest)?;
            (Value::String(text), &rest[end..])
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            (decode_scalar(format, rest[..end].trim())?, &rest[end..])
        };
        items.push(item);
        rest = remaining.trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    Ok(Value::List(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot::from_value(Value::from_iter([
            ("name", Value::from("svc \"main\"")),
            (
                "server",
                Value::from_iter([
                    ("port", Value::from(8080)),
                    ("ratio", Value::from(1.0)),
                    ("tags", Value::from(vec!["a", "b, c"])),
                    ("tls", Value::from_iter([("enabled", true)])),
                ]),
            ),
        ]))
        .unwrap()
    }

    fn read_back(format: StorageFormat, snapshot: &Snapshot) -> Snapshot {
        let bytes = format.serialize(snapshot).unwrap();
        Snapshot::from_value(format.deserialize(&bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_ini_layout() {
        let text = String::from_utf8(StorageFormat::Ini.serialize(&sample()).unwrap()).unwrap();
        assert!(text.starts_with("name = \"svc \\\"main\\\"\"\n"));
        assert!(text.contains("[server]\nport = 8080\nratio = 1.0\n"));
        assert!(text.contains("[server.tls]\nenabled = true"));
        assert_eq!(read_back(StorageFormat::Ini, &sample()), sample());
    }

    #[test]
    fn test_dotenv_layout() {
        let text =
            String::from_utf8(StorageFormat::Dotenv.serialize(&sample()).unwrap()).unwrap();
        assert!(text.contains("SERVER__PORT=8080\n"));
        assert!(text.contains("SERVER__TLS__ENABLED=true\n"));
        assert_eq!(read_back(StorageFormat::Dotenv, &sample()), sample());
    }

    #[test]
    fn test_dotenv_accepts_export_and_comments() {
        let value = StorageFormat::Dotenv
            .deserialize(b"# comment\nexport DB__HOST=localhost\nDB__POOL=4\n")
            .unwrap();
        let snapshot = Snapshot::from_value(value).unwrap();
        assert_eq!(snapshot.get("db.host"), Some(&Value::from("localhost")));
        assert_eq!(snapshot.get("db.pool"), Some(&Value::Integer(4)));
    }

    #[test]
    fn test_malformed_ini_line() {
        let err = StorageFormat::Ini.deserialize(b"[a]\nnot a pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::Format { format: "ini", .. }));
    }

    #[test]
    fn test_empty_input_is_empty_map() {
        assert_eq!(StorageFormat::Ini.deserialize(b"  \n").unwrap(), Value::map());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml() {
        assert_eq!(read_back(StorageFormat::Yaml, &sample()), sample());
        assert!(StorageFormat::Yaml.deserialize(b"a: [1, 2").is_err());
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json() {
        assert_eq!(read_back(StorageFormat::Json, &sample()), sample());
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_toml_drops_nulls() {
        let snapshot = sample().with_value("server.unset", Value::Null).unwrap();
        let back = read_back(StorageFormat::Toml, &snapshot);
        assert!(back.get("server.unset").is_none());
        assert_eq!(back, sample());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(StorageFormat::from_path("a/b.yml"), Some(StorageFormat::Yaml));
        assert_eq!(StorageFormat::from_path("a/.env"), Some(StorageFormat::Dotenv));
        assert_eq!(StorageFormat::from_path("a/b.conf"), Some(StorageFormat::Ini));
        assert_eq!(StorageFormat::from_path("a/b.txt"), None);
    }
}
