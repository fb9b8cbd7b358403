//! Buffer library configuration and the key-list compiler.
//!
//! The configuration is a map of list name to buffer name to [`BufferSpec`]:
//!
//! ```toml
//! [geds."ch{key:0>3}"]
//! key_list = [[0, 2], 7]
//! out_stream = "$DATADIR/{file_key}_geds.lh5:/raw"
//!
//! ["*"."{name}"]
//! key_list = ["*"]
//! out_stream = "$DATADIR/{file_key}_{name}.lh5"
//! ```
//!
//! Shorthands are expanded in a fixed order:
//!
//! 1. every two-integer entry `[a, b]` in a key list becomes `a..=b`
//! 2. a buffer name containing `{key` yields one buffer per key
//! 3. `out_stream` and `out_name` are formatted with the caller's keywords
//!    plus `key` (singleton key lists) and `name` (the buffer name)
//! 4. `$VAR` and `${VAR}` in `out_stream` are replaced from the environment
//!
//! A key list of exactly `["*"]` defers steps 2 and 3 until the decoder's key
//! groups are known (see [`RawBufferLibrary::resolve_wildcards`]).

use crate::buffer::{RawBuffer, RawBufferLibrary, RawBufferList, WILDCARD_LIST};
use anyhow::{Context, Result};
use daq_core::{settings::merge_file, BufferKey, ConfigError};
use figment::Figment;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use strfmt::{strfmt, FmtError};
use tracing::{debug, info};

/// Keyword values substituted into templates.
pub type Keywords = HashMap<String, String>;

// =============================================================================
// Configuration Model
// =============================================================================

/// One entry of a `key_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyEntry {
    Id(i64),
    /// `[first, last]`, inclusive.
    Range(Vec<i64>),
    /// `{ summary = <stream id> }`
    Summary { summary: u32 },
    /// `"*"` or a free-form name.
    Name(String),
}

/// Settings of one named buffer (or buffer family, before fan-out).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    #[serde(default)]
    pub key_list: Option<Vec<KeyEntry>>,
    #[serde(default)]
    pub out_stream: String,
    #[serde(default)]
    pub out_name: Option<String>,
    #[serde(default)]
    pub proc_spec: Option<Value>,
}

/// A map that keeps the order entries were read in.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn insert(&mut self, name: impl Into<String>, value: V) {
        self.0.push((name.into(), value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<'de, V: DeserializeOwned> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: DeserializeOwned> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = OrderedMap::default();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// Buffers of one list by name.
pub type ListConfig = OrderedMap<BufferSpec>;

/// Lists by decoder name.
pub type LibraryConfig = OrderedMap<ListConfig>;

/// Load a library configuration (TOML, JSON or YAML by extension).
pub fn load_library_config(path: &Path) -> Result<LibraryConfig> {
    debug!(path = %path.display(), "Loading buffer library config");
    let figment = merge_file(Figment::new(), path)?;
    figment
        .extract()
        .with_context(|| format!("Failed to parse buffer library config: {}", path.display()))
}

// =============================================================================
// Expansion
// =============================================================================

/// Templates kept on a buffer whose key list is still `["*"]`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BufferTemplate {
    pub name: String,
    pub out_stream: String,
    pub out_name: Option<String>,
    pub keywords: Keywords,
}

/// Build every list of a library configuration.
pub fn build_library(config: &LibraryConfig, keywords: &Keywords) -> Result<RawBufferLibrary, ConfigError> {
    let mut library = RawBufferLibrary::new();
    for (list_name, list_config) in config.iter() {
        library.insert(expand_list_config(list_name, list_config, keywords)?);
    }
    info!(lists = library.names().count(), "Built buffer library");
    Ok(library)
}

/// Compile one list configuration into a [`RawBufferList`].
pub fn expand_list_config(
    list_name: &str,
    config: &ListConfig,
    keywords: &Keywords,
) -> Result<RawBufferList, ConfigError> {
    let mut buffers = Vec::new();
    for (name, spec) in config.iter() {
        if name.is_empty() {
            return Err(ConfigError::EmptyBufferName {
                list: list_name.to_string(),
            });
        }
        let entries = spec.key_list.as_ref().ok_or_else(|| ConfigError::MissingKeyList {
            list: list_name.to_string(),
            buffer: name.to_string(),
        })?;
        let keys = expand_key_list(list_name, name, entries)?;

        if is_wildcard(&keys) {
            buffers.push(deferred_buffer(name, spec, keywords));
        } else if name.contains("{key") {
            for key in keys {
                let mut kw = keywords.clone();
                kw.insert("key".to_string(), key.to_string());
                let expanded = format_template(name, &kw)?;
                buffers.push(finalize(&expanded, vec![key], spec, keywords)?);
            }
        } else {
            buffers.push(finalize(name, keys, spec, keywords)?);
        }
    }
    debug!(list = list_name, buffers = buffers.len(), "Expanded buffer list");
    RawBufferList::new(list_name, buffers)
}

fn expand_key_list(list: &str, buffer: &str, entries: &[KeyEntry]) -> Result<Vec<BufferKey>, ConfigError> {
    let invalid = |key: String| ConfigError::InvalidKey {
        list: list.to_string(),
        buffer: buffer.to_string(),
        key,
    };
    let mut keys = Vec::new();
    for entry in entries {
        match entry {
            KeyEntry::Id(id) => {
                keys.push(BufferKey::Id(u64::try_from(*id).map_err(|_| invalid(id.to_string()))?));
            }
            KeyEntry::Range(bounds) => {
                let &[start, end] = bounds.as_slice() else {
                    return Err(invalid(format!("{:?}", bounds)));
                };
                if start > end || start < 0 {
                    return Err(ConfigError::MalformedRange {
                        list: list.to_string(),
                        buffer: buffer.to_string(),
                        start,
                        end,
                    });
                }
                keys.extend((start as u64..=end as u64).map(BufferKey::Id));
            }
            KeyEntry::Summary { summary } => keys.push(BufferKey::Summary(*summary)),
            KeyEntry::Name(name) => keys.push(BufferKey::from(name.as_str())),
        }
    }
    Ok(keys)
}

fn is_wildcard(keys: &[BufferKey]) -> bool {
    keys.len() == 1 && keys[0].is_any()
}

fn deferred_buffer(name: &str, spec: &BufferSpec, keywords: &Keywords) -> RawBuffer {
    let mut buffer = RawBuffer::new(
        vec![BufferKey::Any],
        spec.out_stream.clone(),
        spec.out_name.clone().unwrap_or_else(|| name.to_string()),
    );
    buffer.proc_spec = spec.proc_spec.clone();
    buffer.template = Some(BufferTemplate {
        name: name.to_string(),
        out_stream: spec.out_stream.clone(),
        out_name: spec.out_name.clone(),
        keywords: keywords.clone(),
    });
    buffer
}

/// Format the output routing of a buffer whose keys are known.
fn finalize(
    name: &str,
    keys: Vec<BufferKey>,
    spec: &BufferSpec,
    keywords: &Keywords,
) -> Result<RawBuffer, ConfigError> {
    let mut kw = keywords.clone();
    if let [key] = keys.as_slice() {
        kw.insert("key".to_string(), key.to_string());
    }
    if name != WILDCARD_LIST {
        kw.insert("name".to_string(), name.to_string());
    }
    let out_stream = expand_env(&format_template(&escape_env_braces(&spec.out_stream), &kw)?);
    let out_name = match &spec.out_name {
        Some(template) => format_template(template, &kw)?,
        None => name.to_string(),
    };
    let mut buffer = RawBuffer::new(keys, out_stream, out_name);
    buffer.proc_spec = spec.proc_spec.clone();
    Ok(buffer)
}

/// Copy a buffer of the `"*"` list for `decoder`, replacing `{name}`.
pub(crate) fn bind_list_name(mut buffer: RawBuffer, decoder: &str) -> RawBuffer {
    let bind = |s: &str| s.replace("{name}", decoder);
    buffer.out_stream = bind(&buffer.out_stream);
    buffer.out_name = bind(&buffer.out_name);
    if let Some(template) = buffer.template.as_mut() {
        template.name = bind(&template.name);
        template.out_stream = bind(&template.out_stream);
        template.out_name = template.out_name.as_deref().map(bind);
    }
    buffer
}

/// Replace a `["*"]` key list with a decoder's keys.
pub(crate) fn bind_keys(
    buffer: RawBuffer,
    decoder: &str,
    groups: &[Vec<BufferKey>],
) -> Result<Vec<RawBuffer>, ConfigError> {
    let template = buffer.template.clone().unwrap_or_else(|| BufferTemplate {
        name: buffer.out_name.clone(),
        out_stream: buffer.out_stream.clone(),
        out_name: None,
        keywords: Keywords::new(),
    });
    let spec = BufferSpec {
        key_list: None,
        out_stream: template.out_stream.clone(),
        out_name: template.out_name.clone(),
        proc_spec: buffer.proc_spec.clone(),
    };

    if template.name.contains("{key") {
        let mut buffers = Vec::new();
        for key in groups.iter().flatten() {
            let mut kw = template.keywords.clone();
            kw.insert("key".to_string(), key.to_string());
            let expanded = format_template(&template.name, &kw)?;
            buffers.push(finalize(&expanded, vec![key.clone()], &spec, &template.keywords)?);
        }
        return Ok(buffers);
    }

    match groups {
        [group] => Ok(vec![finalize(&template.name, group.clone(), &spec, &template.keywords)?]),
        _ => Err(ConfigError::KeysSpanGroups {
            decoder: decoder.to_string(),
            buffer: template.name,
        }),
    }
}

/// `strfmt` with errors mapped onto [`ConfigError`].
pub fn format_template(template: &str, keywords: &Keywords) -> Result<String, ConfigError> {
    strfmt(template, keywords).map_err(|e| match e {
        FmtError::KeyError(msg) => ConfigError::MissingKeyword {
            template: template.to_string(),
            keyword: msg.trim_start_matches("Invalid key: ").to_string(),
        },
        FmtError::Invalid(msg) | FmtError::TypeError(msg) => ConfigError::Template {
            template: template.to_string(),
            reason: msg,
        },
    })
}

#[allow(clippy::expect_used)]
static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("environment variable pattern is valid")
});

#[allow(clippy::expect_used)]
static BRACED_ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("environment variable pattern is valid")
});

/// Double the braces of `${VAR}` so keyword formatting leaves it intact.
fn escape_env_braces(template: &str) -> String {
    BRACED_ENV_VAR
        .replace_all(template, |caps: &Captures| ["${{", &caps[1], "}}"].concat())
        .into_owned()
}

/// Replace `$VAR` and `${VAR}` from the environment; unknown variables stay as written.
pub fn expand_env(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SchemaSource;
    use crate::schema::{FieldSpec, Schema};
    use daq_core::{DType, SchemaError};
    use serial_test::serial;

    fn list_from_json(json: &str) -> ListConfig {
        serde_json::from_str(json).unwrap()
    }

    fn kw(pairs: &[(&str, &str)]) -> Keywords {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_range_expansion() {
        let config = list_from_json(r#"{"geds": {"key_list": [[0, 3], 7], "out_stream": "f.lh5"}}"#);
        let list = expand_list_config("dec", &config, &Keywords::new()).unwrap();
        let buffer = list.iter().next().unwrap();
        assert_eq!(
            buffer.key_list,
            [0, 1, 2, 3, 7].map(BufferKey::Id).to_vec()
        );
        assert_eq!(buffer.out_name, "geds");
    }

    #[test]
    fn test_malformed_range() {
        let config = list_from_json(r#"{"geds": {"key_list": [[5, 2]]}}"#);
        assert!(matches!(
            expand_list_config("dec", &config, &Keywords::new()),
            Err(ConfigError::MalformedRange { start: 5, end: 2, .. })
        ));
    }

    #[test]
    fn test_key_fan_out_with_format_spec() {
        let config = list_from_json(
            r#"{"ch{key:0>3}": {"key_list": [[1, 3]], "out_stream": "{file_key}_{name}.lh5:/ch{key}"}}"#,
        );
        let list = expand_list_config("dec", &config, &kw(&[("file_key", "run0")])).unwrap();
        let names: Vec<&str> = list.iter().map(|b| b.out_name.as_str()).collect();
        assert_eq!(names, vec!["ch001", "ch002", "ch003"]);
        let ch2 = list.buffer_for(&BufferKey::Id(2)).unwrap();
        assert_eq!(ch2.key_list, vec![BufferKey::Id(2)]);
        assert_eq!(ch2.out_stream, "run0_ch002.lh5:/ch2");
    }

    #[test]
    fn test_missing_keyword_is_an_error() {
        let config = list_from_json(r#"{"a": {"key_list": [1], "out_stream": "{nope}.lh5"}}"#);
        assert!(matches!(
            expand_list_config("dec", &config, &Keywords::new()),
            Err(ConfigError::MissingKeyword { .. })
        ));
    }

    #[test]
    fn test_empty_name_and_missing_key_list() {
        let empty = list_from_json(r#"{"": {"key_list": [1]}}"#);
        assert!(matches!(
            expand_list_config("dec", &empty, &Keywords::new()),
            Err(ConfigError::EmptyBufferName { .. })
        ));
        let missing = list_from_json(r#"{"a": {"out_stream": "x"}}"#);
        assert!(matches!(
            expand_list_config("dec", &missing, &Keywords::new()),
            Err(ConfigError::MissingKeyList { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_environment_expanded_after_keywords() {
        std::env::set_var("DAQ_TEST_DATADIR", "/data");
        let config = list_from_json(
            r#"{"a": {"key_list": [1], "out_stream": "${DAQ_TEST_DATADIR}/{dir}/$DAQ_TEST_UNSET_VAR.lh5"}}"#,
        );
        let list = expand_list_config("dec", &config, &kw(&[("dir", "$DAQ_TEST_DATADIR")]));
        std::env::remove_var("DAQ_TEST_DATADIR");
        let list = list.unwrap();
        assert_eq!(
            list.iter().next().unwrap().out_stream,
            "/data//data/$DAQ_TEST_UNSET_VAR.lh5"
        );
    }

    #[test]
    fn test_duplicate_key_across_buffers() {
        let config = list_from_json(r#"{"a": {"key_list": [[0, 4]]}, "b": {"key_list": [4]}}"#);
        assert!(matches!(
            expand_list_config("dec", &config, &Keywords::new()),
            Err(ConfigError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_summary_and_named_keys() {
        let config = list_from_json(
            r#"{"fsp": {"key_list": [{"summary": 3}]}, "aux": {"key_list": ["pulser"]}}"#,
        );
        let list = expand_list_config("dec", &config, &Keywords::new()).unwrap();
        assert_eq!(list.buffer_for(&BufferKey::Summary(3)).unwrap().out_name, "fsp");
        assert_eq!(
            list.buffer_for(&BufferKey::Name("pulser".into())).unwrap().out_name,
            "aux"
        );
    }

    struct Channels;

    impl SchemaSource for Channels {
        fn name(&self) -> &str {
            "llama_event"
        }

        fn key_groups(&self) -> Vec<Vec<BufferKey>> {
            vec![vec![BufferKey::Id(16), BufferKey::Id(17)]]
        }

        fn schema(&self, _key: &BufferKey) -> Result<Schema, SchemaError> {
            Ok(Schema::new().with_field("packet_id", FieldSpec::scalar(DType::U32)))
        }
    }

    #[test]
    fn test_wildcard_keys_resolve_against_key_groups() {
        let config: LibraryConfig = serde_json::from_str(
            r#"{"*": {"{name}": {"key_list": ["*"], "out_stream": "{file_key}_{name}.lh5"}},
                "llama_event": {"ch{key}": {"key_list": ["*"], "out_stream": "{file_key}.lh5:/ch{key}"}}}"#,
        )
        .unwrap();
        let mut library = build_library(&config, &kw(&[("file_key", "r1")])).unwrap();
        library.resolve_wildcards(&Channels).unwrap();
        let list = library.get("llama_event").unwrap();
        assert_eq!(list.len(), 2);
        let ch17 = list.buffer_for(&BufferKey::Id(17)).unwrap();
        assert_eq!(ch17.out_name, "ch17");
        assert_eq!(ch17.out_stream, "r1.lh5:/ch17");

        // The "*" list is copied for a decoder without its own list.
        struct Other;
        impl SchemaSource for Other {
            fn name(&self) -> &str {
                "fc_status"
            }
            fn schema(&self, _key: &BufferKey) -> Result<Schema, SchemaError> {
                Ok(Schema::new())
            }
        }
        library.resolve_wildcards(&Other).unwrap();
        let status = library.get("fc_status").unwrap();
        assert_eq!(status.name(), "fc_status");
        let buffer = status.iter().next().unwrap();
        assert_eq!(buffer.out_stream, "r1_fc_status.lh5");
        assert_eq!(buffer.out_name, "fc_status");
    }

    #[test]
    fn test_load_library_config_from_toml() {
        use std::io::Write;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[geds.\"ch{{key}}\"]\nkey_list = [[0, 1]]\nout_stream = \"out.lh5\"\n"
        )
        .unwrap();
        let config = load_library_config(file.path()).unwrap();
        let library = build_library(&config, &Keywords::new()).unwrap();
        let geds = library.get("geds").unwrap();
        assert_eq!(geds.len(), 2);
        assert_eq!(geds.buffer_for(&BufferKey::Id(1)).unwrap().out_name, "ch1");
    }
}
