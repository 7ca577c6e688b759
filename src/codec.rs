//! Value encoding pipeline.
//!
//! ```text
//! write:  Value ──JsonStage::serialize──> String ──obfuscator.encode──> stored
//! read:   stored ──obfuscator.decode──> String ──JsonStage::deserialize──> Value
//! ```
//!
//! Each stage is optional per call. The obfuscation stage is a [`Codec`] trait object,
//! so a real cipher can replace [`Base64Codec`] without touching the rest of the store.
//! Base64 is a reversible transform, not confidentiality.

use crate::error::CodecError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A reversible string-to-string stage.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Transforms a plain string into its stored form.
    fn encode(&self, input: &str) -> Result<String, CodecError>;

    /// Inverts [`encode`](Self::encode).
    fn decode(&self, input: &str) -> Result<String, CodecError>;
}

/// Standard-alphabet base64 over the UTF-8 bytes of the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Codec;

impl Codec for Base64Codec {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn encode(&self, input: &str) -> Result<String, CodecError> {
        Ok(STANDARD.encode(input.as_bytes()))
    }

    fn decode(&self, input: &str) -> Result<String, CodecError> {
        let bytes = STANDARD.decode(input.as_bytes())?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// JSON (de)serialization stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStage;

impl JsonStage {
    /// Serializes `value`. Without `stringify`, strings are stored verbatim and other
    /// values as their JSON text.
    pub fn serialize(value: &Value, stringify: bool) -> Result<String, CodecError> {
        if stringify {
            return Ok(serde_json::to_string(value)?);
        }
        Ok(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Parses `raw` as JSON when `parse` is set. Text that is not JSON comes back as a
    /// string value rather than an error.
    pub fn deserialize(raw: String, parse: bool) -> Value {
        if !parse {
            return Value::String(raw);
        }
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Stored value is not JSON, returning raw string");
                Value::String(raw)
            }
        }
    }
}

/// The ordered encode/decode pipeline of a store.
#[derive(Debug, Clone)]
pub struct CodecPipeline {
    obfuscator: Arc<dyn Codec>,
}

impl Default for CodecPipeline {
    fn default() -> Self {
        Self::new(Base64Codec)
    }
}

impl CodecPipeline {
    /// Builds a pipeline whose obfuscation stage is `obfuscator`.
    pub fn new(obfuscator: impl Codec + 'static) -> Self {
        Self {
            obfuscator: Arc::new(obfuscator),
        }
    }

    /// Name of the obfuscation stage.
    pub fn obfuscator(&self) -> &'static str {
        self.obfuscator.name()
    }

    /// Runs the write path.
    pub fn encode(&self, value: &Value, stringify: bool, obfuscate: bool) -> Result<String, CodecError> {
        let text = JsonStage::serialize(value, stringify)?;
        if obfuscate {
            self.obfuscator.encode(&text)
        } else {
            Ok(text)
        }
    }

    /// Runs the read path.
    ///
    /// # Errors
    ///
    /// Only the obfuscation stage can fail; JSON problems fall back to a raw string.
    pub fn decode(&self, stored: &str, deobfuscate: bool, parse_json: bool) -> Result<Value, CodecError> {
        let text = if deobfuscate {
            self.obfuscator.decode(stored)?
        } else {
            stored.to_string()
        };
        Ok(JsonStage::deserialize(text, parse_json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_path() {
        let pipeline = CodecPipeline::default();
        let value = json!({"theme": "dark", "size": 3});
        let stored = pipeline.encode(&value, true, false).unwrap();
        assert_eq!(stored, r#"{"size":3,"theme":"dark"}"#);
        assert_eq!(pipeline.decode(&stored, false, true).unwrap(), value);
    }

    #[test]
    fn test_scalar_encoding() {
        let pipeline = CodecPipeline::default();
        assert_eq!(pipeline.encode(&json!(1), true, false).unwrap(), "1");
        assert_eq!(pipeline.encode(&json!("abc"), true, false).unwrap(), "\"abc\"");
        // Without stringify strings go in verbatim
        assert_eq!(pipeline.encode(&json!("abc"), false, false).unwrap(), "abc");
        assert_eq!(pipeline.encode(&json!(true), false, false).unwrap(), "true");
    }

    #[test]
    fn test_obfuscated_path() {
        let pipeline = CodecPipeline::default();
        let value = json!(["a", "b"]);
        let stored = pipeline.encode(&value, true, true).unwrap();
        assert_eq!(stored, STANDARD.encode(r#"["a","b"]"#));
        assert_eq!(pipeline.decode(&stored, true, true).unwrap(), value);
    }

    #[test]
    fn test_non_json_falls_back_to_string() {
        let pipeline = CodecPipeline::default();
        assert_eq!(
            pipeline.decode("plain text", false, true).unwrap(),
            json!("plain text")
        );
        assert_eq!(pipeline.decode("42", false, false).unwrap(), json!("42"));
    }

    #[test]
    fn test_bad_obfuscation_is_an_error() {
        let pipeline = CodecPipeline::default();
        assert!(matches!(
            pipeline.decode("%%%not base64", true, true),
            Err(CodecError::Obfuscation(_))
        ));
    }

    #[derive(Debug)]
    struct Reverse;

    impl Codec for Reverse {
        fn name(&self) -> &'static str {
            "reverse"
        }

        fn encode(&self, input: &str) -> Result<String, CodecError> {
            Ok(input.chars().rev().collect())
        }

        fn decode(&self, input: &str) -> Result<String, CodecError> {
            Ok(input.chars().rev().collect())
        }
    }

    #[test]
    fn test_swappable_stage() {
        let pipeline = CodecPipeline::new(Reverse);
        assert_eq!(pipeline.obfuscator(), "reverse");
        let stored = pipeline.encode(&json!("ab"), true, true).unwrap();
        assert_eq!(stored, "\"ba\"");
        assert_eq!(pipeline.decode(&stored, true, true).unwrap(), json!("ab"));
    }
}
