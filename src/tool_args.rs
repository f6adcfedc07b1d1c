use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct ObserveArgs {
    pub(crate) what: String,
    #[serde(default)]
    pub(crate) correlation_id: Option<String>,
    #[serde(default)]
    pub(crate) level: Option<String>,
    #[serde(default)]
    pub(crate) contains: Option<String>,
    #[serde(default)]
    pub(crate) url_contains: Option<String>,
    #[serde(default)]
    pub(crate) connection_id: Option<String>,
    #[serde(default)]
    pub(crate) direction: Option<String>,
    #[serde(default)]
    pub(crate) event: Option<String>,
    #[serde(default)]
    pub(crate) action: Option<String>,
    #[serde(default)]
    pub(crate) url: Option<String>,
    #[serde(default)]
    pub(crate) since_ms: Option<i64>,
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnalyzeArgs {
    pub(crate) what: String,
    #[serde(default)]
    pub(crate) url: Option<String>,
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

/// Type-checks interact arguments before the raw object goes to dispatch
/// (fingerprinting reads the raw params, so the original value survives).
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub(crate) struct InteractArgs {
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) selector: Option<String>,
    #[serde(default)]
    pub(crate) text: Option<String>,
    #[serde(default)]
    pub(crate) value: Option<String>,
    #[serde(default)]
    pub(crate) url: Option<String>,
    #[serde(default)]
    pub(crate) element_id: Option<String>,
    #[serde(default)]
    pub(crate) index: Option<i64>,
    #[serde(default)]
    pub(crate) frame: Option<String>,
    #[serde(default)]
    pub(crate) world: Option<String>,
    #[serde(default)]
    pub(crate) scope_selector: Option<String>,
    #[serde(default)]
    pub(crate) scope_rect: Option<Value>,
    #[serde(default)]
    pub(crate) annotation_rect: Option<Value>,
    #[serde(default)]
    pub(crate) wait_for: Option<String>,
    #[serde(default)]
    pub(crate) correlation_id: Option<String>,
    #[serde(default)]
    pub(crate) background: Option<bool>,
    #[serde(default)]
    pub(crate) sync: Option<bool>,
    #[serde(default)]
    pub(crate) wait: Option<bool>,
    #[serde(default)]
    pub(crate) timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigureArgs {
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) message_regex: Option<String>,
    #[serde(default)]
    pub(crate) kinds: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateArgs {
    pub(crate) format: String,
    #[serde(default)]
    pub(crate) path: Option<String>,
}
