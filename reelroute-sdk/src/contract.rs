//! # Schema Contract
//!
//! Owns the wire contract between callers and the orchestration core.
//! Callers may speak any supported [`SchemaVersion`]; [`parse`] validates and
//! migrates inbound envelopes up to the newest version so internal processing
//! never branches on schema age, and [`serialize`] migrates outbound
//! responses back down to whatever the caller declared.
//!
//! Migration steps are applied pairwise (`1.0 → 1.1 → 2.0` and the reverse)
//! so each rule is written once:
//!
//! - `1.0 → 1.1`: inject an empty `metadata` object, default the
//!   `retry_config`, and widen a scalar `result.output_url` into a
//!   `result.urls` array.
//! - `1.1 → 2.0`: expand the response `provider` string into
//!   `provider_info {name, version, region}`, guarantee
//!   `error.correlation_id`, and lift quality/safety/advanced tuning keys out
//!   of `parameters` into `generation_config`.
//!
//! Validation failures surface as `invalid_request` with the offending field
//! name recorded under `details.field`.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{SchemaVersion, UnifiedRequest, UnifiedResponse};
use serde_json::{json, Map, Value};

/// Parameter keys the 2.0 schema moves from `parameters` into
/// `generation_config`.
const GENERATION_CONFIG_KEYS: &[&str] = &[
    "quality",
    "guidance_scale",
    "motion_strength",
    "negative_prompt",
    "safety_filter",
    "style_preset",
];

/// Validate a raw envelope declared at `version` and normalize it to the
/// internal (newest-version) representation.
pub fn parse(raw: Value, version: SchemaVersion) -> Result<UnifiedRequest, ErrorDetails> {
    let Value::Object(mut envelope) = raw else {
        return Err(ErrorDetails::invalid_field(
            "body",
            "request body must be a JSON object",
        ));
    };

    if version == SchemaVersion::V1_0 {
        upgrade_request_1_0_to_1_1(&mut envelope);
    }
    if version != SchemaVersion::V2_0 {
        upgrade_request_1_1_to_2_0(&mut envelope);
    }

    require_string(&envelope, "request_id")?;
    require_string(&envelope, "provider")?;
    require_string(&envelope, "model")?;
    require_string(&envelope, "prompt")?;
    let timeout = envelope
        .get("timeout_ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| ErrorDetails::invalid_field("timeout_ms", "timeout_ms is required"))?;
    if timeout == 0 {
        return Err(ErrorDetails::invalid_field(
            "timeout_ms",
            "timeout_ms must be greater than zero",
        ));
    }

    // Older envelopes predate the media_type field; this contract has always
    // produced video by default.
    envelope
        .entry("media_type")
        .or_insert_with(|| Value::from("video"));
    envelope
        .entry("created_at")
        .or_insert_with(|| json!(chrono::Utc::now()));

    let mut request: UnifiedRequest =
        serde_json::from_value(Value::Object(envelope)).map_err(|e| {
            ErrorDetails::new(ErrorCode::InvalidRequest, format!("malformed request: {e}"))
        })?;
    // Remember what the caller spoke so the response can be shaped to match.
    request.schema_version = version;
    request.check_invariants()?;
    Ok(request)
}

/// Shape an internal response for a caller that declared `version`.
///
/// All optional fields are emitted explicitly (`null` when absent) and
/// `request_id` is always preserved.
pub fn serialize(response: &UnifiedResponse, version: SchemaVersion) -> Value {
    let mut envelope = match serde_json::to_value(response) {
        Ok(Value::Object(map)) => map,
        // UnifiedResponse always serializes to an object.
        _ => Map::new(),
    };
    envelope.insert(
        "schema_version".to_string(),
        Value::from(version.as_str()),
    );

    for field in ["result", "error", "tokens_used", "cost"] {
        envelope.entry(field).or_insert(Value::Null);
    }
    normalize_result_urls(&mut envelope);

    match version {
        SchemaVersion::V2_0 => {
            // 2.0 reports structured provider identity.
            if let Some(Value::String(name)) = envelope.remove("provider") {
                envelope.insert(
                    "provider_info".to_string(),
                    json!({ "name": name, "version": "unknown", "region": "unknown" }),
                );
            }
            if let Some(Value::Object(error)) = envelope.get_mut("error") {
                error
                    .entry("correlation_id")
                    .or_insert_with(|| Value::from(uuid::Uuid::new_v4().to_string()));
            }
        }
        SchemaVersion::V1_1 => {}
        SchemaVersion::V1_0 => {
            // 1.0 predates cost observability and the degraded flag.
            envelope.remove("tokens_used");
            envelope.remove("cost");
            if let Some(Value::Object(meta)) = envelope.get_mut("metadata") {
                meta.remove("degraded");
            }
        }
    }

    Value::Object(envelope)
}

fn upgrade_request_1_0_to_1_1(envelope: &mut Map<String, Value>) {
    envelope
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    envelope
        .entry("retry_config")
        .or_insert_with(|| json!({ "max_retries": 3, "base_delay_ms": 1000 }));
    if let Some(Value::Object(result)) = envelope.get_mut("result") {
        if let Some(url @ Value::String(_)) = result.remove("output_url") {
            result.insert("urls".to_string(), Value::Array(vec![url]));
        }
    }
}

fn upgrade_request_1_1_to_2_0(envelope: &mut Map<String, Value>) {
    let mut lifted = Map::new();
    if let Some(Value::Object(parameters)) = envelope.get_mut("parameters") {
        for key in GENERATION_CONFIG_KEYS {
            if let Some(value) = parameters.remove(*key) {
                lifted.insert((*key).to_string(), value);
            }
        }
    }
    if !lifted.is_empty() {
        let config = envelope
            .entry("generation_config")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(config) = config {
            for (k, v) in lifted {
                config.entry(k).or_insert(v);
            }
        }
    }
}

fn normalize_result_urls(envelope: &mut Map<String, Value>) {
    if let Some(Value::Object(result)) = envelope.get_mut("result") {
        if let Some(url @ Value::String(_)) = result.remove("output_url") {
            result
                .entry("urls")
                .or_insert_with(|| Value::Array(vec![url]));
        }
    }
}

fn require_string(envelope: &Map<String, Value>, field: &str) -> Result<(), ErrorDetails> {
    match envelope.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(()),
        Some(Value::String(_)) => Err(ErrorDetails::invalid_field(
            field,
            format!("{field} must not be empty"),
        )),
        Some(_) => Err(ErrorDetails::invalid_field(
            field,
            format!("{field} must be a string"),
        )),
        None => Err(ErrorDetails::invalid_field(
            field,
            format!("{field} is required"),
        )),
    }
}
