//! Payload shapes of the CDP notifications and results the adapter consumes.

use serde::Deserialize;
use serde_json::Value;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    pub opener_id: Option<String>,
}

impl TargetInfo {
    /// Target kinds that own a debuggable thread.
    pub fn is_debuggable(&self) -> bool {
        matches!(
            self.target_type.as_str(),
            "page" | "iframe" | "worker" | "node"
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCreatedParams {
    pub target_info: TargetInfo,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDestroyedParams {
    pub target_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTargetParams {
    pub session_id: String,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTargetParams {
    pub session_id: String,
    pub target_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfoChangedParams {
    pub target_info: TargetInfo,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParsedParams {
    pub script_id: String,
    #[serde(default)]
    pub url: String,
    pub source_map_url: Option<String>,
}

/// Location in a script, zero-based as CDP reports it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    pub line_number: u64,
    pub column_number: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerCallFrame {
    pub call_frame_id: String,
    #[serde(default)]
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCallFrame {
    #[serde(default)]
    pub function_name: String,
    pub script_id: String,
    #[serde(default)]
    pub url: String,
    pub line_number: u64,
    pub column_number: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStackTrace {
    pub description: Option<String>,
    #[serde(default)]
    pub call_frames: Vec<RuntimeCallFrame>,
    pub parent: Option<Box<AsyncStackTrace>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedParams {
    #[serde(default = "default_pause_reason")]
    pub reason: String,
    #[serde(default)]
    pub call_frames: Vec<DebuggerCallFrame>,
    pub async_stack_trace: Option<AsyncStackTrace>,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
}

fn default_pause_reason() -> String {
    "other".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub object_type: String,
    pub subtype: Option<String>,
    pub class_name: Option<String>,
    pub value: Option<Value>,
    pub unserializable_value: Option<String>,
    pub description: Option<String>,
    pub object_id: Option<String>,
    pub preview: Option<ObjectPreview>,
}

impl RemoteObject {
    pub fn is_primitive(&self) -> bool {
        self.object_id.is_none()
            || matches!(
                self.object_type.as_str(),
                "undefined" | "boolean" | "number" | "string" | "symbol" | "bigint"
            )
    }

    pub fn is_array(&self) -> bool {
        matches!(self.subtype.as_deref(), Some("array") | Some("typedarray"))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPreview {
    #[serde(rename = "type", default)]
    pub object_type: String,
    pub subtype: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub overflow: bool,
    #[serde(default)]
    pub properties: Vec<PropertyPreview>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyPreview {
    pub name: String,
    #[serde(rename = "type", default)]
    pub property_type: String,
    pub value: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalledParams {
    #[serde(rename = "type", default)]
    pub call_type: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    pub stack_trace: Option<AsyncStackTrace>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrownParams {
    pub exception_details: ExceptionDetails,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    pub exception: Option<RemoteObject>,
    #[serde(default)]
    pub line_number: u64,
    #[serde(default)]
    pub column_number: u64,
    pub url: Option<String>,
    pub script_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    pub value: Option<RemoteObject>,
    #[serde(default)]
    pub is_own: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalPropertyDescriptor {
    pub name: String,
    pub value: Option<RemoteObject>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivatePropertyDescriptor {
    pub name: String,
    pub value: Option<RemoteObject>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPropertiesResult {
    #[serde(default)]
    pub result: Vec<PropertyDescriptor>,
    #[serde(default)]
    pub internal_properties: Vec<InternalPropertyDescriptor>,
    #[serde(default)]
    pub private_properties: Vec<PrivatePropertyDescriptor>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    pub exception_details: Option<ExceptionDetails>,
}
