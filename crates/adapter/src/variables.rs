//! Variable references and lazy property materialisation.
//!
//! Every non-primitive remote object gets a stable reference; children are
//! fetched on demand through `Runtime.getProperties` (plus range/named
//! helpers for arrays) and rendered through the bounded preview rules.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::debug;

use jsdbg_cdp::CdpSession;
use jsdbg_dap::types::Variable;

use crate::error::AdapterError;
use crate::ids;
use crate::protocol::{GetPropertiesResult, ObjectPreview, RemoteObject};

/// Properties shown in a collapsed object preview.
const PREVIEW_BUDGET: usize = 3;
/// Larger budget when the value is rendered for the REPL.
const REPL_PREVIEW_BUDGET: usize = 8;

const NAMED_HELPER: &str = r#"function() {
    const proxy = {};
    for (const key of Object.getOwnPropertyNames(this)) {
        if (!/^\d+$/.test(key)) proxy[key] = this[key];
    }
    return proxy;
}"#;

const RANGE_HELPER: &str = r#"function(start, count) {
    const slice = {};
    const end = start + count;
    for (let i = start; i < end && i < this.length; i++) slice[i] = this[i];
    return slice;
}"#;

struct Slot {
    object: RemoteObject,
    session: Arc<CdpSession>,
    thread_id: u32,
}

pub struct VariableStore {
    slots: DashMap<u32, Slot>,
}

impl VariableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
        })
    }

    /// Wrap a remote object for the client. Primitives carry their rendered
    /// value and reference 0; anything with children allocates a reference.
    pub fn create(
        &self,
        session: &Arc<CdpSession>,
        thread_id: u32,
        name: &str,
        object: RemoteObject,
        context: Option<&str>,
    ) -> Variable {
        let value = render_preview(&object, preview_budget(context));
        let type_name = if object.object_type.is_empty() {
            None
        } else {
            Some(object.object_type.clone())
        };

        if object.is_primitive() {
            return Variable {
                name: name.to_string(),
                value,
                r#type: type_name,
                variables_reference: 0,
                named_variables: None,
                indexed_variables: None,
            };
        }

        let indexed = object.is_array().then(|| array_length(&object)).flatten();
        let reference = ids::next_variable_ref();
        self.slots.insert(
            reference,
            Slot {
                object,
                session: Arc::clone(session),
                thread_id,
            },
        );
        Variable {
            name: name.to_string(),
            value,
            r#type: type_name,
            variables_reference: reference,
            named_variables: None,
            indexed_variables: indexed,
        }
    }

    /// Children of a reference. Invalidated or unknown references yield an
    /// empty list rather than an error.
    pub async fn children(
        &self,
        reference: u32,
        filter: Option<&str>,
        start: Option<u64>,
        count: Option<u64>,
    ) -> Result<Vec<Variable>, AdapterError> {
        let (object, session, thread_id) = match self.slots.get(&reference) {
            Some(slot) => (
                slot.object.clone(),
                Arc::clone(&slot.session),
                slot.thread_id,
            ),
            None => return Ok(Vec::new()),
        };
        let Some(object_id) = object.object_id.clone() else {
            return Ok(Vec::new());
        };

        let properties = match (object.is_array(), filter) {
            (true, Some("indexed")) => {
                let length = array_length(&object).unwrap_or(0);
                let start = start.unwrap_or(0);
                let count = count.unwrap_or(length.saturating_sub(start));
                self.call_helper(&session, &object_id, RANGE_HELPER, json!([
                    {"value": start},
                    {"value": count},
                ]))
                .await?
            }
            (true, Some("named")) => {
                self.call_helper(&session, &object_id, NAMED_HELPER, json!([]))
                    .await?
            }
            _ => self.get_properties(&session, &object_id).await?,
        };

        let mut weighted: Vec<(u32, Variable)> = Vec::new();
        for descriptor in properties.result {
            let Some(value) = descriptor.value else {
                continue;
            };
            let weight = if descriptor.name == "__proto__" { 0 } else { 100 };
            weighted.push((
                weight,
                self.create(&session, thread_id, &descriptor.name, value, None),
            ));
        }
        for descriptor in properties.private_properties {
            let Some(value) = descriptor.value else {
                continue;
            };
            weighted.push((
                20,
                self.create(&session, thread_id, &descriptor.name, value, None),
            ));
        }
        for descriptor in properties.internal_properties {
            let Some(value) = descriptor.value else {
                continue;
            };
            weighted.push((
                10,
                self.create(&session, thread_id, &descriptor.name, value, None),
            ));
        }

        weighted.sort_by(|(wa, va), (wb, vb)| {
            wb.cmp(wa).then_with(|| compare_names(&va.name, &vb.name))
        });
        Ok(weighted.into_iter().map(|(_, variable)| variable).collect())
    }

    async fn get_properties(
        &self,
        session: &Arc<CdpSession>,
        object_id: &str,
    ) -> Result<GetPropertiesResult, AdapterError> {
        let result = session
            .send(
                "Runtime.getProperties",
                json!({
                    "objectId": object_id,
                    "ownProperties": true,
                    "generatePreview": true,
                }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call_helper(
        &self,
        session: &Arc<CdpSession>,
        object_id: &str,
        declaration: &str,
        arguments: Value,
    ) -> Result<GetPropertiesResult, AdapterError> {
        let result = session
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": declaration,
                    "arguments": arguments,
                    "generatePreview": true,
                }),
            )
            .await?;
        let proxy: RemoteObject =
            serde_json::from_value(result.get("result").cloned().unwrap_or_default())?;
        let Some(proxy_id) = proxy.object_id else {
            return Ok(GetPropertiesResult::default());
        };
        self.get_properties(session, &proxy_id).await
    }

    /// Drop every reference bound to a thread; called when it resumes.
    /// References are never reused, so stale ones simply stop resolving.
    pub fn invalidate_thread(&self, thread_id: u32) {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.thread_id != thread_id);
        debug!(
            target: "adapter",
            thread_id,
            dropped = before.saturating_sub(self.slots.len()),
            "variable references invalidated"
        );
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

fn render_json_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn preview_budget(context: Option<&str>) -> usize {
    if context == Some("repl") {
        REPL_PREVIEW_BUDGET
    } else {
        PREVIEW_BUDGET
    }
}

fn compare_names(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb),
        _ => a.cmp(b),
    }
}

fn array_length(object: &RemoteObject) -> Option<u64> {
    let description = object
        .description
        .as_deref()
        .or(object.preview.as_ref().and_then(|p| p.description.as_deref()))?;
    let open = description.find('(')?;
    let close = description[open..].find(')')? + open;
    description[open + 1..close].parse().ok()
}

/// Render a short human-readable preview of a remote value, spending at most
/// `budget` property tokens; overflow is shown as an ellipsis.
pub fn render_preview(object: &RemoteObject, budget: usize) -> String {
    match object.object_type.as_str() {
        "undefined" => "undefined".to_string(),
        "string" => {
            let text = object
                .value
                .as_ref()
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| object.description.clone())
                .unwrap_or_default();
            format!("'{text}'")
        }
        "function" => object
            .description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("function")
            .to_string(),
        "object" => {
            if object.subtype.as_deref() == Some("null") {
                return "null".to_string();
            }
            if let Some(preview) = &object.preview {
                return render_object_preview(object, preview, budget);
            }
            object
                .description
                .clone()
                .or_else(|| object.class_name.clone())
                .unwrap_or_else(|| "Object".to_string())
        }
        _ => object
            .description
            .clone()
            .or_else(|| {
                object.unserializable_value.clone()
            })
            .or_else(|| object.value.as_ref().map(render_json_value))
            .unwrap_or_default(),
    }
}

/// Preview for console output: strings stay unquoted.
pub fn render_console_arg(object: &RemoteObject, budget: usize) -> String {
    if object.object_type == "string" {
        return object
            .value
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| object.description.clone())
            .unwrap_or_default();
    }
    render_preview(object, budget)
}

fn render_object_preview(object: &RemoteObject, preview: &ObjectPreview, budget: usize) -> String {
    let is_array = object.is_array();
    let mut parts = Vec::new();
    for property in preview.properties.iter().take(budget) {
        let value = property.value.as_deref().unwrap_or(&property.property_type);
        if is_array {
            parts.push(value.to_string());
        } else {
            parts.push(format!("{}: {}", property.name, value));
        }
    }
    if preview.overflow || preview.properties.len() > budget {
        parts.push("…".to_string());
    }
    let body = parts.join(", ");
    if is_array {
        let prefix = array_length(object)
            .map(|length| format!("({length}) "))
            .unwrap_or_default();
        format!("{prefix}[{body}]")
    } else {
        let class_name = preview
            .description
            .as_deref()
            .or(object.class_name.as_deref())
            .unwrap_or("Object");
        if class_name == "Object" {
            format!("{{{body}}}")
        } else {
            format!("{class_name} {{{body}}}")
        }
    }
}
