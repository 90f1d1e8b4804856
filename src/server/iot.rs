//! Device-capability registry
//!
//! Devices advertise capability descriptors (properties + methods) at
//! runtime. The registry tracks declared state with typed values, rejects
//! type-mismatched updates, and builds outbound command frames for method
//! invocations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info};

/// Declared value type of a property or method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Number,
    Boolean,
    String,
}

/// Current value of a property; always matches the declared kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Boolean(bool),
    Text(String),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl PropertyValue {
    fn default_for(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Number => PropertyValue::Number(0.0),
            PropertyKind::Boolean => PropertyValue::Boolean(false),
            PropertyKind::String => PropertyValue::Text(String::new()),
        }
    }

    fn from_json(kind: PropertyKind, value: &serde_json::Value) -> Option<Self> {
        match kind {
            PropertyKind::Number => value.as_f64().map(PropertyValue::Number),
            PropertyKind::Boolean => value.as_bool().map(PropertyValue::Boolean),
            PropertyKind::String => value.as_str().map(|s| PropertyValue::Text(s.to_string())),
        }
    }
}

// ─── Wire shapes ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertySpec>,
    #[serde(default)]
    pub methods: HashMap<String, MethodSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertySpec {
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: HashMap<String, PropertySpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateUpdate {
    pub name: String,
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,
}

/// One entry of an outbound `{type:"iot", commands:[...]}` frame.
#[derive(Debug, Clone, Serialize)]
pub struct IotCommand {
    pub name: String,
    pub method: String,
    pub parameters: serde_json::Value,
}

// ─── Registry ────────────────────────────────────────────────

#[derive(Debug)]
struct Property {
    kind: PropertyKind,
    value: PropertyValue,
}

#[derive(Debug)]
struct Capability {
    methods: HashMap<String, MethodSpec>,
    properties: HashMap<String, Property>,
}

/// Per-session capability registry, mutated only by the inbound-frame reader.
#[derive(Debug, Default)]
pub struct IotRegistry {
    capabilities: HashMap<String, Capability>,
}

impl IotRegistry {
    /// Register or replace capabilities from device-supplied descriptors.
    pub fn register(&mut self, descriptors: Vec<DescriptorSpec>) {
        for spec in descriptors {
            let properties = spec
                .properties
                .into_iter()
                .map(|(name, p)| {
                    (name, Property { kind: p.kind, value: PropertyValue::default_for(p.kind) })
                })
                .collect();
            info!("registered capability {}", spec.name);
            self.capabilities
                .insert(spec.name, Capability { methods: spec.methods, properties });
        }
    }

    /// Apply property updates with type checking. A mismatched update is
    /// logged and dropped; other updates in the same frame still apply.
    pub fn apply_states(&mut self, updates: Vec<StateUpdate>) {
        for update in updates {
            let Some(capability) = self.capabilities.get_mut(&update.name) else {
                error!("state update for unknown capability {}", update.name);
                continue;
            };
            for (prop_name, value) in &update.state {
                let Some(property) = capability.properties.get_mut(prop_name) else {
                    error!("unknown property {}.{}", update.name, prop_name);
                    continue;
                };
                match PropertyValue::from_json(property.kind, value) {
                    Some(typed) => {
                        info!("iot state update: {} , {} = {}", update.name, prop_name, value);
                        property.value = typed;
                    }
                    None => {
                        error!(
                            "type mismatch for {}.{}: expected {:?}, got {}",
                            update.name, prop_name, property.kind, value
                        );
                    }
                }
            }
        }
    }

    /// Current value of a property, if declared.
    pub fn property(&self, capability: &str, property: &str) -> Option<PropertyValue> {
        self.capabilities
            .get(capability)?
            .properties
            .get(property)
            .map(|p| p.value.clone())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Build the command for a method invocation. Unknown capability or
    /// method logs and yields nothing.
    pub fn build_command(
        &self,
        capability: &str,
        method: &str,
        parameters: serde_json::Value,
    ) -> Option<IotCommand> {
        let Some(cap) = self.capabilities.get(capability) else {
            error!("command for unknown capability {}", capability);
            return None;
        };
        if !cap.methods.contains_key(method) {
            error!("unknown method {}.{}", capability, method);
            return None;
        }
        Some(IotCommand {
            name: capability.to_string(),
            method: method.to_string(),
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn speaker_registry() -> IotRegistry {
        let spec: DescriptorSpec = serde_json::from_value(json!({
            "name": "Speaker",
            "description": "当前 AI 机器人的扬声器",
            "properties": {
                "volume": {"description": "当前音量值", "type": "number"}
            },
            "methods": {
                "SetVolume": {
                    "description": "设置音量",
                    "parameters": {"volume": {"description": "0到100之间的整数", "type": "number"}}
                }
            }
        }))
        .unwrap();
        let mut registry = IotRegistry::default();
        registry.register(vec![spec]);
        registry
    }

    #[test]
    fn registration_seeds_typed_defaults() {
        let registry = speaker_registry();
        assert!(registry.has_capability("Speaker"));
        assert_eq!(registry.property("Speaker", "volume"), Some(PropertyValue::Number(0.0)));
    }

    #[test]
    fn type_mismatch_leaves_state_unchanged() {
        let mut registry = speaker_registry();
        registry.apply_states(vec![StateUpdate {
            name: "Speaker".into(),
            state: HashMap::from([("volume".to_string(), json!("loud"))]),
        }]);
        assert_eq!(registry.property("Speaker", "volume"), Some(PropertyValue::Number(0.0)));

        registry.apply_states(vec![StateUpdate {
            name: "Speaker".into(),
            state: HashMap::from([("volume".to_string(), json!(55))]),
        }]);
        assert_eq!(registry.property("Speaker", "volume"), Some(PropertyValue::Number(55.0)));
    }

    #[test]
    fn mixed_frame_applies_valid_updates() {
        let mut registry = speaker_registry();
        registry.apply_states(vec![StateUpdate {
            name: "Speaker".into(),
            state: HashMap::from([
                ("volume".to_string(), json!(40)),
                ("missing".to_string(), json!(1)),
            ]),
        }]);
        assert_eq!(registry.property("Speaker", "volume"), Some(PropertyValue::Number(40.0)));
    }

    #[test]
    fn command_requires_known_method() {
        let registry = speaker_registry();
        let cmd = registry.build_command("Speaker", "SetVolume", json!({"volume": 100}));
        assert!(cmd.is_some());
        assert!(registry.build_command("Speaker", "Mute", json!({})).is_none());
        assert!(registry.build_command("Light", "SetVolume", json!({})).is_none());
    }
}
