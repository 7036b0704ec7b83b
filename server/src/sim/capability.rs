//! Capability model parsing: DTDL interfaces to simulator components.
//!
//! DESIGN
//! ======
//! Only what the data generator and the command listeners need is extracted:
//! telemetry and property names with their schemas, and commands with their
//! sync/async flavor. Parsing is lenient: entries that are not objects or lack
//! the expected fields are skipped rather than failing the whole model, since
//! templates downloaded from Central vary a lot in shape.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::types::DeviceModel;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub id: String,
    pub name: String,
    pub schema: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub schema: String,
    pub writable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub id: String,
    pub name: String,
    /// Synchronous commands arrive as direct methods, others as C2D messages.
    pub is_sync: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Component {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub telemetry: Vec<Telemetry>,
    pub properties: Vec<Property>,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityModel {
    pub components: Vec<Component>,
}

impl CapabilityModel {
    pub fn telemetry(&self) -> impl Iterator<Item = &Telemetry> {
        self.components.iter().flat_map(|c| c.telemetry.iter())
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.components.iter().flat_map(|c| c.properties.iter())
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.components.iter().flat_map(|c| c.commands.iter())
    }

    #[must_use]
    pub fn has_sync_commands(&self) -> bool {
        self.commands().any(|c| c.is_sync)
    }

    #[must_use]
    pub fn has_async_commands(&self) -> bool {
        self.commands().any(|c| !c.is_sync)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Telemetry,
    Property,
    Command,
    Component,
}

impl ContentKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "telemetry" => Some(Self::Telemetry),
            "property" => Some(Self::Property),
            "command" => Some(Self::Command),
            "component" => Some(Self::Component),
            _ => None,
        }
    }

    /// Semantic types such as `["Telemetry", "Temperature"]`: telemetry wins,
    /// otherwise the first recognized kind.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Array(items) => {
                let kinds: Vec<Self> = items.iter().filter_map(Value::as_str).filter_map(Self::parse).collect();
                if kinds.contains(&Self::Telemetry) { Some(Self::Telemetry) } else { kinds.first().copied() }
            }
            _ => None,
        }
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse a device model's DTDL interfaces into components.
#[must_use]
pub fn parse_capability_model(model: &DeviceModel) -> CapabilityModel {
    let mut components = Vec::new();
    // Component contents rename the interface they point at.
    let mut renames: HashMap<String, String> = HashMap::new();

    for interface in model.capability_model.iter().filter_map(Value::as_object) {
        components.push(parse_interface(interface, &mut renames));

        if let Some(extends) = interface.get("extends").and_then(Value::as_array) {
            for parent in extends.iter().filter_map(Value::as_object) {
                components.push(parse_interface(parent, &mut renames));
            }
        }
    }

    for component in &mut components {
        if let Some(name) = renames.get(&component.id) {
            component.name.clone_from(name);
        }
    }

    CapabilityModel { components }
}

fn parse_interface(interface: &Map<String, Value>, renames: &mut HashMap<String, String>) -> Component {
    let mut component = Component {
        id: str_field(interface, "@id"),
        kind: interface_kind(interface.get("@type")),
        name: interface
            .get("displayName")
            .and_then(|d| d.get("en"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        ..Component::default()
    };

    let contents = interface.get("contents").and_then(Value::as_array);
    for entry in contents.into_iter().flatten().filter_map(Value::as_object) {
        parse_content(entry, &mut component, renames);
    }
    component
}

fn interface_kind(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => {
            let names: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if names.contains(&"Interface") {
                "Interface".to_owned()
            } else {
                names.first().map(|s| (*s).to_owned()).unwrap_or_default()
            }
        }
        _ => String::new(),
    }
}

fn parse_content(entry: &Map<String, Value>, component: &mut Component, renames: &mut HashMap<String, String>) {
    let mut kind = None;
    let mut id = String::new();
    let mut name = String::new();
    let mut schema = String::new();
    let mut writable = false;
    let mut is_sync = false;

    // DTDL keys are case-sensitive but hand-written models are not always.
    for (key, value) in entry {
        match key.to_ascii_lowercase().as_str() {
            "@type" => kind = ContentKind::from_value(value),
            "@id" => id = value.as_str().unwrap_or_default().to_owned(),
            "name" => name = value.as_str().unwrap_or_default().to_owned(),
            // Complex schemas (objects, enums) generate empty values.
            "schema" => schema = value.as_str().unwrap_or_default().to_owned(),
            "writable" => writable = value.as_bool().unwrap_or(false),
            "commandtype" => {
                is_sync = value.as_str().is_some_and(|t| t.eq_ignore_ascii_case("synchronous"));
            }
            _ => {}
        }
    }

    match kind {
        Some(ContentKind::Telemetry) => component.telemetry.push(Telemetry { id, name, schema }),
        Some(ContentKind::Property) => component.properties.push(Property { id, name, schema, writable }),
        Some(ContentKind::Command) => component.commands.push(Command { id, name, is_sync }),
        Some(ContentKind::Component) => {
            renames.insert(schema, name);
        }
        None => {}
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).and_then(Value::as_str).unwrap_or_default().to_owned()
}

#[cfg(test)]
#[path = "capability_test.rs"]
mod tests;
