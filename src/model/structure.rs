//! Serializable description of a model system.
//!
//! This is what travels to remote workers and what gets snapshotted into the
//! run directory as `RunParameters.json`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::reference::ParameterReference;

/// One node of a model-system description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSystemStructure {
    pub name: String,
    /// Registered module type; `None` leaves the slot empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_field_name: Option<String>,
    #[serde(default)]
    pub is_collection: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterValue>,
    #[serde(default)]
    pub children: Vec<ModelSystemStructure>,
}

impl ModelSystemStructure {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: Some(type_name.into()),
            parent_field_name: None,
            is_collection: false,
            required: true,
            parameters: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A collection node whose children are addressed by index.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            parent_field_name: None,
            is_collection: true,
            required: false,
            parameters: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(ParameterValue {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Attach `child` bound to the parent field `field`.
    pub fn with_field(mut self, field: impl Into<String>, mut child: ModelSystemStructure) -> Self {
        child.parent_field_name = Some(field.into());
        self.children.push(child);
        self
    }

    pub fn with_child(mut self, child: ModelSystemStructure) -> Self {
        self.children.push(child);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ParameterValue> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
}

/// A value shared by several parameters across the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedParameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// Escaped dotted paths, parsed when the links are applied.
    #[serde(default)]
    pub references: Vec<String>,
}

/// A model system plus its linked parameters, as exchanged with workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSystemDocument {
    pub root: ModelSystemStructure,
    #[serde(default)]
    pub linked_parameters: Vec<LinkedParameter>,
}

impl ModelSystemDocument {
    pub fn new(root: ModelSystemStructure) -> Self {
        Self {
            root,
            linked_parameters: Vec::new(),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Push every linked value into the parameters it references.
    ///
    /// Returns how many references were applied; references that do not
    /// resolve are skipped with a warning.
    pub fn apply_linked_parameters(&mut self) -> usize {
        let mut applied = 0;
        for linked in &self.linked_parameters {
            for raw in &linked.references {
                let reference = match raw.parse::<ParameterReference>() {
                    Ok(reference) => reference,
                    Err(e) => {
                        warn!("Linked parameter `{}` has a malformed reference: {}", linked.name, e);
                        continue;
                    }
                };
                match reference.resolve_mut(&mut self.root) {
                    Some(parameter) => {
                        parameter.value = linked.value.clone();
                        applied += 1;
                    }
                    None => warn!(
                        "Linked parameter `{}` references unknown parameter `{}`",
                        linked.name, reference
                    ),
                }
            }
        }
        applied
    }

    /// Consume the document, returning the root with linked values applied.
    pub fn into_resolved(mut self) -> ModelSystemStructure {
        self.apply_linked_parameters();
        self.root
    }
}
