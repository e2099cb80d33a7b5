//! Name-keyed module factories implementing [`ModelSystemBuilder`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::debug;

use super::structure::ModelSystemStructure;
use super::{ModelSystemBuilder, ModelSystemTemplate, Module, ModuleNode, ModuleTree};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorWithPath, ModulePath};

pub type ModuleFactory =
    Arc<dyn Fn(&ModuleSpec<'_>) -> anyhow::Result<Arc<dyn Module>> + Send + Sync>;

/// What a factory sees when building one node.
pub struct ModuleSpec<'a> {
    pub structure: &'a ModelSystemStructure,
    /// Already-built children, in order.
    pub children: &'a [ModuleNode],
    pub config: &'a OrchestratorConfig,
}

impl ModuleSpec<'_> {
    pub fn name(&self) -> &str {
        &self.structure.name
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.structure.parameter(name)
    }

    /// Parse a parameter, failing if it is missing or malformed.
    pub fn parse_parameter<T>(&self, name: &str) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let raw = self
            .parameter(name)
            .ok_or_else(|| anyhow!("missing parameter `{}`", name))?;
        raw.trim()
            .parse()
            .with_context(|| format!("parameter `{}` has invalid value `{}`", name, raw))
    }

    /// Children that can be driven as templates, with their module handles.
    pub fn child_templates(&self) -> Vec<(Arc<dyn Module>, Arc<dyn ModelSystemTemplate>)> {
        self.children
            .iter()
            .filter_map(|child| child.module.clone())
            .filter_map(|module| module.clone().into_template().map(|t| (module, t)))
            .collect()
    }
}

/// Builder that instantiates modules through registered factories.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in modules.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ModuleSpec<'_>) -> anyhow::Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
        self
    }

    fn build_node(
        &self,
        structure: &ModelSystemStructure,
        path: ModulePath,
        config: &OrchestratorConfig,
        errors: &mut Vec<ErrorWithPath>,
    ) -> ModuleNode {
        let errors_before = errors.len();
        let children: Vec<ModuleNode> = structure
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| self.build_node(child, path.child(i), config, errors))
            .collect();

        let module = match &structure.type_name {
            None => {
                if structure.required {
                    errors.push(ErrorWithPath::new(
                        Some(path.clone()),
                        format!("Required module `{}` has not been set", structure.name),
                    ));
                }
                None
            }
            // a failed subtree would only produce follow-on errors here
            Some(_) if errors.len() > errors_before => None,
            Some(type_name) => match self.factories.get(type_name) {
                None => {
                    errors.push(
                        ErrorWithPath::new(
                            Some(path.clone()),
                            format!("No module type named `{}` is registered", type_name),
                        )
                        .with_module_name(&structure.name),
                    );
                    None
                }
                Some(factory) => {
                    let spec = ModuleSpec {
                        structure,
                        children: &children,
                        config,
                    };
                    match factory(&spec) {
                        Ok(module) => Some(module),
                        Err(e) => {
                            errors.push(
                                ErrorWithPath::new(Some(path.clone()), format!("{:#}", e))
                                    .with_module_name(&structure.name),
                            );
                            None
                        }
                    }
                }
            },
        };

        ModuleNode {
            name: structure.name.clone(),
            parent_field_name: structure.parent_field_name.clone(),
            is_collection: structure.is_collection,
            module,
            children,
        }
    }
}

impl ModelSystemBuilder for ModuleRegistry {
    fn build(
        &self,
        structure: &ModelSystemStructure,
        config: &OrchestratorConfig,
    ) -> Result<ModuleTree, Vec<ErrorWithPath>> {
        let mut errors = Vec::new();
        let root = self.build_node(structure, ModulePath::root(), config, &mut errors);
        if !errors.is_empty() {
            return Err(errors);
        }

        let template = root.module.clone().and_then(|m| m.into_template());
        match template {
            Some(template) => {
                debug!("Built model system `{}`", root.name);
                Ok(ModuleTree { root, template })
            }
            None => Err(vec![ErrorWithPath::new(
                Some(ModulePath::root()),
                format!("Root module `{}` is not a model system template", root.name),
            )]),
        }
    }
}
