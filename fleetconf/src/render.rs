//! Template rendering.
//!
//! The orchestrator only needs the [`Renderer`] trait; [`TeraRenderer`] is
//! the default implementation (`{{ var }}` substitution, `{% if %}` blocks,
//! filters).

use std::error::Error as _;

use tera::Tera;

use crate::error::TemplateError;
use crate::inventory::{DeviceDescriptor, Variables};

/// Variables available to a template while rendering one device.
///
/// Built from the global variables, then the device's own variables, then
/// the builtin `device_id`, `address` and `platform` keys. Later sources win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    vars: Variables,
}

impl RenderContext {
    /// Build the context for `device`.
    pub fn for_device(globals: &Variables, device: &DeviceDescriptor) -> Self {
        let mut vars = globals.clone();
        vars.extend(device.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert("device_id".to_string(), device.id().to_string());
        vars.insert("address".to_string(), device.address.clone());
        vars.insert("platform".to_string(), device.platform.clone());
        Self { vars }
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterate variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the context holds no variables.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl From<Variables> for RenderContext {
    fn from(vars: Variables) -> Self {
        Self { vars }
    }
}

/// Renders configuration templates.
pub trait Renderer: Send + Sync + 'static {
    /// Render `template` with `context`.
    fn render(&self, template: &str, context: &RenderContext) -> Result<String, TemplateError>;
}

/// Renderer backed by Tera, with autoescaping disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeraRenderer;

const TEMPLATE_NAME: &str = "config";

impl TeraRenderer {
    /// Create a renderer.
    pub fn new() -> Self {
        Self
    }

    /// Check that `template` parses, without rendering it.
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, template)
            .map_err(|e| TemplateError::Syntax {
                message: error_chain(&e),
            })
    }
}

impl Renderer for TeraRenderer {
    fn render(&self, template: &str, context: &RenderContext) -> Result<String, TemplateError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_template(TEMPLATE_NAME, template)
            .map_err(|e| TemplateError::Syntax {
                message: error_chain(&e),
            })?;

        let mut ctx = tera::Context::new();
        for (key, value) in context.iter() {
            ctx.insert(key, value);
        }

        tera.render(TEMPLATE_NAME, &ctx)
            .map_err(|e| TemplateError::Render {
                message: error_chain(&e),
            })
    }
}

/// Flatten Tera's nested errors; the useful detail is usually in a source.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
