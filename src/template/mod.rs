//! Script templates and the catalog that renders them.
//!
//! Templates are `minijinja` bodies whose `{{ }}` blocks are emitted as
//! PowerShell literals: strings single-quoted and escaped, numbers bare,
//! booleans as `$true`/`$false`, sequences as `@(...)`, maps as `@{ }`
//! hashtables. The `winpath` filter converts forward slashes to backslashes.
//!
//! Every template is parsed when the catalog is built, so syntax errors and
//! placeholders missing from the declared parameter list fail at startup.

mod literal;

use std::collections::BTreeSet;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::error::HypervError;

pub use literal::{literal, quote, windows_path};

/// A named script body and the placeholders it is allowed to reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScriptTemplate {
    name: &'static str,
    params: &'static [&'static str],
    body: &'static str,
}

impl ScriptTemplate {
    /// Declares a template.
    #[must_use]
    pub const fn new(
        name: &'static str,
        params: &'static [&'static str],
        body: &'static str,
    ) -> Self {
        Self { name, params, body }
    }

    /// Unique template name, also used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Declared placeholder names.
    #[must_use]
    pub const fn params(&self) -> &'static [&'static str] {
        self.params
    }

    /// Unrendered body.
    #[must_use]
    pub const fn body(&self) -> &'static str {
        self.body
    }
}

/// Startup-time template problems.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Two templates share a name.
    #[error("template {0} is registered twice")]
    Duplicate(String),
    /// The body does not parse.
    #[error("template {name} does not parse: {message}")]
    Syntax {
        /// Template name.
        name: String,
        /// Parser diagnostic.
        message: String,
    },
    /// The body references a placeholder that is not declared.
    #[error("template {name} references undeclared placeholder {placeholder}")]
    UndeclaredPlaceholder {
        /// Template name.
        name: String,
        /// Offending placeholder.
        placeholder: String,
    },
    /// A declared parameter is never referenced by the body.
    #[error("template {name} declares unused parameter {param}")]
    UnusedParameter {
        /// Template name.
        name: String,
        /// Unused parameter.
        param: String,
    },
}

/// Parsed, validated set of templates.
pub struct ScriptCatalog {
    env: Environment<'static>,
}

impl std::fmt::Debug for ScriptCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCatalog").finish_non_exhaustive()
    }
}

impl ScriptCatalog {
    /// Parses and validates `templates`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] for duplicate names, syntax errors, and
    /// mismatches between the body and its declared parameters.
    pub fn new(templates: &[ScriptTemplate]) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_formatter(literal::powershell_formatter);
        env.add_filter("winpath", |value: String| windows_path(&value));

        for template in templates {
            if env.get_template(template.name).is_ok() {
                return Err(TemplateError::Duplicate(template.name.to_owned()));
            }
            env.add_template(template.name, template.body)
                .map_err(|err| TemplateError::Syntax {
                    name: template.name.to_owned(),
                    message: err.to_string(),
                })?;
            let parsed = env
                .get_template(template.name)
                .map_err(|err| TemplateError::Syntax {
                    name: template.name.to_owned(),
                    message: err.to_string(),
                })?;
            let referenced: BTreeSet<String> =
                parsed.undeclared_variables(false).into_iter().collect();
            check_params(template, &referenced)?;
        }
        Ok(Self { env })
    }

    /// Renders `template` with `args`.
    ///
    /// The output is a pure function of the inputs.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] when the template is unknown or
    /// the arguments lack a referenced field or carry an unrenderable value.
    pub fn render<A>(&self, template: &ScriptTemplate, args: &A) -> Result<String, HypervError>
    where
        A: Serialize + ?Sized,
    {
        let parsed = self
            .env
            .get_template(template.name)
            .map_err(|_| HypervError::validation(template.name, "template is not registered"))?;
        let rendered = parsed
            .render(args)
            .map_err(|err| HypervError::validation(template.name, err.to_string()))?;
        trace!(template = template.name, script = %rendered, "rendered script");
        Ok(rendered)
    }
}

fn check_params(
    template: &ScriptTemplate,
    referenced: &BTreeSet<String>,
) -> Result<(), TemplateError> {
    if let Some(placeholder) = referenced
        .iter()
        .find(|name| !template.params.contains(&name.as_str()))
    {
        return Err(TemplateError::UndeclaredPlaceholder {
            name: template.name.to_owned(),
            placeholder: placeholder.clone(),
        });
    }
    if let Some(param) = template
        .params
        .iter()
        .find(|param| !referenced.contains(**param))
    {
        return Err(TemplateError::UnusedParameter {
            name: template.name.to_owned(),
            param: (*param).to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;
