//! Tool invocation templates
//!
//! Each stage runs one external tool described by a [`ToolSpec`]. Arguments
//! and environment values may contain `{name}` placeholders that are filled
//! in from the deployment before the process is spawned; `{{` and `}}`
//! produce literal braces.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::deploy::process::ProcessInvocation;
use crate::errors::EngineError;
use crate::models::deployment::{Deployment, StageName};

/// Program and argument templates for one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ToolSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Fill in every template and build the invocation
    pub fn resolve(&self, context: &TemplateContext) -> Result<ProcessInvocation, EngineError> {
        let program = context.render(&self.program)?;
        let args = self
            .args
            .iter()
            .map(|arg| context.render(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let mut invocation = ProcessInvocation::new(program, context.workdir()).args(args);
        for (key, value) in &self.env {
            invocation.env.push((key.clone(), context.render(value)?));
        }
        Ok(invocation)
    }
}

/// Tools for every stage, plus the teardown tool used on delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSet {
    #[serde(default = "default_provision_tool")]
    pub provision: ToolSpec,
    #[serde(default = "default_configure_tool")]
    pub configure: ToolSpec,
    #[serde(default = "default_teardown_tool")]
    pub teardown: ToolSpec,
}

impl ToolSet {
    pub fn for_stage(&self, stage: StageName) -> &ToolSpec {
        match stage {
            StageName::Provision => &self.provision,
            StageName::Configure => &self.configure,
        }
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self {
            provision: default_provision_tool(),
            configure: default_configure_tool(),
            teardown: default_teardown_tool(),
        }
    }
}

const TERRAFORM_VARS: &str =
    "-var deployment_id={deployment_id} -var region={region} -var instance_type={instance_type}";

fn default_provision_tool() -> ToolSpec {
    // init, apply, then leave the outputs where the configure stage finds them
    ToolSpec::new("/bin/sh").with_args([
        "-c".to_string(),
        format!(
            "terraform init -input=false && \
             terraform apply -auto-approve -input=false {} && \
             terraform output -json > outputs.json",
            TERRAFORM_VARS
        ),
    ])
}

fn default_configure_tool() -> ToolSpec {
    ToolSpec::new("ansible-playbook")
        .with_args([
            "-i",
            "{output.public_ip},",
            "configure.yml",
            "--extra-vars",
            "{extra_vars}",
        ])
        .with_env("ANSIBLE_HOST_KEY_CHECKING", "False")
}

fn default_teardown_tool() -> ToolSpec {
    ToolSpec::new("/bin/sh").with_args([
        "-c".to_string(),
        format!("terraform destroy -auto-approve -input=false {}", TERRAFORM_VARS),
    ])
}

/// Values available to tool templates
#[derive(Debug, Clone)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
    workdir: String,
}

impl TemplateContext {
    pub fn new(deployment: &Deployment, workdir: &Path) -> Result<Self, EngineError> {
        let params = &deployment.params;
        let workdir = workdir.display().to_string();

        let mut extra_vars = params.env_vars.clone();
        extra_vars.insert("project".to_string(), params.project.clone());
        extra_vars.insert("branch".to_string(), params.branch.clone());
        let extra_vars = serde_json::to_string(&extra_vars)?;

        let mut values = BTreeMap::new();
        values.insert("deployment_id".to_string(), deployment.id.to_string());
        values.insert("provider".to_string(), params.provider.to_string());
        values.insert("region".to_string(), params.region.clone());
        values.insert("instance_size".to_string(), params.instance_size.clone());
        values.insert("instance_type".to_string(), params.instance_type());
        values.insert("project".to_string(), params.project.clone());
        values.insert("branch".to_string(), params.branch.clone());
        values.insert("workdir".to_string(), workdir.clone());
        values.insert("extra_vars".to_string(), extra_vars);
        for (key, value) in &deployment.outputs {
            values.insert(format!("output.{}", key), value.clone());
        }

        Ok(Self { values, workdir })
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every `{name}` in `template`
    pub fn render(&self, template: &str) -> Result<String, EngineError> {
        let mut rendered = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    rendered.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    rendered.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(EngineError::ConfigError(format!(
                            "unterminated placeholder in template '{}'",
                            template
                        )));
                    }
                    let value = self.get(name.trim()).ok_or_else(|| {
                        EngineError::ConfigError(format!(
                            "unknown placeholder '{{{}}}' in template '{}'",
                            name, template
                        ))
                    })?;
                    rendered.push_str(value);
                }
                c => rendered.push(c),
            }
        }

        Ok(rendered)
    }
}

/// Parse `outputs.json`: either a flat object or `{key: {"value": ...}}`
pub fn parse_outputs(contents: &str) -> Result<BTreeMap<String, String>, EngineError> {
    let value: serde_json::Value = serde_json::from_str(contents)?;
    let object = value.as_object().ok_or_else(|| {
        EngineError::ValidationError("provisioning outputs must be a JSON object".to_string())
    })?;

    let mut outputs = BTreeMap::new();
    for (key, value) in object {
        let value = match value {
            serde_json::Value::Object(inner) => match inner.get("value") {
                Some(inner) => inner,
                None => continue,
            },
            other => other,
        };
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        outputs.insert(key.clone(), text);
    }
    Ok(outputs)
}
