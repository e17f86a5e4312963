//! User-authored template catalogs under `~/.azmanagers`.
//!
//! Templates are kept as raw JSON trees so deeply nested resource fields can
//! be patched by path without modeling the whole ARM schema.

use crate::error::{ScaleSetError, ScaleSetResult};
use core_config::azmanagers_dir;
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Which catalog a template lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateKind {
    ScaleSet,
    Vm,
    Nic,
}

impl TemplateKind {
    fn file_name(self) -> &'static str {
        match self {
            TemplateKind::ScaleSet => "templates_scaleset.json",
            TemplateKind::Vm => "templates_vm.json",
            TemplateKind::Nic => "templates_nic.json",
        }
    }

    /// JSON pointer to the profile that carries `osProfile`/`storageProfile`.
    /// Scale sets nest it one level deeper than standalone VMs.
    pub fn profile_pointer(self) -> &'static str {
        match self {
            TemplateKind::ScaleSet => "/properties/virtualMachineProfile",
            TemplateKind::Vm => "/properties",
            TemplateKind::Nic => "/properties",
        }
    }
}

fn catalog_path(kind: TemplateKind) -> ScaleSetResult<PathBuf> {
    Ok(azmanagers_dir()?.join(kind.file_name()))
}

/// Load a whole catalog, keyed by template name. Missing file = empty catalog.
pub fn load_catalog(kind: TemplateKind) -> ScaleSetResult<Map<String, Value>> {
    let path = catalog_path(kind)?;
    if !path.exists() {
        return Ok(Map::new());
    }
    let contents = fs::read_to_string(&path)?;
    let value: Value = serde_json::from_str(&contents)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ScaleSetError::Template(format!(
            "{} is not a JSON object",
            path.display()
        ))),
    }
}

/// Load one template by name.
pub fn load_template(kind: TemplateKind, name: &str) -> ScaleSetResult<Value> {
    let catalog = load_catalog(kind)?;
    catalog.get(name).cloned().ok_or_else(|| {
        ScaleSetError::UnknownTemplate(name.to_string(), kind.file_name().to_string())
    })
}

/// Add or replace a template and persist the catalog.
pub fn save_template(kind: TemplateKind, name: &str, template: Value) -> ScaleSetResult<()> {
    let mut catalog = load_catalog(kind)?;
    catalog.insert(name.to_string(), template);

    let dir = azmanagers_dir()?;
    fs::create_dir_all(&dir)?;
    let path = catalog_path(kind)?;
    fs::write(&path, serde_json::to_string_pretty(&Value::Object(catalog))?)?;
    debug!(path = %path.display(), name, "Saved template");
    Ok(())
}

/// Names available in a catalog.
pub fn template_names(kind: TemplateKind) -> ScaleSetResult<Vec<String>> {
    Ok(load_catalog(kind)?.keys().cloned().collect())
}

/// Walk `path` below `root`, creating empty objects along the way, and return
/// the final node. Any non-object encountered on the way is replaced.
pub fn ensure_object_path<'a>(root: &'a mut Value, path: &[&str]) -> &'a mut Value {
    let mut node = root;
    for key in path {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .expect("just ensured an object")
            .entry(key.to_string())
            .or_insert(Value::Object(Map::new()));
    }
    node
}

/// Append an entry to `linuxConfiguration.ssh.publicKeys` so the master can
/// reach the instances as `user`.
pub fn add_public_key(template: &mut Value, kind: TemplateKind, user: &str, key_data: &str) {
    let mut path: Vec<&str> = kind
        .profile_pointer()
        .trim_start_matches('/')
        .split('/')
        .collect();
    path.extend(["osProfile", "linuxConfiguration", "ssh", "publicKeys"]);

    let keys = ensure_object_path(template, &path);
    if !keys.is_array() {
        *keys = Value::Array(Vec::new());
    }
    keys.as_array_mut()
        .expect("just ensured an array")
        .push(serde_json::json!({
            "path": format!("/home/{user}/.ssh/authorized_keys"),
            "keyData": key_data,
        }));
}
