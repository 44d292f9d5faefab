//! Stack templates
//!
//! A template is a YAML document with a single `Resources` mapping from
//! logical id to `{Type, Properties}`. Property values may be `{Ref: <id>}`
//! to use the physical id of another resource of the same stack.
//!
//! ```yaml
//! Resources:
//!   MyVPC:
//!     Type: VPC
//!     Properties:
//!       Name: web
//!       CIDRBlock: 10.0.0.0/16
//!   Web:
//!     Type: Instance
//!     Properties:
//!       Image: nginx:alpine
//!       VpcID: { Ref: MyVPC }
//! ```

use crate::error::{CloudError, Result};
use crate::model::PortMapping;
use crate::net::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

/// Resource kinds a stack can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "VPC")]
    Vpc,
    Subnet,
    Volume,
    Instance,
    Snapshot,
}

impl ResourceType {
    /// Creation passes, in order. No reference can point backwards across them.
    pub const PASSES: [ResourceType; 5] = [
        ResourceType::Vpc,
        ResourceType::Subnet,
        ResourceType::Volume,
        ResourceType::Instance,
        ResourceType::Snapshot,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VPC" => Some(ResourceType::Vpc),
            "Subnet" => Some(ResourceType::Subnet),
            "Volume" => Some(ResourceType::Volume),
            "Instance" => Some(ResourceType::Instance),
            "Snapshot" => Some(ResourceType::Snapshot),
            _ => None,
        }
    }

    fn pass(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Vpc => write!(f, "VPC"),
            ResourceType::Subnet => write!(f, "Subnet"),
            ResourceType::Volume => write!(f, "Volume"),
            ResourceType::Instance => write!(f, "Instance"),
            ResourceType::Snapshot => write!(f, "Snapshot"),
        }
    }
}

/// A property value before reference resolution
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Literal(String),
    Ref(String),
}

/// One entry of `Resources`
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateResource {
    pub logical_id: String,
    pub type_name: String,
    pub properties: Mapping,
}

impl TemplateResource {
    pub fn resource_type(&self) -> Option<ResourceType> {
        ResourceType::parse(&self.type_name)
    }

    pub fn property(&self, key: &str) -> Result<Option<PropertyValue>> {
        let Some(value) = self.properties.get(key) else {
            return Ok(None);
        };
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(PropertyValue::Literal(s.clone()))),
            Value::Number(n) => Ok(Some(PropertyValue::Literal(n.to_string()))),
            Value::Bool(b) => Ok(Some(PropertyValue::Literal(b.to_string()))),
            Value::Mapping(m) => match (m.len(), m.get("Ref")) {
                (1, Some(Value::String(target))) => Ok(Some(PropertyValue::Ref(target.clone()))),
                _ => Err(self.bad_property(key, "expected a scalar or {Ref: <logical-id>}")),
            },
            _ => Err(self.bad_property(key, "expected a scalar or {Ref: <logical-id>}")),
        }
    }

    /// Property with `Ref`s replaced by physical ids from `resolved`
    pub fn resolve(&self, key: &str, resolved: &HashMap<String, Uuid>) -> Result<Option<String>> {
        match self.property(key)? {
            None => Ok(None),
            Some(PropertyValue::Literal(s)) => Ok(Some(s)),
            Some(PropertyValue::Ref(target)) => resolved
                .get(&target)
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| {
                    CloudError::invalid(format!(
                        "{}.{}: Ref '{}' does not name an earlier resource",
                        self.logical_id, key, target
                    ))
                }),
        }
    }

    /// `Name`, falling back to the logical id
    pub fn name(&self) -> Result<String> {
        match self.property("Name")? {
            Some(PropertyValue::Literal(name)) if !name.is_empty() => Ok(name),
            Some(PropertyValue::Ref(_)) => Err(self.bad_property("Name", "cannot be a Ref")),
            _ => Ok(self.logical_id.clone()),
        }
    }

    pub fn literal(&self, key: &str) -> Result<Option<String>> {
        match self.property(key)? {
            Some(PropertyValue::Ref(_)) => Err(self.bad_property(key, "cannot be a Ref")),
            Some(PropertyValue::Literal(s)) => Ok(Some(s)),
            None => Ok(None),
        }
    }

    fn bad_property(&self, key: &str, why: &str) -> CloudError {
        CloudError::invalid(format!("{}.{}: {}", self.logical_id, key, why))
    }

    fn refs(&self) -> Vec<(String, String)> {
        self.properties
            .iter()
            .filter_map(|(k, _)| {
                let key = k.as_str()?;
                match self.property(key) {
                    Ok(Some(PropertyValue::Ref(target))) => Some((key.to_string(), target)),
                    _ => None,
                }
            })
            .collect()
    }
}

/// Parsed template, resources in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub resources: Vec<TemplateResource>,
    /// Top-level keys other than `Resources`
    pub extra_keys: Vec<String>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text)
            .map_err(|e| CloudError::invalid(format!("template is not valid YAML: {}", e)))?;
        let Value::Mapping(root) = doc else {
            return Err(CloudError::invalid("template must be a YAML mapping"));
        };

        let mut extra_keys = Vec::new();
        let mut resources = Vec::new();
        for (key, value) in &root {
            let key = key.as_str().unwrap_or_default();
            if key != "Resources" {
                extra_keys.push(key.to_string());
                continue;
            }
            let entries = match value {
                Value::Mapping(m) => m.clone(),
                Value::Null => Mapping::new(),
                _ => return Err(CloudError::invalid("Resources must be a mapping")),
            };
            for (logical_id, body) in entries {
                let logical_id = logical_id
                    .as_str()
                    .ok_or_else(|| CloudError::invalid("logical ids must be strings"))?
                    .to_string();
                resources.push(parse_resource(logical_id, body)?);
            }
        }

        if !root.contains_key("Resources") {
            return Err(CloudError::invalid("template has no Resources section"));
        }

        Ok(Self {
            resources,
            extra_keys,
        })
    }

    /// Resources in creation order: by pass, then declaration order.
    /// Unknown types are skipped.
    pub fn plan(&self) -> Vec<(ResourceType, &TemplateResource)> {
        let mut plan = Vec::with_capacity(self.resources.len());
        for pass in ResourceType::PASSES {
            for res in &self.resources {
                if res.resource_type() == Some(pass) {
                    plan.push((pass, res));
                }
            }
        }
        for res in &self.resources {
            if res.resource_type().is_none() {
                warn!(
                    logical_id = %res.logical_id,
                    resource_type = %res.type_name,
                    "skipping resource of unknown type"
                );
            }
        }
        plan
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for key in &self.extra_keys {
            errors.push(format!("unsupported top-level key '{}'", key));
        }
        if self.resources.is_empty() {
            errors.push("template declares no resources".to_string());
        }

        let types: HashMap<&str, Option<ResourceType>> = self
            .resources
            .iter()
            .map(|r| (r.logical_id.as_str(), r.resource_type()))
            .collect();

        for res in &self.resources {
            let Some(ty) = res.resource_type() else {
                errors.push(format!(
                    "{}: unknown resource type '{}'",
                    res.logical_id, res.type_name
                ));
                continue;
            };
            for (key, target) in res.refs() {
                match types.get(target.as_str()) {
                    None => errors.push(format!(
                        "{}.{}: Ref '{}' does not exist",
                        res.logical_id, key, target
                    )),
                    Some(Some(target_ty)) if target_ty.pass() >= ty.pass() => {
                        errors.push(format!(
                            "{}.{}: Ref '{}' ({}) is not created before {}",
                            res.logical_id, key, target, target_ty, ty
                        ))
                    }
                    _ => {}
                }
            }
            if let Err(e) = check_properties(ty, res) {
                errors.push(message_of(e));
            }
        }
        errors
    }
}

fn parse_resource(logical_id: String, body: Value) -> Result<TemplateResource> {
    let Value::Mapping(body) = body else {
        return Err(CloudError::invalid(format!(
            "{}: resource must be a mapping",
            logical_id
        )));
    };
    let type_name = body
        .get("Type")
        .and_then(Value::as_str)
        .ok_or_else(|| CloudError::invalid(format!("{}: missing Type", logical_id)))?
        .to_string();
    let properties = match body.get("Properties") {
        Some(Value::Mapping(m)) => m.clone(),
        None | Some(Value::Null) => Mapping::new(),
        Some(_) => {
            return Err(CloudError::invalid(format!(
                "{}: Properties must be a mapping",
                logical_id
            )));
        }
    };
    Ok(TemplateResource {
        logical_id,
        type_name,
        properties,
    })
}

fn require(res: &TemplateResource, key: &str) -> Result<()> {
    match res.property(key)? {
        Some(_) => Ok(()),
        None => Err(res.bad_property(key, "is required")),
    }
}

fn check_properties(ty: ResourceType, res: &TemplateResource) -> Result<()> {
    res.name()?;
    match ty {
        ResourceType::Vpc => {
            if let Some(cidr) = res.literal("CIDRBlock")? {
                cidr.parse::<Ipv4Cidr>()?;
            }
        }
        ResourceType::Subnet => {
            require(res, "VpcID")?;
            let cidr = res
                .literal("CIDRBlock")?
                .ok_or_else(|| res.bad_property("CIDRBlock", "is required"))?;
            cidr.parse::<Ipv4Cidr>()?;
        }
        ResourceType::Volume => {
            volume_size(res)?;
        }
        ResourceType::Instance => {
            require(res, "Image")?;
            instance_ports(res)?;
        }
        ResourceType::Snapshot => require(res, "VolumeID")?,
    }
    Ok(())
}

pub const DEFAULT_VOLUME_SIZE_GB: u32 = 10;
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";

/// `Size` of a Volume resource in GB
pub fn volume_size(res: &TemplateResource) -> Result<u32> {
    match res.literal("Size")? {
        None => Ok(DEFAULT_VOLUME_SIZE_GB),
        Some(size) => match size.parse::<u32>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(res.bad_property("Size", "must be a positive integer")),
        },
    }
}

/// `Port` of an Instance resource: `80`, `"8080:80"` or `"53/udp"`
pub fn instance_ports(res: &TemplateResource) -> Result<Vec<PortMapping>> {
    match res.literal("Port")? {
        None => Ok(Vec::new()),
        Some(port) => Ok(vec![port.parse::<PortMapping>()?]),
    }
}

fn message_of(err: CloudError) -> String {
    match err {
        CloudError::InvalidInput(msg) => msg,
        other => other.to_string(),
    }
}

/// Result of `validate_template`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Checks a template without creating anything
pub fn validate_template(text: &str) -> ValidationReport {
    let errors = match Template::parse(text) {
        Ok(template) => template.validate(),
        Err(e) => vec![message_of(e)],
    };
    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}
