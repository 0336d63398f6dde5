//! vApp property overrides.

use std::collections::{BTreeMap, HashMap};

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::{ArrayOperation, VAppConfigSpec, VAppProperty, VAppPropertySpec};

/// Merge `overrides` into a VM's vApp property schema.
///
/// No overrides yields `None`. Every override must name an existing,
/// user-configurable property.
pub fn merge_properties(
    schema: Option<&[VAppProperty]>,
    overrides: &HashMap<String, String>,
) -> VsphereResult<Option<VAppConfigSpec>> {
    if overrides.is_empty() {
        return Ok(None);
    }
    let schema = schema.ok_or_else(|| {
        VsphereError::new(
            VsphereErrorKind::InvalidVAppProperty,
            "this VM lacks a vApp configuration and cannot have vApp properties set on it",
        )
    })?;

    let mut remaining: BTreeMap<&str, &str> = overrides
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut properties = Vec::new();

    for prop in schema {
        let Some(value) = remaining.remove(prop.id.as_str()) else {
            continue;
        };
        if !prop.user_configurable {
            return Err(VsphereError::new(
                VsphereErrorKind::InvalidVAppProperty,
                format!("vApp property with userConfigurable=false specified in vapp.properties: {}", prop.id),
            ));
        }
        properties.push(VAppPropertySpec {
            operation: ArrayOperation::Edit,
            info: VAppProperty {
                key: prop.key,
                id: prop.id.clone(),
                value: value.to_string(),
                default_value: prop.default_value.clone(),
                user_configurable: true,
            },
        });
    }

    if !remaining.is_empty() {
        let keys: Vec<&str> = remaining.into_keys().collect();
        return Err(VsphereError::new(
            VsphereErrorKind::InvalidVAppProperty,
            format!("unsupported vApp properties in vapp.properties: {}", keys.join(", ")),
        ));
    }

    Ok(Some(VAppConfigSpec { properties }))
}
