// Helper functions for extracting values from KDL nodes

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// A non-negative integer property, rejected if it has the wrong type.
pub(crate) fn u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let int = value
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(name, "expected an integer"))?;
    u64::try_from(int)
        .map(Some)
        .map_err(|_| ConfigError::invalid(name, format!("{} is out of range", int)))
}

/// Values of a repeated property (`channels="a" channels="b"`) or of a child
/// node with the same name (`channels "a" "b"`).
pub(crate) fn string_list(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(all_string_args(child));
            }
        }
    }

    result
}
