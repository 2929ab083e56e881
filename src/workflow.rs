// ComfyUI API-format workflow graphs.
//
// The graph is foreign data: node id -> {class_type, inputs: {...}}. We never interpret
// class_type. Nodes are addressed purely by id and input name, and everything we don't
// explicitly patch must go back to the server exactly as it was loaded.

use std::path::Path;

use log::{debug, trace};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::NodeMapping,
    error::{Error, Result},
    expander::RunPlan,
    utils,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowGraph(Map<String, Value>);

/// Replace `inputs[field]` of node `node_id` with `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub node_id: String,
    pub field: String,
    pub value: Value,
}

impl Patch {
    pub fn new(
        node_id: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Inputs wired to another node look like `["4", 0]`.
fn is_link(value: &Value) -> bool {
    match value.as_array().map(Vec::as_slice) {
        Some([node, slot]) => (node.is_string() || node.is_u64()) && slot.is_u64(),
        _ => false,
    }
}

impl WorkflowGraph {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(WorkflowGraph(map)),
            other => Err(Error::config(format!(
                "workflow root must be a JSON object of nodes, got {}",
                match other {
                    Value::Array(_) => "an array",
                    Value::String(_) => "a string",
                    Value::Number(_) => "a number",
                    Value::Bool(_) => "a boolean",
                    _ => "null",
                }
            ))),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::config(format!("workflow {} not found", path.display()))
            }
            _ => Error::io(format!("failed to read workflow {}", path.display()), e),
        })?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| {
                Error::config(format!("workflow {} is not valid JSON: {}", path.display(), e))
            })?;
        let graph = Self::from_value(value)?;
        debug!("Loaded workflow {} ({} nodes)", path.display(), graph.len());
        Ok(graph)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        utils::write_json(path, self)
    }

    #[cfg(test)]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.0.contains_key(node_id)
    }

    /// Current value of an input field, if both exist.
    #[cfg(test)]
    pub fn get(&self, node_id: &str, field: &str) -> Option<&Value> {
        self.0.get(node_id)?.get("inputs")?.get(field)
    }

    fn inputs(&self, node_id: &str, field: &str) -> Result<&Map<String, Value>> {
        let node = self.0.get(node_id).ok_or_else(|| Error::NodeNotFound {
            node_id: node_id.to_owned(),
        })?;
        node.get("inputs")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::FieldNotFound {
                node_id: node_id.to_owned(),
                field: field.to_owned(),
            })
    }

    /// Checks a patch could be applied, without applying it.
    pub fn check(&self, patch: &Patch) -> Result<()> {
        let inputs = self.inputs(&patch.node_id, &patch.field)?;
        match inputs.get(&patch.field) {
            None => Err(Error::FieldNotFound {
                node_id: patch.node_id.clone(),
                field: patch.field.clone(),
            }),
            Some(v) if is_link(v) => Err(Error::FieldIsLink {
                node_id: patch.node_id.clone(),
                field: patch.field.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Returns a copy of the graph with every patch applied.
    /// All patches are checked first; on error nothing has been written anywhere.
    pub fn patch(&self, patches: &[Patch]) -> Result<WorkflowGraph> {
        for p in patches {
            self.check(p)?;
        }
        let mut out = self.clone();
        for p in patches {
            trace!("Patching {}.{} = {}", p.node_id, p.field, p.value);
            if let Some(slot) = out
                .0
                .get_mut(&p.node_id)
                .and_then(|n| n.get_mut("inputs"))
                .and_then(Value::as_object_mut)
                .and_then(|inputs| inputs.get_mut(&p.field))
            {
                *slot = p.value.clone();
            }
        }
        Ok(out)
    }
}

impl NodeMapping {
    fn mapped_nodes(&self) -> Vec<&str> {
        let mut ids = vec![
            self.positive_prompt.as_str(),
            self.negative_prompt.as_str(),
            self.ksampler.as_str(),
        ];
        ids.extend(self.save_image.as_deref());
        ids.extend(self.lora.as_deref());
        ids
    }

    /// Every mapped node must exist in `graph`.
    pub fn validate(&self, graph: &WorkflowGraph) -> Result<()> {
        for id in self.mapped_nodes() {
            if !graph.contains_node(id) {
                return Err(Error::NodeNotFound { node_id: id.to_owned() });
            }
        }
        Ok(())
    }

    /// Patches that turn the exploration workflow into `plan`.
    pub fn explore_patches(&self, plan: &RunPlan, seed: u64, filename_prefix: &str) -> Vec<Patch> {
        let mut patches = vec![
            Patch::new(&self.positive_prompt, "text", plan.positive.as_str()),
            Patch::new(&self.negative_prompt, "text", plan.negative.as_str()),
            Patch::new(&self.ksampler, "steps", plan.sampler.steps),
            Patch::new(&self.ksampler, "cfg", plan.sampler.cfg),
            Patch::new(&self.ksampler, "sampler_name", plan.sampler.sampler_name.as_str()),
            Patch::new(&self.ksampler, "scheduler", plan.sampler.scheduler.as_str()),
            Patch::new(&self.ksampler, "seed", seed),
        ];
        if let (Some(node), Some(lora)) = (&self.lora, &plan.lora) {
            patches.push(Patch::new(node, "lora_name", lora.name.as_str()));
            patches.push(Patch::new(node, "strength_model", lora.model_strength));
            patches.push(Patch::new(node, "strength_clip", lora.clip_strength));
        }
        if let Some(node) = &self.save_image {
            patches.push(Patch::new(node, "filename_prefix", filename_prefix));
        }
        patches
    }
}
