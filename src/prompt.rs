use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    axis::AxisSpec,
    error::{Error, Result},
    expander::AxisValues,
};

/// Fixed fragments plus the axes that vary between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub fixed_positive: Vec<String>,
    pub axes: Vec<AxisSpec>,
    pub negative: Vec<String>,
}

impl PromptTemplate {
    pub fn axis_names(&self) -> Vec<String> {
        self.axes.iter().map(|a| a.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.axes.is_empty() {
            return Err(Error::config("prompt_template.axes must declare at least one axis"));
        }
        let mut seen = HashSet::new();
        for axis in &self.axes {
            axis.validate()?;
            if !seen.insert(axis.name.as_str()) {
                return Err(Error::config(format!("axis '{}' is declared twice", axis.name)));
            }
        }
        Ok(())
    }

    /// Fixed fragments first, then one slot per axis in declaration order.
    pub fn build_positive(&self, values: &AxisValues) -> String {
        join_prompts(self.fixed_positive.iter().map(String::as_str).chain(values.values()))
    }

    pub fn build_negative(&self) -> String {
        join_prompts(&self.negative)
    }
}

/// Joins prompt fragments with ", ".
/// Blank fragments (such as an explicit "no accessory" choice) contribute no text.
pub fn join_prompts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .filter_map(|p| {
            let p = p.as_ref().trim();
            (!p.is_empty()).then(|| p.to_owned())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
