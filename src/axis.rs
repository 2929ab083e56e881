// Axes are the dimensions of variation in a prompt: hair style, expression, camera angle...
// Each one is an ordered list of candidate fragments, optionally weighted for random draws.

use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_weight() -> f64 {
    1.0
}

/// One candidate value of an axis.
/// In config files this is either a bare string or `{text, weight}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawChoice")]
pub struct Choice {
    pub text: String,
    pub weight: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawChoice {
    Plain(String),
    Weighted {
        text: String,
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

impl From<RawChoice> for Choice {
    fn from(raw: RawChoice) -> Self {
        match raw {
            RawChoice::Plain(text) => Choice::new(text, default_weight()),
            RawChoice::Weighted { text, weight } => Choice::new(text, weight),
        }
    }
}

impl Choice {
    pub fn new(text: impl Into<String>, weight: f64) -> Self {
        Self { text: text.into(), weight }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    pub name: String,
    pub choices: Vec<Choice>,
}

impl AxisSpec {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self { name: name.into(), choices }
    }

    /// Every candidate text in declared order, zero-weight ones included.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.choices.iter().map(|c| c.text.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("axis name must not be empty"));
        }
        if self.choices.is_empty() {
            return Err(Error::config(format!("axis '{}' has no choices", self.name)));
        }
        for choice in &self.choices {
            if !choice.weight.is_finite() || choice.weight < 0.0 {
                return Err(Error::config(format!(
                    "axis '{}': choice {:?} has invalid weight {}",
                    self.name, choice.text, choice.weight
                )));
            }
        }
        Ok(())
    }

    /// Weighted random draw.
    /// Zero-weight choices are never picked, unless there is nothing else to pick.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<&Choice> {
        match self.choices.as_slice() {
            [] => Err(Error::config(format!("axis '{}' has no choices", self.name))),
            [only] => Ok(only),
            choices => {
                let dist = WeightedIndex::new(choices.iter().map(|c| c.weight)).map_err(|e| {
                    Error::config(format!(
                        "axis '{}' cannot be drawn from ({}); give a choice a positive weight",
                        self.name, e
                    ))
                })?;
                Ok(&choices[dist.sample(rng)])
            }
        }
    }
}
