// Turns a prompt template into concrete runs.
//
// Only one axis (the target) is expanded; every other axis contributes exactly one value per
// combination. That keeps a batch at len(target) x sampler x LoRA runs instead of the full
// cross product of all axes.

use std::collections::HashMap;

use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};

use crate::{
    axis::AxisSpec,
    error::{Error, Result},
    prompt::PromptTemplate,
};

/// Value used for each non-target axis when not randomizing.
pub type FixedValues = HashMap<String, String>;

/// Resolved value per axis, in declaration order.
/// Empty values are kept; they are a legitimate choice.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AxisValues(Vec<(String, String)>);

impl AxisValues {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Serialize for AxisValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerChoices {
    pub steps: Vec<u32>,
    pub cfg: Vec<f64>,
    pub sampler_name: Vec<String>,
    pub scheduler: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraChoices {
    pub names: Vec<String>,
    pub model_strength: Vec<f64>,
    pub clip_strength: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerSettings {
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraSettings {
    pub name: String,
    pub model_strength: f64,
    pub clip_strength: f64,
}

impl SamplerChoices {
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty()
            || self.cfg.is_empty()
            || self.sampler_name.is_empty()
            || self.scheduler.is_empty()
        {
            return Err(Error::config(
                "sampler_choices: steps, cfg, sampler_name and scheduler need a value each",
            ));
        }
        Ok(())
    }

    pub fn combinations(&self) -> Vec<SamplerSettings> {
        let mut out = Vec::with_capacity(self.len());
        for &steps in &self.steps {
            for &cfg in &self.cfg {
                for sampler_name in &self.sampler_name {
                    for scheduler in &self.scheduler {
                        out.push(SamplerSettings {
                            steps,
                            cfg,
                            sampler_name: sampler_name.clone(),
                            scheduler: scheduler.clone(),
                        });
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.steps.len() * self.cfg.len() * self.sampler_name.len() * self.scheduler.len()
    }
}

impl LoraChoices {
    pub fn validate(&self) -> Result<()> {
        if self.names.is_empty()
            || self.model_strength.is_empty()
            || self.clip_strength.is_empty()
        {
            return Err(Error::config(
                "lora_choices.names, model_strength and clip_strength each need at least one value",
            ));
        }
        Ok(())
    }

    pub fn combinations(&self) -> Vec<LoraSettings> {
        let mut out = Vec::with_capacity(self.len());
        for name in &self.names {
            for &model_strength in &self.model_strength {
                for &clip_strength in &self.clip_strength {
                    out.push(LoraSettings {
                        name: name.clone(),
                        model_strength,
                        clip_strength,
                    });
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.names.len() * self.model_strength.len() * self.clip_strength.len()
    }
}

/// One concrete parameter set, ready to be patched into the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// 1-based position in the batch.
    pub index: usize,
    pub target_axis: String,
    pub axis_values: AxisValues,
    pub positive: String,
    pub negative: String,
    pub sampler: SamplerSettings,
    pub lora: Option<LoraSettings>,
}

/// Returns the closest axis name, for "did you mean" messages.
pub fn suggest_axis<'a>(axes: &'a [AxisSpec], name: &str) -> Option<&'a str> {
    axes.iter()
        .map(|a| (strsim::levenshtein(name, &a.name), a.name.as_str()))
        .min_by_key(|(distance, _)| *distance)
        .filter(|(distance, _)| *distance <= 3)
        .map(|(_, n)| n)
}

pub fn find_axis<'a>(axes: &'a [AxisSpec], name: &str) -> Result<&'a AxisSpec> {
    axes.iter().find(|a| a.name == name).ok_or_else(|| match suggest_axis(axes, name) {
        Some(best) => Error::config(format!("unknown axis '{}'. Did you mean '{}'?", name, best)),
        None => Error::config(format!("unknown axis '{}'", name)),
    })
}

/// The first declared choice of every axis other than `target`.
pub fn fixed_values(axes: &[AxisSpec], target: &str) -> FixedValues {
    axes.iter()
        .filter(|a| a.name != target)
        .filter_map(|a| a.choices.first().map(|c| (a.name.clone(), c.text.clone())))
        .collect()
}

/// Produces one `AxisValues` per choice of `target`, in declared order.
///
/// Other axes take their value from `fixed`, or are drawn afresh for every combination when
/// `randomize_non_target` is set.
pub fn expand<R: Rng + ?Sized>(
    axes: &[AxisSpec],
    target: &str,
    fixed: &FixedValues,
    randomize_non_target: bool,
    rng: &mut R,
) -> Result<Vec<AxisValues>> {
    let target_axis = find_axis(axes, target)?;
    let mut combinations = Vec::with_capacity(target_axis.choices.len());
    for text in target_axis.values() {
        let mut values = AxisValues::default();
        for axis in axes {
            let value = if axis.name == target {
                text.to_owned()
            } else if randomize_non_target {
                axis.draw(rng)?.text.clone()
            } else {
                fixed.get(&axis.name).cloned().ok_or_else(|| {
                    Error::config(format!("no fixed value for non-target axis '{}'", axis.name))
                })?
            };
            values.push(axis.name.clone(), value);
        }
        debug!("Combination: {:?}", values);
        combinations.push(values);
    }
    Ok(combinations)
}

/// Crosses the expanded target axis with the sampler and LoRA choice lists.
pub fn plan_runs<R: Rng + ?Sized>(
    template: &PromptTemplate,
    sampler: &SamplerChoices,
    lora: Option<&LoraChoices>,
    target: &str,
    randomize_non_target: bool,
    rng: &mut R,
) -> Result<Vec<RunPlan>> {
    let fixed = fixed_values(&template.axes, target);
    let combinations = expand(&template.axes, target, &fixed, randomize_non_target, rng)?;
    let samplers = sampler.combinations();
    let loras: Vec<Option<LoraSettings>> = match lora {
        Some(l) => l.combinations().into_iter().map(Some).collect(),
        None => vec![None],
    };
    let negative = template.build_negative();

    let mut plans = Vec::with_capacity(combinations.len() * samplers.len() * loras.len());
    for axis_values in combinations {
        let positive = template.build_positive(&axis_values);
        for s in &samplers {
            for l in &loras {
                plans.push(RunPlan {
                    index: plans.len() + 1,
                    target_axis: target.to_owned(),
                    axis_values: axis_values.clone(),
                    positive: positive.clone(),
                    negative: negative.clone(),
                    sampler: s.clone(),
                    lora: l.clone(),
                });
            }
        }
    }
    info!("Planned {} combinations for axis '{}'", plans.len(), target);
    Ok(plans)
}

/// Number of runs `plan_runs` would produce (before repeats).
pub fn count_runs(
    template: &PromptTemplate,
    sampler: &SamplerChoices,
    lora: Option<&LoraChoices>,
    target: &str,
) -> Result<usize> {
    let axis = find_axis(&template.axes, target)?;
    Ok(axis.choices.len() * sampler.len() * lora.map_or(1, LoraChoices::len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Choice;
    use rand::{rngs::StdRng, SeedableRng};

    fn axes() -> Vec<AxisSpec> {
        vec![
            AxisSpec::new(
                "hair_style",
                vec![
                    Choice::new("long hair", 1.0),
                    Choice::new("bob cut", 1.0),
                    Choice::new("ponytail", 1.0),
                ],
            ),
            AxisSpec::new(
                "angle",
                vec![
                    Choice::new("front view", 2.0),
                    Choice::new("back view", 0.0),
                    Choice::new("portrait", 3.0),
                ],
            ),
            AxisSpec::new("accessory", vec![Choice::new("", 3.0), Choice::new("glasses", 1.0)]),
        ]
    }

    fn template(axes: Vec<AxisSpec>) -> PromptTemplate {
        PromptTemplate {
            fixed_positive: vec!["1girl".into()],
            axes,
            negative: vec!["bad anatomy".into()],
        }
    }

    fn sampler() -> SamplerChoices {
        SamplerChoices {
            steps: vec![20, 25],
            cfg: vec![7.0],
            sampler_name: vec!["euler".into(), "dpmpp_2m".into()],
            scheduler: vec!["karras".into()],
        }
    }

    #[test]
    fn test_one_combination_per_choice_in_order() {
        let axes = axes();
        let mut rng = StdRng::seed_from_u64(3);
        let fixed = fixed_values(&axes, "hair_style");
        let combos = expand(&axes, "hair_style", &fixed, false, &mut rng).unwrap();
        let styles: Vec<_> = combos.iter().map(|c| c.get("hair_style").unwrap()).collect();
        assert_eq!(styles, vec!["long hair", "bob cut", "ponytail"]);
        for c in &combos {
            assert_eq!(c.get("angle"), Some("front view"));
            assert_eq!(c.get("accessory"), Some(""));
            assert_eq!(
                c.iter().map(|(n, _)| n).collect::<Vec<_>>(),
                vec!["hair_style", "angle", "accessory"]
            );
        }
    }

    #[test]
    fn test_target_keeps_zero_weight_choices() {
        let axes = axes();
        let mut rng = StdRng::seed_from_u64(3);
        let combos = expand(&axes, "angle", &fixed_values(&axes, "angle"), true, &mut rng).unwrap();
        let angles: Vec<_> = combos.iter().map(|c| c.get("angle").unwrap()).collect();
        assert_eq!(angles, vec!["front view", "back view", "portrait"]);
    }

    #[test]
    fn test_randomized_never_draws_zero_weight() {
        let axes = axes();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..300 {
            let combos = expand(&axes, "hair_style", &FixedValues::new(), true, &mut rng).unwrap();
            for c in combos {
                assert_ne!(c.get("angle"), Some("back view"));
            }
        }
    }

    #[test]
    fn test_randomized_rejects_undrawable_axis() {
        let mut axes = axes();
        axes.push(AxisSpec::new(
            "gaze",
            vec![Choice::new("looking up", 0.0), Choice::new("looking down", 0.0)],
        ));
        let mut rng = StdRng::seed_from_u64(1);
        let err = expand(&axes, "hair_style", &FixedValues::new(), true, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        // As the target it is fine: no draw is needed.
        let fixed = fixed_values(&axes, "gaze");
        assert_eq!(expand(&axes, "gaze", &fixed, false, &mut rng).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_fixed_value() {
        let axes = axes();
        let mut rng = StdRng::seed_from_u64(1);
        let err = expand(&axes, "hair_style", &FixedValues::new(), false, &mut rng).unwrap_err();
        assert!(err.to_string().contains("angle"));
    }

    #[test]
    fn test_unknown_axis_suggestion() {
        let axes = axes();
        let mut rng = StdRng::seed_from_u64(1);
        let err = expand(&axes, "hair_styel", &FixedValues::new(), true, &mut rng).unwrap_err();
        assert!(err.to_string().contains("Did you mean 'hair_style'"), "{}", err);
        assert_eq!(suggest_axis(&axes, "completely different"), None);
    }

    #[test]
    fn test_hair_color_scenario() {
        let t = PromptTemplate {
            fixed_positive: vec!["1girl".into()],
            axes: vec![AxisSpec::new(
                "hair_color",
                vec![Choice::new("black hair", 1.0), Choice::new("blonde hair", 1.0)],
            )],
            negative: vec![],
        };
        let sampler = SamplerChoices {
            steps: vec![20],
            cfg: vec![7.0],
            sampler_name: vec!["euler".into()],
            scheduler: vec!["karras".into()],
        };
        let mut rng = StdRng::seed_from_u64(5);
        let plans = plan_runs(&t, &sampler, None, "hair_color", true, &mut rng).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].axis_values.get("hair_color"), Some("black hair"));
        assert_eq!(plans[0].positive, "1girl, black hair");
        assert_eq!(plans[1].axis_values.get("hair_color"), Some("blonde hair"));
        assert_eq!(plans[1].positive, "1girl, blonde hair");
        assert_eq!(plans[1].index, 2);
        assert_eq!(plans[0].lora, None);
    }

    #[test]
    fn test_plan_cross_product() {
        let t = template(axes());
        let lora = LoraChoices {
            names: vec!["a.safetensors".into()],
            model_strength: vec![0.4, 0.8],
            clip_strength: vec![1.0],
        };
        let mut rng = StdRng::seed_from_u64(9);
        let plans = plan_runs(&t, &sampler(), Some(&lora), "hair_style", false, &mut rng).unwrap();
        assert_eq!(plans.len(), 3 * 4 * 2);
        assert_eq!(count_runs(&t, &sampler(), Some(&lora), "hair_style").unwrap(), plans.len());
        assert_eq!(plans[0].positive, "1girl, long hair, front view");
        assert_eq!(plans[0].negative, "bad anatomy");
        assert_eq!(plans[0].lora.as_ref().unwrap().model_strength, 0.4);
        assert_eq!(plans[1].lora.as_ref().unwrap().model_strength, 0.8);
        assert_eq!(plans.last().unwrap().axis_values.get("hair_style"), Some("ponytail"));
    }

    #[test]
    fn test_axis_values_serialize_in_order() {
        let mut v = AxisValues::default();
        v.push("z_axis", "last letter");
        v.push("a_axis", "");
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"z_axis":"last letter","a_axis":""}"#);
    }
}
