//! AgentSpec/FlatAgent expansion (spec.md §3, §4.D).

use serde::{Deserialize, Serialize};

use crate::tmux::AgentType;

/// A variant request within an [`AgentSpec`]: `count` agents running
/// `model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub count: u32,
    pub model: String,
}

/// Requested `{type, count, model|variants}`. `count` and `variants` are
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub count: Option<u32>,
    pub model: Option<String>,
    pub variants: Option<Vec<Variant>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("agent spec for '{agent_type}' must have count > 0")]
    ZeroCount { agent_type: AgentType },
    #[error("variant count for '{agent_type}' must be > 0")]
    ZeroVariantCount { agent_type: AgentType },
    #[error("agent spec for '{agent_type}' cannot set both count and variants")]
    BothCountAndVariants { agent_type: AgentType },
    #[error("malformed agent spec: {0}")]
    Malformed(String),
}

impl AgentSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        match (&self.count, &self.variants) {
            (Some(_), Some(_)) => Err(SpecError::BothCountAndVariants {
                agent_type: self.agent_type,
            }),
            (Some(count), None) => {
                if *count == 0 {
                    Err(SpecError::ZeroCount {
                        agent_type: self.agent_type,
                    })
                } else {
                    Ok(())
                }
            }
            (None, Some(variants)) => {
                if variants.iter().any(|v| v.count == 0) {
                    Err(SpecError::ZeroVariantCount {
                        agent_type: self.agent_type,
                    })
                } else {
                    Ok(())
                }
            }
            (None, None) => Err(SpecError::Malformed(
                "must set either count or variants".to_string(),
            )),
        }
    }
}

/// The expanded form `{type, index, model}` where `index` starts at 1
/// per type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatAgent {
    pub agent_type: AgentType,
    pub index: u32,
    pub model: Option<String>,
}

/// Renders an `AgentSpec` as a compact `type:count[@model]` or, for
/// variants, `type:count1@model1,count2@model2,` string (spec.md §8's
/// `ParseAgentSpec(FormatAgentSpec(x)) = x` law). The variants form always
/// carries a trailing comma, including for a single variant — without it,
/// `type:1@model` is indistinguishable from a plain count-with-model spec
/// and the round trip would silently drop the variants.
pub fn format_agent_spec(spec: &AgentSpec) -> String {
    let type_str = spec.agent_type.as_str();
    if let Some(variants) = &spec.variants {
        let parts: String = variants
            .iter()
            .map(|v| format!("{}@{},", v.count, v.model))
            .collect();
        return format!("{type_str}:{parts}");
    }
    let count = spec.count.unwrap_or(0);
    match &spec.model {
        Some(model) => format!("{type_str}:{count}@{model}"),
        None => format!("{type_str}:{count}"),
    }
}

/// Parses the `type:count[@model]` / `type:count1@model1,count2@model2,`
/// form produced by [`format_agent_spec`] back into an `AgentSpec`. Does
/// not call [`AgentSpec::validate`]; callers validate separately the same
/// way a spec built by hand would be.
pub fn parse_agent_spec(text: &str) -> Result<AgentSpec, SpecError> {
    let (type_str, rest) = text
        .split_once(':')
        .ok_or_else(|| SpecError::Malformed(format!("missing ':' in '{text}'")))?;
    let agent_type: AgentType = type_str
        .parse()
        .map_err(|_| SpecError::Malformed(format!("unknown agent type '{type_str}'")))?;

    if let Some(list) = rest.strip_suffix(',') {
        let variants = list
            .split(',')
            .map(|part| {
                let (count_str, model) = part
                    .split_once('@')
                    .ok_or_else(|| SpecError::Malformed(format!("variant '{part}' missing '@model'")))?;
                let count: u32 = count_str
                    .parse()
                    .map_err(|_| SpecError::Malformed(format!("invalid count in '{part}'")))?;
                Ok(Variant {
                    count,
                    model: model.to_string(),
                })
            })
            .collect::<Result<Vec<_>, SpecError>>()?;
        return Ok(AgentSpec {
            agent_type,
            count: None,
            model: None,
            variants: Some(variants),
        });
    }

    let (count_str, model) = match rest.split_once('@') {
        Some((count_str, model)) => (count_str, Some(model.to_string())),
        None => (rest, None),
    };
    let count: u32 = count_str
        .parse()
        .map_err(|_| SpecError::Malformed(format!("invalid count in '{text}'")))?;
    Ok(AgentSpec {
        agent_type,
        count: Some(count),
        model,
        variants: None,
    })
}

/// Expands a list of `AgentSpec`s into the flat per-pane plan, in
/// declaration order, indices 1-based per agent type.
pub fn expand_agent_specs(specs: &[AgentSpec]) -> Result<Vec<FlatAgent>, SpecError> {
    let mut flat = Vec::new();
    for spec in specs {
        spec.validate()?;
        let mut index = 1;
        if let Some(count) = spec.count {
            for _ in 0..count {
                flat.push(FlatAgent {
                    agent_type: spec.agent_type,
                    index,
                    model: spec.model.clone(),
                });
                index += 1;
            }
        } else if let Some(variants) = &spec.variants {
            for variant in variants {
                for _ in 0..variant.count {
                    flat.push(FlatAgent {
                        agent_type: spec.agent_type,
                        index,
                        model: Some(variant.model.clone()),
                    });
                    index += 1;
                }
            }
        }
    }
    Ok(flat)
}
