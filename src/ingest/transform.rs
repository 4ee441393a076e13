//! Field transforms applied to each record before analysis, in the order the
//! job configures them.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{EngineError, Result};
use crate::job::types::{Condition, Operator, TransformConfig, TransformType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    Keep { failed: u64 },
    Exclude,
}

#[derive(Debug)]
enum ExcludeTest {
    Equals(String),
    Matches(Regex),
    Numeric(Operator, f64),
}

impl ExcludeTest {
    fn compile(condition: &Condition) -> Result<Self> {
        let value = condition.value.clone().unwrap_or_default();
        match condition.operator {
            Operator::Eq => Ok(ExcludeTest::Equals(value)),
            Operator::Match => Regex::new(&format!("^(?:{value})$"))
                .map(ExcludeTest::Matches)
                .map_err(|err| EngineError::invalid_value(format!("invalid exclude pattern '{value}': {err}"))),
            operator => value
                .parse::<f64>()
                .map(|threshold| ExcludeTest::Numeric(operator, threshold))
                .map_err(|_| EngineError::invalid_value(format!("invalid exclude threshold '{value}'"))),
        }
    }

    fn matches(&self, field: &str) -> bool {
        match self {
            ExcludeTest::Equals(expected) => field == expected,
            ExcludeTest::Matches(regex) => regex.is_match(field),
            ExcludeTest::Numeric(operator, threshold) => {
                let Ok(value) = field.trim().parse::<f64>() else {
                    return false;
                };
                match operator {
                    Operator::Gt => value > *threshold,
                    Operator::Gte => value >= *threshold,
                    Operator::Lt => value < *threshold,
                    Operator::Lte => value <= *threshold,
                    Operator::Eq | Operator::Match => false,
                }
            }
        }
    }
}

#[derive(Debug)]
enum Step {
    Exclude { input: String, test: ExcludeTest },
    Split { input: String, regex: Regex, outputs: Vec<String> },
    Extract { input: String, regex: Regex, outputs: Vec<String> },
    Concat { inputs: Vec<String>, delimiter: String, output: String },
    Case { input: String, output: String, kind: TransformType },
}

#[derive(Debug, Default)]
pub struct TransformPipeline {
    steps: Vec<Step>,
}

impl TransformPipeline {
    pub fn compile(transforms: &[TransformConfig]) -> Result<Self> {
        let steps = transforms
            .iter()
            .map(compile_step)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step over `fields`. A step whose input is missing or whose
    /// pattern does not match counts as failed and leaves its outputs unset.
    pub fn apply(&self, fields: &mut HashMap<String, String>) -> TransformOutcome {
        let mut failed = 0;
        for step in &self.steps {
            match step {
                Step::Exclude { input, test } => {
                    if fields.get(input).is_some_and(|value| test.matches(value)) {
                        return TransformOutcome::Exclude;
                    }
                }
                Step::Split { input, regex, outputs } => {
                    let Some(value) = fields.get(input).cloned() else {
                        failed += 1;
                        continue;
                    };
                    for (output, part) in outputs.iter().zip(regex.split(&value)) {
                        fields.insert(output.clone(), part.to_string());
                    }
                }
                Step::Extract { input, regex, outputs } => {
                    let captures = fields
                        .get(input)
                        .and_then(|value| regex.captures(value))
                        .map(|caps| {
                            outputs
                                .iter()
                                .zip(caps.iter().skip(1))
                                .filter_map(|(output, group)| {
                                    group.map(|g| (output.clone(), g.as_str().to_string()))
                                })
                                .collect::<Vec<_>>()
                        });
                    match captures {
                        Some(values) => fields.extend(values),
                        None => failed += 1,
                    }
                }
                Step::Concat { inputs, delimiter, output } => {
                    let parts: Option<Vec<&str>> =
                        inputs.iter().map(|i| fields.get(i).map(String::as_str)).collect();
                    match parts {
                        Some(parts) => {
                            let joined = parts.join(delimiter.as_str());
                            fields.insert(output.clone(), joined);
                        }
                        None => failed += 1,
                    }
                }
                Step::Case { input, output, kind } => {
                    let Some(value) = fields.get(input) else {
                        failed += 1;
                        continue;
                    };
                    let converted = match kind {
                        TransformType::Lowercase => value.to_lowercase(),
                        TransformType::Uppercase => value.to_uppercase(),
                        _ => value.trim().to_string(),
                    };
                    fields.insert(output.clone(), converted);
                }
            }
        }
        TransformOutcome::Keep { failed }
    }
}

fn compile_step(config: &TransformConfig) -> Result<Step> {
    let kind = config.transform_type().ok_or_else(|| {
        EngineError::invalid_value(format!("Unknown transform type '{}'", config.transform))
    })?;
    let first_input = || {
        config.inputs.first().cloned().ok_or_else(|| {
            EngineError::invalid_value(format!("Transform '{}' requires an input", config.transform))
        })
    };
    let regex = || {
        let pattern = config.arguments.first().map(String::as_str).unwrap_or_default();
        Regex::new(pattern).map_err(|err| {
            EngineError::invalid_value(format!("invalid regular expression '{pattern}': {err}"))
        })
    };
    let step = match kind {
        TransformType::Exclude => Step::Exclude {
            input: first_input()?,
            test: match &config.condition {
                Some(condition) => ExcludeTest::compile(condition)?,
                None => return Err(EngineError::invalid_value("Transform 'exclude' requires a condition")),
            },
        },
        TransformType::Split => Step::Split {
            input: first_input()?,
            regex: regex()?,
            outputs: config.outputs.clone(),
        },
        TransformType::Extract => Step::Extract {
            input: first_input()?,
            regex: regex()?,
            outputs: config.outputs.clone(),
        },
        TransformType::Concat => Step::Concat {
            inputs: config.inputs.clone(),
            delimiter: config.arguments.first().cloned().unwrap_or_default(),
            output: config.effective_outputs().into_iter().next().unwrap_or_default(),
        },
        TransformType::Lowercase | TransformType::Uppercase | TransformType::Trim => {
            let input = first_input()?;
            let output = config
                .effective_outputs()
                .into_iter()
                .next()
                .unwrap_or_else(|| input.clone());
            Step::Case { input, output, kind }
        }
    };
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(name: &str, inputs: &[&str], outputs: &[&str], arguments: &[&str]) -> TransformConfig {
        TransformConfig {
            transform: name.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            arguments: arguments.iter().map(|s| s.to_string()).collect(),
            condition: None,
        }
    }

    fn record(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn transforms_run_in_configured_order() -> Result<()> {
        let pipeline = TransformPipeline::compile(&[
            transform("extract", &["raw"], &["time", "verb", "path"], &[r"^(\S+ \S+) (\w+) (\S+)"]),
            transform("split", &["path"], &["section", "page"], &["/"]),
            transform("concat", &["verb", "section"], &["route"], &[":"]),
            transform("lowercase", &["route"], &[], &[]),
        ])?;
        let mut fields = record(&[("raw", "2016-04-01 10:00:00 GET Shop/Index")]);
        assert_eq!(pipeline.apply(&mut fields), TransformOutcome::Keep { failed: 0 });
        assert_eq!(fields["time"], "2016-04-01 10:00:00");
        assert_eq!(fields["section"], "Shop");
        assert_eq!(fields["page"], "Index");
        assert_eq!(fields["route"], "get:shop");
        Ok(())
    }

    #[test]
    fn exclude_conditions() -> Result<()> {
        let mut numeric = transform("exclude", &["value"], &[], &[]);
        numeric.condition = Some(Condition {
            operator: Operator::Lt,
            value: Some("5".into()),
        });
        let mut pattern = transform("exclude", &["host"], &[], &[]);
        pattern.condition = Some(Condition {
            operator: Operator::Match,
            value: Some("test-.*".into()),
        });
        let pipeline = TransformPipeline::compile(&[numeric, pattern])?;

        assert_eq!(pipeline.apply(&mut record(&[("value", "4.5")])), TransformOutcome::Exclude);
        assert_eq!(
            pipeline.apply(&mut record(&[("value", "5"), ("host", "prod-test-1")])),
            TransformOutcome::Keep { failed: 0 }
        );
        assert_eq!(
            pipeline.apply(&mut record(&[("value", "9"), ("host", "test-1")])),
            TransformOutcome::Exclude
        );
        Ok(())
    }

    #[test]
    fn missing_inputs_count_as_failed() -> Result<()> {
        let pipeline = TransformPipeline::compile(&[
            transform("extract", &["raw"], &["a"], &[r"(\d+)"]),
            transform("trim", &["name"], &[], &[]),
        ])?;
        let mut fields = record(&[("raw", "no digits")]);
        assert_eq!(pipeline.apply(&mut fields), TransformOutcome::Keep { failed: 2 });
        assert!(!fields.contains_key("a"));
        Ok(())
    }
}
