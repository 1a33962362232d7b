//! Search-space distributions, sampled values, and the argument syntax used to
//! declare them (`lr=log_uniform(0.0001, 0.1)`).

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::errors::{DistributionError, HpoError, HpoResult, SweepError};

static DECIMAL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?")
        .expect("Invalid decimal token regex")
});

/// A search space for one hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum Distribution {
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Sampled uniformly in log-space then exponentiated.
    LogUniform { low: f64, high: f64 },
    /// Uniform choice among string values.
    Categorical { choices: Vec<String> },
}

/// Keyword identifying a distribution inside an argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionKind {
    LogUniform,
    Uniform,
    Categorical,
}

impl DistributionKind {
    /// Match table, most specific keyword first: `uniform` is a substring of
    /// `log_uniform`.
    const MATCH_ORDER: [(&'static str, DistributionKind); 3] = [
        ("log_uniform", DistributionKind::LogUniform),
        ("uniform", DistributionKind::Uniform),
        ("categorical", DistributionKind::Categorical),
    ];

    /// Detect which distribution an argument value declares, if any.
    pub fn detect(value: &str) -> Option<Self> {
        Self::MATCH_ORDER
            .iter()
            .find(|(keyword, _)| value.contains(keyword))
            .map(|(_, kind)| *kind)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::LogUniform => "log_uniform",
            Self::Uniform => "uniform",
            Self::Categorical => "categorical",
        }
    }
}

impl Distribution {
    pub fn kind(&self) -> DistributionKind {
        match self {
            Self::Uniform { .. } => DistributionKind::Uniform,
            Self::LogUniform { .. } => DistributionKind::LogUniform,
            Self::Categorical { .. } => DistributionKind::Categorical,
        }
    }

    /// Check the bound and choice invariants for a distribution attached to
    /// parameter `name`.
    pub fn validate(&self, name: &str) -> Result<(), DistributionError> {
        match self {
            Self::Uniform { low, high } => {
                // The sampler needs the width itself to be finite.
                if !low.is_finite() || !high.is_finite() || low >= high || !(high - low).is_finite()
                {
                    return Err(DistributionError::InvalidBounds {
                        name: name.to_string(),
                        low: *low,
                        high: *high,
                    });
                }
            }
            Self::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || *low <= 0.0 || low >= high {
                    return Err(DistributionError::InvalidBounds {
                        name: name.to_string(),
                        low: *low,
                        high: *high,
                    });
                }
            }
            Self::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(DistributionError::EmptyChoices {
                        name: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Draw one value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::Uniform { low, high } => ParamValue::Float(rng.gen_range(*low..=*high)),
            Self::LogUniform { low, high } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            Self::Categorical { choices } => {
                let idx = rng.gen_range(0..choices.len());
                ParamValue::Str(choices[idx].clone())
            }
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform { low, high } => write!(f, "uniform({low:?}, {high:?})"),
            Self::LogUniform { low, high } => write!(f, "log_uniform({low:?}, {high:?})"),
            Self::Categorical { choices } => write!(f, "categorical([{}])", choices.join(", ")),
        }
    }
}

/// Parse a single `name=distribution(args)` argument.
pub fn parse(token: &str) -> HpoResult<(String, Distribution)> {
    let (name, value) = token
        .split_once('=')
        .ok_or_else(|| HpoError::malformed(token, "expected name=distribution(args)"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HpoError::malformed(token, "missing parameter name"));
    }

    let kind = DistributionKind::detect(value)
        .ok_or_else(|| HpoError::malformed(token, "no supported distribution keyword"))?;

    let distribution = match kind {
        DistributionKind::Uniform | DistributionKind::LogUniform => {
            let (low, high) = parse_bounds(token, value)?;
            if kind == DistributionKind::Uniform {
                Distribution::Uniform { low, high }
            } else {
                Distribution::LogUniform { low, high }
            }
        }
        DistributionKind::Categorical => Distribution::Categorical {
            choices: parse_choices(token, value)?,
        },
    };

    distribution.validate(name)?;
    Ok((name.to_string(), distribution))
}

fn parse_bounds(token: &str, value: &str) -> HpoResult<(f64, f64)> {
    // Skip the keyword so it can never contribute digits.
    let args = value.find('(').map_or(value, |open| &value[open..]);
    let mut numbers = DECIMAL_TOKEN.find_iter(args).map(|m| m.as_str());

    let (Some(low), Some(high)) = (numbers.next(), numbers.next()) else {
        return Err(HpoError::malformed(token, "expected two numeric bounds"));
    };
    let low: f64 = low
        .parse()
        .map_err(|_| HpoError::malformed(token, format!("invalid bound '{low}'")))?;
    let high: f64 = high
        .parse()
        .map_err(|_| HpoError::malformed(token, format!("invalid bound '{high}'")))?;
    Ok((low, high))
}

fn parse_choices(token: &str, value: &str) -> HpoResult<Vec<String>> {
    let inner = value
        .split_once('[')
        .and_then(|(_, rest)| rest.split_once(']'))
        .map(|(inner, _)| inner)
        .ok_or_else(|| HpoError::malformed(token, "expected a bracketed list of choices"))?;

    let choices: Vec<String> = inner
        .split(',')
        .map(|c| c.trim().trim_matches(|q| q == '"' || q == '\'').to_string())
        .filter(|c| !c.is_empty())
        .collect();

    if choices.is_empty() {
        return Err(HpoError::malformed(token, "empty list of choices"));
    }
    Ok(choices)
}

/// A concrete parameter value, either sampled or passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Type a literal script argument: integer, then float, else string.
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(v) = raw.parse::<i64>() {
            return Self::Int(v);
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Self::Float(v),
            _ => Self::Str(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

/// Command-style script arguments split into search-space distributions and
/// fixed values passed through to every trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptArguments {
    pub distributions: BTreeMap<String, Distribution>,
    pub fixed: BTreeMap<String, ParamValue>,
}

/// Classify `--name=value` tokens. Values naming a distribution are parsed
/// with [`parse`]; everything else becomes a typed fixed argument.
pub fn parse_script_arguments<S: AsRef<str>>(args: &[S]) -> HpoResult<ScriptArguments> {
    let mut parsed = ScriptArguments::default();

    for arg in args {
        let raw = arg.as_ref();
        let token = raw.trim_start_matches('-');
        let Some((name, value)) = token.split_once('=') else {
            return Err(HpoError::malformed(
                raw,
                "provide the arguments as follows --x=y",
            ));
        };

        let name = name.trim();
        if parsed.distributions.contains_key(name) || parsed.fixed.contains_key(name) {
            return Err(SweepError::Configuration {
                sweep_id: String::new(),
                message: format!("parameter '{name}' given more than once"),
            }
            .into());
        }

        if DistributionKind::detect(value).is_some() {
            let (name, distribution) = parse(token)?;
            parsed.distributions.insert(name, distribution);
        } else {
            parsed
                .fixed
                .insert(name.to_string(), ParamValue::parse_literal(value.trim()));
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn parses_log_uniform() {
        let (name, dist) = parse("lr=log_uniform(0.0001, 0.1)").unwrap();
        assert_eq!(name, "lr");
        assert_eq!(
            dist,
            Distribution::LogUniform {
                low: 0.0001,
                high: 0.1
            }
        );
    }

    #[test]
    fn parses_categorical() {
        let (name, dist) = parse("optimizer=categorical([adam, sgd])").unwrap();
        assert_eq!(name, "optimizer");
        assert_eq!(
            dist,
            Distribution::Categorical {
                choices: vec!["adam".to_string(), "sgd".to_string()]
            }
        );
    }

    #[test]
    fn log_uniform_is_not_classified_as_uniform() {
        assert_eq!(
            DistributionKind::detect("log_uniform(0.1, 1.0)"),
            Some(DistributionKind::LogUniform)
        );
        assert_eq!(
            DistributionKind::detect("uniform(0.1, 1.0)"),
            Some(DistributionKind::Uniform)
        );
        assert_eq!(DistributionKind::detect("32"), None);
    }

    #[test]
    fn parses_uniform_with_integers_and_exponents() {
        let (_, dist) = parse("dropout=uniform(0, 1)").unwrap();
        assert_eq!(dist, Distribution::Uniform { low: 0.0, high: 1.0 });

        let (_, dist) = parse("wd=log_uniform(1e-5, 1e-2)").unwrap();
        assert_eq!(dist, Distribution::LogUniform { low: 1e-5, high: 1e-2 });
    }

    #[test]
    fn rejects_missing_bounds() {
        let err = parse("lr=uniform(0.5)").unwrap_err();
        assert!(matches!(
            err,
            HpoError::Distribution(DistributionError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_empty_choices() {
        let err = parse("opt=categorical([])").unwrap_err();
        assert!(matches!(
            err,
            HpoError::Distribution(DistributionError::Malformed { .. })
        ));
        assert!(parse("opt=categorical(adam)").is_err());
    }

    #[test]
    fn rejects_inverted_and_non_positive_bounds() {
        assert!(matches!(
            parse("x=uniform(2.0, 1.0)").unwrap_err(),
            HpoError::Distribution(DistributionError::InvalidBounds { .. })
        ));
        assert!(matches!(
            parse("x=log_uniform(0.0, 1.0)").unwrap_err(),
            HpoError::Distribution(DistributionError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn rejects_uniform_range_wider_than_f64() {
        let wide = Distribution::Uniform {
            low: -1e308,
            high: 1e308,
        };
        assert!(matches!(
            wide.validate("x"),
            Err(DistributionError::InvalidBounds { .. })
        ));
        assert!(parse("x=uniform(-1e308, 1e308)").is_err());
        assert!(Distribution::Uniform {
            low: -1e307,
            high: 1e307
        }
        .validate("x")
        .is_ok());
    }

    #[test]
    fn display_reparses_to_identical_bounds() {
        let original = [
            "lr=log_uniform(0.0001, 0.1)",
            "momentum=uniform(0.85, 0.99)",
            "x=uniform(-3.5, 1e-7)",
            "opt=categorical([adam, sgd, rmsprop])",
        ];
        for token in original {
            let (name, dist) = parse(token).unwrap();
            let (name2, dist2) = parse(&format!("{name}={dist}")).unwrap();
            assert_eq!(name, name2);
            assert_eq!(dist.kind(), dist2.kind());
            match (&dist, &dist2) {
                (
                    Distribution::Uniform { low, high } | Distribution::LogUniform { low, high },
                    Distribution::Uniform { low: l2, high: h2 }
                    | Distribution::LogUniform { low: l2, high: h2 },
                ) => {
                    assert_eq!(low.to_bits(), l2.to_bits());
                    assert_eq!(high.to_bits(), h2.to_bits());
                }
                _ => assert_eq!(dist, dist2),
            }
        }
    }

    #[test]
    fn samples_stay_in_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let uniform = Distribution::Uniform { low: 0.5, high: 1.0 };
        let log = Distribution::LogUniform { low: 1e-5, high: 1e-1 };
        let cat = Distribution::Categorical {
            choices: vec!["a".into(), "b".into()],
        };
        for _ in 0..200 {
            let v = uniform.sample(&mut rng).as_f64().unwrap();
            assert!((0.5..=1.0).contains(&v));
            let v = log.sample(&mut rng).as_f64().unwrap();
            assert!((1e-5..=1e-1).contains(&v), "out of bounds: {v}");
            let v = cat.sample(&mut rng);
            assert!(matches!(v.as_str(), Some("a") | Some("b")));
        }
    }

    #[test]
    fn script_arguments_split_distributions_from_fixed() {
        let args = [
            "--lr=log_uniform(0.001, 0.1)",
            "--optimizer=categorical([adam, sgd])",
            "--epochs=10",
            "--scale=0.5",
            "--data=/tmp/mnist",
        ];
        let parsed = parse_script_arguments(&args).unwrap();
        assert_eq!(parsed.distributions.len(), 2);
        assert_eq!(parsed.fixed.get("epochs"), Some(&ParamValue::Int(10)));
        assert_eq!(parsed.fixed.get("scale"), Some(&ParamValue::Float(0.5)));
        assert_eq!(
            parsed.fixed.get("data"),
            Some(&ParamValue::Str("/tmp/mnist".into()))
        );
    }

    #[test]
    fn script_arguments_require_equals() {
        let err = parse_script_arguments(&["--epochs", "10"]).unwrap_err();
        assert!(err.to_string().contains("--x=y"));
    }

    #[test]
    fn script_arguments_reject_duplicates() {
        let err = parse_script_arguments(&["--lr=0.1", "--lr=uniform(0.1, 0.2)"]).unwrap_err();
        assert!(matches!(err, HpoError::Sweep(SweepError::Configuration { .. })));
    }

    #[test]
    fn param_value_serde_keeps_ints_and_floats_apart() {
        let values = vec![
            ParamValue::Int(3),
            ParamValue::Float(0.25),
            ParamValue::Str("adam".into()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[3,0.25,"adam"]"#);
        let back: Vec<ParamValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
