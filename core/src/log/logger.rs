use super::LogError;
use log::LevelFilter;
use log4rs::config::Logger;
use std::{collections::BTreeMap, env, str::FromStr};

/// Parsed form of a `RUST_LOG` style filter expression such as
/// `"info,pool_stratum=debug,pool_daemon::cache=trace"`.
///
/// A bare level sets the root level, `target=level` sets a per-target
/// level and a bare target enables everything for that target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSpec {
    root_level: Option<LevelFilter>,
    targets: BTreeMap<String, LevelFilter>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an expression, skipping (and reporting) malformed entries.
    pub fn parse_lenient(expression: &str) -> Self {
        let mut spec = Self::new();
        spec.merge_expression(expression);
        spec
    }

    /// Layers the content of an environment variable on top of the current spec.
    pub fn merge_env(&mut self, var: &str) -> &mut Self {
        self.merge_expression(&env::var(var).unwrap_or_default())
    }

    /// Layers an expression on top of the current spec. Later entries win.
    pub fn merge_expression(&mut self, expression: &str) -> &mut Self {
        for directive in expression.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match parse_directive(directive) {
                Ok((None, level)) => {
                    self.root_level = Some(level);
                }
                Ok((Some(target), level)) => {
                    self.targets.insert(target.to_string(), level);
                }
                Err(err) => eprintln!("Ignoring invalid logging spec '{}'", err),
            }
        }
        self
    }

    pub fn with_root_level(mut self, level: LevelFilter) -> Self {
        self.root_level = Some(level);
        self
    }

    pub fn root_level(&self) -> LevelFilter {
        self.root_level.unwrap_or(LevelFilter::Info)
    }

    pub fn target_level(&self, target: &str) -> Option<LevelFilter> {
        self.targets.get(target).copied()
    }

    /// Per-target loggers, inheriting the root appenders.
    pub fn loggers(&self) -> Vec<Logger> {
        self.targets.iter().map(|(target, level)| Logger::builder().build(target.clone(), *level)).collect()
    }
}

impl FromStr for FilterSpec {
    type Err = LogError;

    /// Strict parsing, failing on the first malformed entry.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut spec = Self::new();
        for directive in s.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match parse_directive(directive)? {
                (None, level) => spec.root_level = Some(level),
                (Some(target), level) => {
                    spec.targets.insert(target.to_string(), level);
                }
            }
        }
        Ok(spec)
    }
}

fn parse_directive(directive: &str) -> Result<(Option<&str>, LevelFilter), LogError> {
    let mut parts = directive.split('=');
    match (parts.next(), parts.next().map(str::trim), parts.next()) {
        // a single level string defines the root level, anything else is a target
        (Some(part0), None, None) => match part0.parse() {
            Ok(level) => Ok((None, level)),
            Err(_) => Ok((Some(part0), LevelFilter::max())),
        },
        (Some(part0), Some(""), None) => Ok((Some(part0), LevelFilter::max())),
        (Some(part0), Some(part1), None) => {
            part1.parse().map(|level| (Some(part0), level)).map_err(|_| LogError::ParseLoggerSpecError(part1.to_string()))
        }
        _ => Err(LogError::ParseLoggerSpecError(directive.to_string())),
    }
}
