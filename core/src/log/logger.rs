use log::LevelFilter;
use log4rs::config::Logger as LoggerConfig;
use std::{collections::HashMap, env, mem};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum LogError {
    #[error("Logger spec parsing error: {0}")]
    ParseLoggerSpecError(String),

    #[error("log directory is not valid UTF-8: {0}")]
    InvalidLogDir(String),

    #[error("failed to build log appender: {0}")]
    AppenderError(String),

    #[error("failed to install logger: {0}")]
    InitError(String),
}

/// One `target=level` directive of a level spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct TargetLevel {
    pub target: String,
    pub level: LevelFilter,
}

impl TargetLevel {
    pub fn logger(&self, appenders: &[&'static str]) -> LoggerConfig {
        LoggerConfig::builder().appenders(appenders.iter().map(|x| x.to_string())).additive(false).build(self.target.clone(), self.level)
    }
}

/// Parsed level spec, e.g. `info, prosper_stratum=debug`.
#[derive(Debug, Default)]
pub(super) struct LevelSpec {
    targets: HashMap<String, LevelFilter>,
    root_level: Option<LevelFilter>,
    rejected: Vec<LogError>,
}

impl LevelSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_env(&mut self, env: &str) -> &mut Self {
        self.parse_expression(&env::var(env).unwrap_or_default())
    }

    pub fn parse_expression(&mut self, expression: &str) -> &mut Self {
        for spec in expression.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
            let mut parts = spec.split('=');
            match (parts.next(), parts.next().map(|x| x.trim()), parts.next()) {
                // a lone level is the root level, a lone name enables everything for that target
                (Some(part0), None, None) => match part0.parse() {
                    Ok(level) => {
                        self.root_level.replace(level);
                    }
                    Err(_) => {
                        self.targets.insert(part0.to_string(), LevelFilter::max());
                    }
                },
                (Some(part0), Some(""), None) => {
                    self.targets.insert(part0.to_string(), LevelFilter::max());
                }
                (Some(part0), Some(part1), None) => match part1.parse() {
                    Ok(level) => {
                        self.targets.insert(part0.trim().to_string(), level);
                    }
                    Err(_) => self.rejected.push(LogError::ParseLoggerSpecError(part1.to_string())),
                },
                _ => self.rejected.push(LogError::ParseLoggerSpecError(spec.to_string())),
            }
        }
        self
    }

    /// Directives that could not be parsed and were ignored.
    pub fn rejected(&self) -> &[LogError] {
        &self.rejected
    }

    pub fn root_level(&self) -> LevelFilter {
        self.root_level.unwrap_or(LevelFilter::Info)
    }

    pub fn take_targets(&mut self) -> Vec<TargetLevel> {
        let mut targets =
            mem::take(&mut self.targets).into_iter().map(|(target, level)| TargetLevel { target, level }).collect::<Vec<_>>();
        targets.sort_by(|a, b| a.target.cmp(&b.target));
        targets
    }
}
