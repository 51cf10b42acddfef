//! Job configuration from `deltaflow.toml`.

use crate::ast::{SelectQuery, Table};
use crate::error::{EtlError, EtlResult};
use crate::parser;
use crate::transpiler::Dialect;
use crate::writer::WriterOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "deltaflow.toml";

fn default_max_connections() -> u32 {
    5
}

/// A database endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    /// Overrides the dialect picked from the url scheme.
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            dialect: None,
            command_timeout_secs: None,
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn dialect(&self) -> EtlResult<Dialect> {
        match &self.dialect {
            Some(name) => name.parse(),
            None => Dialect::from_url(&self.url),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

/// One source table copied into one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub source: Table,
    /// Defaults to the source layout under the source name.
    #[serde(default)]
    pub target: Option<Table>,
    /// Filter expression, see [`parser::parse_filters`].
    #[serde(default)]
    pub filter: Option<String>,
    /// Sort expression, see [`parser::parse_sorts`].
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub commit_size: Option<usize>,
    #[serde(default)]
    pub reject_table: Option<String>,
}

impl JobConfig {
    pub fn target_table(&self) -> Table {
        self.target.clone().unwrap_or_else(|| self.source.clone())
    }

    /// The select this job reads with.
    pub fn query(&self) -> EtlResult<SelectQuery> {
        let mut query = SelectQuery::new();
        if let Some(filter) = &self.filter {
            query.filters = parser::parse_filters(filter, &self.source)?;
        }
        if let Some(order) = &self.order {
            query.sorts = parser::parse_sorts(order, &self.source)?;
        }
        query.rows = self.limit;
        Ok(query)
    }

    /// Writer options with this job's overrides applied.
    pub fn writer_options(&self, defaults: &WriterOptions) -> WriterOptions {
        let mut options = defaults.clone();
        if let Some(size) = self.commit_size {
            options.commit_size = size;
        }
        options
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
    pub writer: WriterOptions,
    pub jobs: Vec<JobConfig>,
}

impl EtlConfig {
    /// Load from `path`, else `./deltaflow.toml`, else the user config dir.
    pub fn load(path: Option<&Path>) -> EtlResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::locate().ok_or_else(|| {
                EtlError::Config(format!("{} not found in the working or config directory", CONFIG_FILE))
            })?,
        };
        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    /// First existing default location.
    pub fn locate() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("deltaflow").join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    pub fn parse(content: &str) -> EtlResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> EtlResult<()> {
        if self.writer.commit_size == 0 {
            return Err(EtlError::Config("writer.commit_size must be at least 1".into()));
        }
        for (i, job) in self.jobs.iter().enumerate() {
            if self.jobs[..i].iter().any(|other| other.name == job.name) {
                return Err(EtlError::Config(format!("job '{}' is defined twice", job.name)));
            }
            for table in std::iter::once(&job.source).chain(job.target.as_ref()) {
                // Deserialized tables skip the duplicate-name check.
                Table::with_columns(table.name.clone(), table.columns().to_vec())
                    .map_err(|e| EtlError::Config(format!("job '{}': {}", job.name, e)))?;
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> EtlResult<&JobConfig> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| EtlError::Config(format!("no job named '{}'", name)))
    }
}
