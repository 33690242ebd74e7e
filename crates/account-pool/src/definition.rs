//! Pool definition files
//!
//! One TOML document per pool, stored as `<name>.toml`. The `type` key
//! selects the strategy and is resolved once, at load time:
//!
//! ```toml
//! type = "sql"
//! query = "SELECT * FROM accounts WHERE packs > ?"
//! params = [10]
//!
//! [config]
//! sort_method = "packs_desc"
//! ```
//!
//! A document without `type` is a unified pool.

use std::path::{Path, PathBuf};

use account_store::QueryParam;
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::unified_pool::UnifiedPoolDefinition;
use crate::validation::{validate_query, validate_unified};

/// File extension of definition documents.
pub const DEFINITION_EXTENSION: &str = "toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePoolConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub config: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlPoolConfig {
    pub query: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    #[serde(default)]
    pub config: PoolConfig,
}

/// Strategy-specific part of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolKind {
    File(FilePoolConfig),
    Sql(SqlPoolConfig),
    Unified(UnifiedPoolDefinition),
}

impl PoolKind {
    pub fn label(&self) -> &'static str {
        match self {
            PoolKind::File(_) => "file",
            PoolKind::Sql(_) => "sql",
            PoolKind::Unified(_) => "unified",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolDefinition {
    pub name: String,
    pub kind: PoolKind,
}

impl PoolDefinition {
    pub fn new(name: impl Into<String>, kind: PoolKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        match &self.kind {
            PoolKind::File(file) => &file.config,
            PoolKind::Sql(sql) => &sql.config,
            PoolKind::Unified(unified) => &unified.config,
        }
    }

    pub fn config_mut(&mut self) -> &mut PoolConfig {
        match &mut self.kind {
            PoolKind::File(file) => &mut file.config,
            PoolKind::Sql(sql) => &mut sql.config,
            PoolKind::Unified(unified) => &mut unified.config,
        }
    }

    /// Check the definition without touching any source. Returns non-fatal
    /// warnings; unsafe queries and bad policy are errors.
    pub fn validate(&self) -> Result<Vec<String>> {
        validate_name(&self.name)?;
        match &self.kind {
            PoolKind::File(file) => {
                file.config.validate()?;
                if file.directory.as_os_str().is_empty() {
                    return Err(Error::Definition(format!(
                        "pool {}: directory must not be empty",
                        self.name
                    )));
                }
                Ok(Vec::new())
            }
            PoolKind::Sql(sql) => {
                sql.config.validate()?;
                validate_query(&sql.query)?;
                Ok(Vec::new())
            }
            PoolKind::Unified(unified) => validate_unified(unified),
        }
    }

    /// Parse a definition document.
    pub fn from_toml(name: impl Into<String>, contents: &str) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;

        let mut table: toml::Table = toml::from_str(contents)
            .map_err(|e| Error::Definition(format!("pool {name}: {e}")))?;
        if !table.contains_key("type") {
            table.insert("type".into(), toml::Value::String("unified".into()));
        }
        let kind: PoolKind = toml::Value::Table(table)
            .try_into()
            .map_err(|e| Error::Definition(format!("pool {name}: {e}")))?;

        Ok(Self { name, kind })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.kind)
            .map_err(|e| Error::Definition(format!("pool {}: {e}", self.name)))
    }

    /// Load `<dir>/<name>.toml`; the pool name is the file stem.
    pub async fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Definition(format!("bad definition path {}", path.display())))?;
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Definition(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(name, &contents)
    }

    /// Write the definition into `dir` atomically. Returns the file path.
    pub async fn save(&self, dir: &Path) -> Result<PathBuf> {
        validate_name(&self.name)?;
        let contents = self.to_toml()?;
        let path = definition_path(dir, &self.name);

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Definition(format!("creating {}: {e}", dir.display())))?;
        let tmp_path = dir.join(format!(".{}.tmp.{}", self.name, std::process::id()));
        tokio::fs::write(&tmp_path, contents.as_bytes())
            .await
            .map_err(|e| Error::Definition(format!("writing temp definition file: {e}")))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::Definition(format!("renaming temp definition file: {e}")))?;
        Ok(path)
    }
}

pub fn definition_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{DEFINITION_EXTENSION}"))
}

/// Pool names double as file names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Definition("pool name must not be empty".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Definition(format!(
            "pool name {name:?} may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortMethod;
    use crate::unified_pool::QuerySource;

    #[test]
    fn parses_each_kind() {
        let file = PoolDefinition::from_toml(
            "files",
            r#"
type = "file"
directory = "/data/accounts"

[config]
min_packs = 5
"#,
        )
        .unwrap();
        match &file.kind {
            PoolKind::File(cfg) => assert_eq!(cfg.directory, PathBuf::from("/data/accounts")),
            other => panic!("expected file kind, got {other:?}"),
        }
        assert_eq!(file.config().min_packs, 5);

        let sql = PoolDefinition::from_toml(
            "rich",
            r#"
type = "sql"
query = "SELECT * FROM accounts WHERE packs > ? AND status = ?"
params = [10, "available"]

[config]
sort_method = "packs_desc"
"#,
        )
        .unwrap();
        match &sql.kind {
            PoolKind::Sql(cfg) => assert_eq!(
                cfg.params,
                vec![QueryParam::Integer(10), QueryParam::Text("available".into())]
            ),
            other => panic!("expected sql kind, got {other:?}"),
        }
        assert_eq!(sql.config().sort_method, SortMethod::PacksDesc);
    }

    #[test]
    fn missing_type_means_unified() {
        let def = PoolDefinition::from_toml(
            "mixed",
            r#"
include = ["1", "2"]
exclude = ["2"]
watched_paths = ["/incoming"]

[[queries]]
name = "fresh"
sql = "SELECT * FROM accounts WHERE packs > ?"
params = [3]
"#,
        )
        .unwrap();
        let PoolKind::Unified(unified) = &def.kind else {
            panic!("expected unified kind");
        };
        assert_eq!(unified.queries.len(), 1);
        assert_eq!(unified.queries[0].params, vec![QueryParam::Integer(3)]);
        assert_eq!(unified.watched_paths, vec![PathBuf::from("/incoming")]);
        assert_eq!(def.validate().unwrap().len(), 1, "include/exclude conflict warns");
    }

    #[test]
    fn rejects_malformed_documents() {
        for contents in [
            "type = \"carrier_pigeon\"",
            "type = \"file\"",
            "type = \"sql\"\nquery = 5",
            "this is not toml",
        ] {
            assert!(
                matches!(
                    PoolDefinition::from_toml("p", contents),
                    Err(Error::Definition(_))
                ),
                "{contents:?} should fail"
            );
        }
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("pool_1-a").is_ok());
        for bad in ["", "../x", "a b", "a.toml"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn unsafe_sql_fails_validation() {
        let def = PoolDefinition::new(
            "evil",
            PoolKind::Sql(SqlPoolConfig {
                query: "SELECT * FROM accounts; DROP TABLE accounts".into(),
                params: vec![],
                config: PoolConfig::default(),
            }),
        );
        assert!(matches!(def.validate(), Err(Error::UnsafeQuery(_))));
    }

    #[tokio::test]
    async fn save_then_load_keeps_definition() {
        let dir = tempfile::tempdir().unwrap();
        let def = PoolDefinition::new(
            "mixed",
            PoolKind::Unified(UnifiedPoolDefinition {
                queries: vec![QuerySource::new("all", "SELECT * FROM accounts")],
                include: vec!["9".into()],
                config: PoolConfig {
                    max_packs: Some(30),
                    ..Default::default()
                },
                ..Default::default()
            }),
        );

        let path = def.save(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("mixed.toml"));
        let loaded = PoolDefinition::load(&path).await.unwrap();
        assert_eq!(loaded, def);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
