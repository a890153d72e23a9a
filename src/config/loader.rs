use crate::config::schema::ScraperConfig;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use validator::Validate;

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ScraperConfig> {
        let path = path.as_ref();
        let mut visited = HashSet::new();
        let raw = Self::load_with_inheritance(path, &mut visited)?;
        let config: ScraperConfig = serde_json::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses config text in the given format without inheritance.
    pub fn parse_str(content: &str, extension: &str) -> Result<ScraperConfig> {
        let raw = Self::parse(content, extension)?;
        let config: ScraperConfig = serde_json::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn load_with_inheritance(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<Value> {
        let path = fs::canonicalize(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        if !visited.insert(path.clone()) {
            return Err(Error::Config(format!(
                "Circular inheritance detected involving {}",
                path.display()
            )));
        }

        let mut config = Self::load_file(&path)?;

        let parent = config
            .as_object_mut()
            .and_then(|obj| obj.remove("extends"))
            .and_then(|v| v.as_str().map(str::to_string));

        match parent {
            Some(parent_path_str) => {
                let parent_path = path
                    .parent()
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "Cannot determine parent directory for {}",
                            path.display()
                        ))
                    })?
                    .join(parent_path_str);

                let mut parent_config = Self::load_with_inheritance(&parent_path, visited)?;
                merge_values(&mut parent_config, config);
                Ok(parent_config)
            }
            None => Ok(config),
        }
    }

    fn load_file(path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).ok_or_else(|| {
            Error::Config(format!("Unsupported file extension: {}", path.display()))
        })?;
        Self::parse(&content, extension)
    }

    fn parse(content: &str, extension: &str) -> Result<Value> {
        match extension {
            "json" => Ok(serde_json::from_str(content)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(content)?),
            "toml" => Ok(toml::from_str(content)?),
            other => Err(Error::Config(format!(
                "Unsupported file extension: {}",
                other
            ))),
        }
    }
}

/// Deep-merges `child` into `parent`; child scalars and arrays win.
fn merge_values(parent: &mut Value, child: Value) {
    match (parent, child) {
        (Value::Object(parent_map), Value::Object(child_map)) => {
            for (key, value) in child_map {
                match parent_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        parent_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BudgetPeriod, OutputConfig};
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const BASE_YAML: &str = r#"
name: listings
concurrency: 4
extraction:
  fields:
    - name: title
    - name: price
      required: false
budget:
  default_limit: 25.0
  period: daily
"#;

    #[test]
    fn loads_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "base.yaml", BASE_YAML);

        let cfg = ConfigLoader::load(&path).unwrap();
        assert_eq!(cfg.name, "listings");
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.extraction.fields.len(), 2);
        assert!(!cfg.extraction.fields[1].required);
        assert_eq!(cfg.budget.period, BudgetPeriod::Daily);
        assert_eq!(cfg.patterns.eviction_threshold, 3);
        assert!(matches!(cfg.output, OutputConfig::Csv { .. }));
        assert_eq!(cfg.extraction.dedup_fields(), vec!["title".to_string()]);
    }

    #[test]
    fn child_overrides_parent_deeply() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.yaml", BASE_YAML);
        let child = write(
            dir.path(),
            "child.toml",
            r#"
extends = "base.yaml"
name = "child"

[budget]
default_limit = 99.0
"#,
        );

        let cfg = ConfigLoader::load(&child).unwrap();
        assert_eq!(cfg.name, "child");
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.budget.default_limit, 99.0);
        assert_eq!(cfg.budget.period, BudgetPeriod::Daily);
        assert!(cfg.extends.is_none());
    }

    #[test]
    fn detects_circular_inheritance() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"extends": "b.json", "name": "a"}"#);
        let b = write(dir.path(), "b.json", r#"{"extends": "a.json", "name": "b"}"#);

        let err = ConfigLoader::load(&b).unwrap_err();
        assert!(err.to_string().contains("Circular"));
    }

    #[test]
    fn rejects_config_without_required_field() {
        let body = r#"{"name": "x", "extraction": {"fields": [{"name": "a", "required": false}]}}"#;
        assert!(matches!(
            ConfigLoader::parse_str(body, "json"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_inverted_delay_window() {
        let body = r#"{
            "name": "x",
            "extraction": {"fields": [{"name": "a"}]},
            "navigation": {"min_delay_ms": 900, "max_delay_ms": 100}
        }"#;
        assert!(ConfigLoader::parse_str(body, "json").is_err());
    }

    #[test]
    fn key_fields_must_be_required_schema_fields() {
        let with_keys = |keys: &str| {
            format!(
                r#"{{"name": "x", "extraction": {{
                    "fields": [{{"name": "name"}}, {{"name": "note", "required": false}}],
                    "key_fields": {keys}
                }}}}"#
            )
        };

        assert!(matches!(
            ConfigLoader::parse_str(&with_keys(r#"["sku"]"#), "json"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            ConfigLoader::parse_str(&with_keys(r#"["note"]"#), "json"),
            Err(Error::Validation(_))
        ));
        let cfg = ConfigLoader::parse_str(&with_keys(r#"["name"]"#), "json").unwrap();
        assert_eq!(cfg.extraction.dedup_fields(), vec!["name".to_string()]);
    }

    #[test]
    fn pagination_and_billing_settings() {
        let body = r#"
name: paged
extraction:
  fields:
    - name: title
pagination:
  max_pages: 5
  page_param: page
budget:
  billing_day: 15
"#;
        let cfg = ConfigLoader::parse_str(body, "yaml").unwrap();
        assert_eq!(cfg.pagination.max_pages, 5);
        assert_eq!(cfg.pagination.page_param.as_deref(), Some("page"));
        assert!(!cfg.pagination.next_selectors.is_empty());
        assert_eq!(cfg.budget.billing_day, 15);

        let bad_day = body.replace("billing_day: 15", "billing_day: 32");
        assert!(ConfigLoader::parse_str(&bad_day, "yaml").is_err());
        let bad_selector = body.replace("page_param: page", "next_selectors: [\"a[rel\"]");
        assert!(ConfigLoader::parse_str(&bad_selector, "yaml").is_err());
    }
}
