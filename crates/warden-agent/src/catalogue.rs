use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use warden_proto::InstanceSummary;

use crate::config::{self, Instance, Template};
use crate::store::Store;
use crate::supervisor::{LaunchSpec, Supervisor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("reference to undefined key {0:?}")]
    UndefinedKey(String),
    #[error("unclosed '{{' in template")]
    Unclosed,
}

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("instance name is required")]
    EmptyName,
    #[error("template name is required")]
    EmptyTemplate,
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error("unknown instance: {0}")]
    NotFound(String),
    #[error("instance {0:?} is disabled")]
    Disabled(String),
    #[error("instance {name:?} references unknown template {template:?}")]
    BadTemplate { name: String, template: String },
    #[error("instance {0:?} is running; use force to stop it before delete")]
    Running(String),
    #[error("render template.{field}: {source}")]
    Render {
        field: &'static str,
        source: RenderError,
    },
    #[error("template {template:?} stop config: {source}")]
    Stop {
        template: String,
        source: config::StopConfigError,
    },
    #[error("ensure dirs: {0}")]
    Dirs(#[source] std::io::Error),
    #[error("persist instances: {0}")]
    Persist(#[source] anyhow::Error),
}

/// Owns the instance map, the read-only template catalogue and the
/// persistent store. One mutex guards the map and is held across the
/// persist call, so on-disk state mirrors memory after every mutation.
pub struct Catalogue {
    supervisor: Arc<Supervisor>,
    templates: HashMap<String, Template>,
    instances: Mutex<HashMap<String, Instance>>,
    store: Store,
    base_instance_dir: PathBuf,
    log_dir: PathBuf,
}

impl Catalogue {
    pub fn new(
        supervisor: Arc<Supervisor>,
        templates: HashMap<String, Template>,
        instances: HashMap<String, Instance>,
        store: Store,
        base_instance_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            supervisor,
            templates,
            instances: Mutex::new(instances),
            store,
            base_instance_dir: base_instance_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    pub async fn instance_names(&self) -> Vec<String> {
        self.instances.lock().await.keys().cloned().collect()
    }

    pub async fn summaries(&self) -> Vec<InstanceSummary> {
        let instances = self.instances.lock().await;
        let mut out = Vec::with_capacity(instances.len());
        for (name, instance) in instances.iter() {
            let state = self.supervisor.status(name).await;
            out.push(InstanceSummary {
                name: name.clone(),
                template: instance.template.clone(),
                enabled: instance.enabled,
                params: instance.params.clone(),
                running: state.running,
                pid: if state.running { state.pid } else { None },
            });
        }
        out
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.base_instance_dir.join(name)
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    async fn ensure_dirs(&self, name: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        tokio::fs::create_dir_all(self.instance_dir(name)).await?;
        Ok(())
    }

    /// Add an instance and persist the catalogue. A persist failure rolls
    /// the insertion back, leaving memory and disk unchanged.
    pub async fn create(
        &self,
        name: &str,
        template: &str,
        enabled: bool,
        params: HashMap<String, String>,
    ) -> Result<(), CatalogueError> {
        if name.trim().is_empty() {
            return Err(CatalogueError::EmptyName);
        }
        if template.trim().is_empty() {
            return Err(CatalogueError::EmptyTemplate);
        }
        if !self.templates.contains_key(template) {
            return Err(CatalogueError::UnknownTemplate(template.to_string()));
        }

        let mut instances = self.instances.lock().await;
        if instances.contains_key(name) {
            return Err(CatalogueError::AlreadyExists(name.to_string()));
        }

        instances.insert(
            name.to_string(),
            Instance {
                template: template.to_string(),
                enabled,
                params,
            },
        );

        if let Err(err) = self.store.save(&instances).await {
            instances.remove(name);
            return Err(CatalogueError::Persist(err));
        }
        drop(instances);

        let _ = self.ensure_dirs(name).await;
        Ok(())
    }

    /// Remove an instance and persist. The in-memory catalogue is
    /// authoritative: a persist failure is reported but the removal
    /// stands (the next successful mutation re-syncs the file).
    pub async fn delete(
        &self,
        name: &str,
        force: bool,
        delete_data: bool,
    ) -> Result<(), CatalogueError> {
        let mut instances = self.instances.lock().await;
        if !instances.contains_key(name) {
            return Err(CatalogueError::NotFound(name.to_string()));
        }

        if self.supervisor.status(name).await.running {
            if !force {
                return Err(CatalogueError::Running(name.to_string()));
            }
            let _ = self.supervisor.stop(name).await;
        }

        instances.remove(name);

        let persisted = self.store.save(&instances).await;
        drop(instances);

        if delete_data {
            let _ = tokio::fs::remove_dir_all(self.instance_dir(name)).await;
        }

        persisted.map_err(CatalogueError::Persist)
    }

    /// Expand an instance into a concrete launch spec plus its log path.
    pub async fn resolve(&self, name: &str) -> Result<(LaunchSpec, PathBuf), CatalogueError> {
        let instance = {
            let instances = self.instances.lock().await;
            instances
                .get(name)
                .cloned()
                .ok_or_else(|| CatalogueError::NotFound(name.to_string()))?
        };

        if !instance.enabled {
            return Err(CatalogueError::Disabled(name.to_string()));
        }

        let template =
            self.templates
                .get(&instance.template)
                .ok_or_else(|| CatalogueError::BadTemplate {
                    name: name.to_string(),
                    template: instance.template.clone(),
                })?;

        self.ensure_dirs(name).await.map_err(CatalogueError::Dirs)?;

        let instance_dir = self.instance_dir(name);
        let log_path = self.log_path(name);

        let mut ctx = instance.params.clone();
        ctx.insert("instance_name".to_string(), name.to_string());
        ctx.insert(
            "instance_dir".to_string(),
            instance_dir.display().to_string(),
        );
        ctx.insert("log_path".to_string(), log_path.display().to_string());

        let rendered = |field, source| CatalogueError::Render { field, source };

        let command =
            render(&template.command, &ctx).map_err(|e| rendered("command", e))?;
        let mut args = Vec::with_capacity(template.args.len());
        for arg in &template.args {
            args.push(render(arg, &ctx).map_err(|e| rendered("args", e))?);
        }
        let cwd = render(&template.cwd, &ctx).map_err(|e| rendered("cwd", e))?;
        let mut env = Vec::with_capacity(template.env.len());
        for entry in &template.env {
            env.push(render(entry, &ctx).map_err(|e| rendered("env", e))?);
        }

        let stop = config::convert_stop(&template.stop).map_err(|source| CatalogueError::Stop {
            template: instance.template.clone(),
            source,
        })?;

        let spec = LaunchSpec {
            name: name.to_string(),
            command,
            args,
            cwd,
            env,
            stop,
        };
        Ok((spec, log_path))
    }
}

/// Substitute `{key}` references from the context. A reference to an
/// undefined key is an error, never a silent empty string. `{{` and `}}`
/// escape literal braces.
fn render(template: &str, ctx: &HashMap<String, String>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => return Err(RenderError::Unclosed),
                    }
                }
                match ctx.get(&key) {
                    Some(value) => out.push_str(value),
                    None => return Err(RenderError::UndefinedKey(key)),
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopSpec;
    use std::time::Duration;

    fn sleeper_template() -> Template {
        Template {
            command: "/bin/sleep".to_string(),
            args: vec!["{seconds}".to_string()],
            cwd: String::new(),
            env: Vec::new(),
            stop: StopSpec {
                grace_period: "1s".to_string(),
                ..StopSpec::default()
            },
        }
    }

    fn catalogue_in(dir: &tempfile::TempDir) -> Catalogue {
        let supervisor = Arc::new(Supervisor::new());
        let templates = HashMap::from([("sleeper".to_string(), sleeper_template())]);
        Catalogue::new(
            supervisor,
            templates,
            HashMap::new(),
            Store::new(dir.path().join("instances.yaml")),
            dir.path().join("instances"),
            dir.path().join("logs"),
        )
    }

    fn params(seconds: &str) -> HashMap<String, String> {
        HashMap::from([("seconds".to_string(), seconds.to_string())])
    }

    #[tokio::test]
    async fn create_persists_and_delete_removes() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue_in(&dir);

        cat.create("web", "sleeper", true, params("60")).await.unwrap();

        let on_disk = Store::new(dir.path().join("instances.yaml"))
            .load()
            .await
            .unwrap();
        assert!(on_disk.contains_key("web"));
        assert_eq!(cat.instance_names().await, vec!["web".to_string()]);

        cat.delete("web", false, false).await.unwrap();
        let on_disk = Store::new(dir.path().join("instances.yaml"))
            .load()
            .await
            .unwrap();
        assert!(on_disk.is_empty());
        assert!(cat.instance_names().await.is_empty());
    }

    #[tokio::test]
    async fn create_validates_names_and_templates() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue_in(&dir);

        assert!(matches!(
            cat.create("", "sleeper", true, HashMap::new()).await,
            Err(CatalogueError::EmptyName)
        ));
        assert!(matches!(
            cat.create("web", "", true, HashMap::new()).await,
            Err(CatalogueError::EmptyTemplate)
        ));
        assert!(matches!(
            cat.create("web", "nope", true, HashMap::new()).await,
            Err(CatalogueError::UnknownTemplate(_))
        ));

        cat.create("web", "sleeper", true, params("60")).await.unwrap();
        assert!(matches!(
            cat.create("web", "sleeper", true, params("60")).await,
            Err(CatalogueError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_a_create() {
        let dir = tempfile::tempdir().unwrap();
        // Park the store behind a regular file so create_dir_all fails.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "").unwrap();

        let supervisor = Arc::new(Supervisor::new());
        let templates = HashMap::from([("sleeper".to_string(), sleeper_template())]);
        let cat = Catalogue::new(
            supervisor,
            templates,
            HashMap::new(),
            Store::new(blocked.join("instances.yaml")),
            dir.path().join("instances"),
            dir.path().join("logs"),
        );

        let err = cat.create("web", "sleeper", true, params("60")).await;
        assert!(matches!(err, Err(CatalogueError::Persist(_))));
        assert!(cat.instance_names().await.is_empty());
    }

    #[tokio::test]
    async fn delete_while_running_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue_in(&dir);

        cat.create("web", "sleeper", true, params("3600"))
            .await
            .unwrap();
        let (spec, log_path) = cat.resolve("web").await.unwrap();
        cat.supervisor.start(spec, &log_path).await.unwrap();

        assert!(matches!(
            cat.delete("web", false, false).await,
            Err(CatalogueError::Running(_))
        ));

        cat.delete("web", true, true).await.unwrap();
        assert!(!cat.supervisor.is_running("web").await);
        assert!(!cat.instance_dir("web").exists());

        let on_disk = Store::new(dir.path().join("instances.yaml"))
            .load()
            .await
            .unwrap();
        assert!(!on_disk.contains_key("web"));
    }

    #[tokio::test]
    async fn resolve_injects_the_builtin_keys() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(Supervisor::new());
        let template = Template {
            command: "/bin/echo".to_string(),
            args: vec![
                "{msg}".to_string(),
                "{instance_name}".to_string(),
                "{log_path}".to_string(),
            ],
            cwd: "{instance_dir}".to_string(),
            env: vec!["GREETING={msg}".to_string()],
            stop: StopSpec::default(),
        };
        let cat = Catalogue::new(
            supervisor,
            HashMap::from([("echo".to_string(), template)]),
            HashMap::new(),
            Store::new(dir.path().join("instances.yaml")),
            dir.path().join("instances"),
            dir.path().join("logs"),
        );

        cat.create(
            "greeter",
            "echo",
            true,
            HashMap::from([("msg".to_string(), "hello".to_string())]),
        )
        .await
        .unwrap();

        let (spec, log_path) = cat.resolve("greeter").await.unwrap();
        assert_eq!(spec.command, "/bin/echo");
        assert_eq!(spec.args[0], "hello");
        assert_eq!(spec.args[1], "greeter");
        assert_eq!(spec.args[2], log_path.display().to_string());
        assert_eq!(spec.cwd, cat.instance_dir("greeter").display().to_string());
        assert_eq!(spec.env, vec!["GREETING=hello".to_string()]);
        assert_eq!(spec.stop.grace(), Duration::from_secs(10));
        // resolve created the cwd it rendered
        assert!(cat.instance_dir("greeter").exists());
    }

    #[tokio::test]
    async fn resolve_rejects_disabled_unknown_and_bad_templates() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue_in(&dir);

        assert!(matches!(
            cat.resolve("ghost").await,
            Err(CatalogueError::NotFound(_))
        ));

        cat.create("off", "sleeper", false, params("60")).await.unwrap();
        assert!(matches!(
            cat.resolve("off").await,
            Err(CatalogueError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn undefined_template_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue_in(&dir);

        // No "seconds" param supplied.
        cat.create("web", "sleeper", true, HashMap::new()).await.unwrap();
        match cat.resolve("web").await {
            Err(CatalogueError::Render { field: "args", source }) => {
                assert_eq!(source, RenderError::UndefinedKey("seconds".to_string()));
            }
            other => panic!("expected render error, got {other:?}"),
        }
    }

    #[test]
    fn render_substitutes_and_escapes() {
        let ctx = HashMap::from([("name".to_string(), "web".to_string())]);
        assert_eq!(render("run-{name}", &ctx).unwrap(), "run-web");
        assert_eq!(render("{{literal}}", &ctx).unwrap(), "{literal}");
        assert_eq!(
            render("{missing}", &ctx),
            Err(RenderError::UndefinedKey("missing".to_string()))
        );
        assert_eq!(render("{name", &ctx), Err(RenderError::Unclosed));
    }
}
