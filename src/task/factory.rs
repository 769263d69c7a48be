//! Layered component resolution and manager assembly.
//!
//! For every component kind of a task the factory picks the first match of:
//! 1. a task-specific class registered for `(task, kind)`
//! 2. `<kind>.type` in the task's configuration
//! 3. `<kind>.type` in the global defaults
//! 4. the built-in default for the kind
//!
//! Configured ids are looked up as `<task>::<id>` first, then as `<id>`. A
//! well-formed id with no registered implementation falls through to the
//! next level.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use super::executor::{MemoryStatus, NoopExecutor, SharedStatus};
use super::manager::TaskManager;
use super::process::SameProcess;
use super::queue::{EmptyQueue, MemoryStatistics};
use super::timer::{
    CRON_EXPRESSION_KEY, CronTimer, DEFAULT_CRON_EXPRESSION, INTERVAL_TIME_KEY, IntervalTimer,
};
use super::{ComponentKind, Executor, Manager, Process, Queue, Statistics, Status, Timer};
use crate::config::ConfigProvider;
use crate::daemon::state::DaemonState;
use crate::error::FactoryError;

static COMPONENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_:/.\-]+$").expect("component id pattern"));

/// Built-in implementation id used when nothing else is configured.
pub fn builtin_id(kind: ComponentKind) -> &'static str {
    match kind {
        ComponentKind::Manager => "default",
        ComponentKind::Trigger => "interval",
        ComponentKind::Queue => "empty",
        ComponentKind::Statistics => "memory",
        ComponentKind::Process => "same",
        ComponentKind::Executor => "noop",
        ComponentKind::Status => "memory",
    }
}

/// Everything a constructor may read while building one component.
pub struct BuildContext<'a> {
    pub task: &'a str,
    pub config: &'a ConfigProvider,
    pub state: &'a DaemonState,
}

impl BuildContext<'_> {
    fn configuration_error(&self, kind: ComponentKind, message: impl Into<String>) -> FactoryError {
        FactoryError::Configuration {
            task: self.task.to_string(),
            kind,
            message: message.into(),
        }
    }
}

type Constructor<T> =
    Box<dyn Fn(&BuildContext<'_>) -> Result<Box<T>, FactoryError> + Send + Sync>;

/// Constructors for one component kind.
pub struct Catalog<T: ?Sized> {
    task_classes: HashMap<String, Constructor<T>>,
    named: HashMap<String, Constructor<T>>,
}

impl<T: ?Sized> Default for Catalog<T> {
    fn default() -> Self {
        Self {
            task_classes: HashMap::new(),
            named: HashMap::new(),
        }
    }
}

impl<T: ?Sized> Catalog<T> {
    pub fn has_task_class(&self, task: &str) -> bool {
        self.task_classes.contains_key(task)
    }

    pub fn has_named(&self, id: &str) -> bool {
        self.named.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn named_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.named.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Maps a component trait object to its catalog in the registry.
pub trait Component {
    const KIND: ComponentKind;

    fn catalog(registry: &ComponentRegistry) -> &Catalog<Self>;
    fn catalog_mut(registry: &mut ComponentRegistry) -> &mut Catalog<Self>;
}

macro_rules! component {
    ($trait:ident, $kind:ident, $field:ident) => {
        impl Component for dyn $trait {
            const KIND: ComponentKind = ComponentKind::$kind;

            fn catalog(registry: &ComponentRegistry) -> &Catalog<Self> {
                &registry.$field
            }

            fn catalog_mut(registry: &mut ComponentRegistry) -> &mut Catalog<Self> {
                &mut registry.$field
            }
        }
    };
}

component!(Manager, Manager, managers);
component!(Timer, Trigger, triggers);
component!(Queue, Queue, queues);
component!(Statistics, Statistics, statistics);
component!(Process, Process, processes);
component!(Executor, Executor, executors);
component!(Status, Status, statuses);

/// All known component implementations.
#[derive(Default)]
pub struct ComponentRegistry {
    managers: Catalog<dyn Manager>,
    triggers: Catalog<dyn Timer>,
    queues: Catalog<dyn Queue>,
    statistics: Catalog<dyn Statistics>,
    processes: Catalog<dyn Process>,
    executors: Catalog<dyn Executor>,
    statuses: Catalog<dyn Status>,
}

impl ComponentRegistry {
    /// Empty registry with no implementations at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in implementation of every kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_named::<dyn Manager, _>("default", |ctx| {
            let manager = TaskManager::new(ctx.task)
                .with_sleep_tick(ctx.config.settings().sleep_tick())
                .with_daemon_state(ctx.state.clone());
            Ok(Box::new(manager))
        });

        registry.register_named::<dyn Timer, _>("interval", |ctx| {
            let micros = ctx.config.option_i64(INTERVAL_TIME_KEY, ctx.task).unwrap_or(0);
            Ok(Box::new(IntervalTimer::new(micros)))
        });
        registry.register_named::<dyn Timer, _>("cron", |ctx| {
            let expression = ctx
                .config
                .option_str(CRON_EXPRESSION_KEY, ctx.task)
                .unwrap_or(DEFAULT_CRON_EXPRESSION);
            let timer = CronTimer::new(expression).map_err(|e| {
                ctx.configuration_error(
                    ComponentKind::Trigger,
                    format!("invalid cron expression {expression:?}: {e}"),
                )
            })?;
            Ok(Box::new(timer))
        });

        registry.register_named::<dyn Queue, _>("empty", |_| Ok(Box::new(EmptyQueue)));
        registry.register_named::<dyn Statistics, _>("memory", |_| {
            Ok(Box::new(MemoryStatistics::new()))
        });
        registry.register_named::<dyn Process, _>("same", |_| Ok(Box::new(SameProcess::new())));
        registry.register_named::<dyn Executor, _>("noop", |_| Ok(Box::new(NoopExecutor)));
        registry.register_named::<dyn Status, _>("memory", |_| Ok(Box::new(MemoryStatus::new())));
        registry.register_named::<dyn Status, _>("shared", |ctx| {
            Ok(Box::new(SharedStatus::new(ctx.task, ctx.state.store().clone())))
        });

        registry
    }

    /// Register the implementation of `T` that always wins for `task`.
    pub fn register_task<T, F>(&mut self, task: &str, constructor: F)
    where
        T: Component + ?Sized,
        F: Fn(&BuildContext<'_>) -> Result<Box<T>, FactoryError> + Send + Sync + 'static,
    {
        T::catalog_mut(self)
            .task_classes
            .insert(task.to_string(), Box::new(constructor));
    }

    /// Register an implementation selectable by `<kind>.type = "<id>"`.
    /// Use an id of the form `<task>::<name>` to scope it to one task.
    pub fn register_named<T, F>(&mut self, id: &str, constructor: F)
    where
        T: Component + ?Sized,
        F: Fn(&BuildContext<'_>) -> Result<Box<T>, FactoryError> + Send + Sync + 'static,
    {
        T::catalog_mut(self)
            .named
            .insert(id.to_string(), Box::new(constructor));
    }

    pub fn catalog<T: Component + ?Sized>(&self) -> &Catalog<T> {
        T::catalog(self)
    }

    fn has_task_class(&self, kind: ComponentKind, task: &str) -> bool {
        match kind {
            ComponentKind::Manager => self.managers.has_task_class(task),
            ComponentKind::Trigger => self.triggers.has_task_class(task),
            ComponentKind::Queue => self.queues.has_task_class(task),
            ComponentKind::Statistics => self.statistics.has_task_class(task),
            ComponentKind::Process => self.processes.has_task_class(task),
            ComponentKind::Executor => self.executors.has_task_class(task),
            ComponentKind::Status => self.statuses.has_task_class(task),
        }
    }

    fn has_named(&self, kind: ComponentKind, id: &str) -> bool {
        match kind {
            ComponentKind::Manager => self.managers.has_named(id),
            ComponentKind::Trigger => self.triggers.has_named(id),
            ComponentKind::Queue => self.queues.has_named(id),
            ComponentKind::Statistics => self.statistics.has_named(id),
            ComponentKind::Process => self.processes.has_named(id),
            ComponentKind::Executor => self.executors.has_named(id),
            ComponentKind::Status => self.statuses.has_named(id),
        }
    }
}

/// `<kind>.type` entries of one configuration scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentOverrides {
    ids: BTreeMap<ComponentKind, String>,
}

impl ComponentOverrides {
    /// Read both `kind = { type = "..." }` and literal `"kind.type"` keys.
    /// Other keys are ignored.
    pub fn parse(table: &toml::Table, task: &str) -> Result<Self, FactoryError> {
        let mut ids = BTreeMap::new();
        for (key, value) in table {
            let (kind_name, raw) = if let Some(kind_name) = key.strip_suffix(".type") {
                (kind_name, value)
            } else if let Some(raw) = value.as_table().and_then(|t| t.get("type")) {
                (key.as_str(), raw)
            } else {
                continue;
            };
            let kind: ComponentKind = kind_name.parse()?;
            ids.insert(kind, validate_id(task, kind, raw)?);
        }
        Ok(Self { ids })
    }

    pub fn get(&self, kind: ComponentKind) -> Option<&str> {
        self.ids.get(&kind).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn validate_id(task: &str, kind: ComponentKind, raw: &toml::Value) -> Result<String, FactoryError> {
    let invalid = |message: String| FactoryError::Configuration {
        task: task.to_string(),
        kind,
        message,
    };
    let id = raw
        .as_str()
        .ok_or_else(|| invalid(format!("{} must be a string, got {}", kind.type_key(), raw.type_str())))?;
    if id.is_empty() {
        return Err(invalid(format!("{} is empty", kind.type_key())));
    }
    if !COMPONENT_ID.is_match(id) {
        return Err(invalid(format!("{id:?} is not a valid component id")));
    }
    Ok(id.to_string())
}

/// Which precedence level produced a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    TaskClass,
    TaskConfig,
    GlobalConfig,
    Builtin,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TaskClass => "task class",
            Self::TaskConfig => "task configuration",
            Self::GlobalConfig => "global configuration",
            Self::Builtin => "built-in default",
        };
        write!(f, "{s}")
    }
}

/// Outcome of resolving one component kind for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub source: ResolutionSource,
    /// Registered id; the task name for task classes.
    pub id: String,
}

/// Builds fully assembled managers.
pub struct ComponentFactory {
    registry: ComponentRegistry,
    config: ConfigProvider,
    state: DaemonState,
}

impl ComponentFactory {
    pub fn new(registry: ComponentRegistry, config: ConfigProvider, state: DaemonState) -> Self {
        Self {
            registry,
            config,
            state,
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ConfigProvider {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigProvider {
        &mut self.config
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Decide which implementation of `kind` the task gets.
    pub fn resolve(&self, task: &str, kind: ComponentKind) -> Result<Resolution, FactoryError> {
        if self.registry.has_task_class(kind, task) {
            return Ok(Resolution {
                source: ResolutionSource::TaskClass,
                id: task.to_string(),
            });
        }

        let scopes = [
            (
                ResolutionSource::TaskConfig,
                ComponentOverrides::parse(&self.config.task_table(task), task)?,
            ),
            (
                ResolutionSource::GlobalConfig,
                ComponentOverrides::parse(self.config.defaults(), task)?,
            ),
        ];
        for (source, overrides) in &scopes {
            let Some(id) = overrides.get(kind) else {
                continue;
            };
            let scoped = format!("{task}::{id}");
            if let Some(found) = [scoped.as_str(), id]
                .into_iter()
                .find(|candidate| self.registry.has_named(kind, candidate))
            {
                return Ok(Resolution {
                    source: *source,
                    id: found.to_string(),
                });
            }
            tracing::debug!(
                task = %task,
                kind = %kind,
                id = %id,
                "Configured {} is not registered, trying next level", source
            );
        }

        Ok(Resolution {
            source: ResolutionSource::Builtin,
            id: builtin_id(kind).to_string(),
        })
    }

    /// Resolution of every kind, in assembly order.
    pub fn describe(&self, task: &str) -> Result<Vec<(ComponentKind, Resolution)>, FactoryError> {
        ComponentKind::ALL
            .into_iter()
            .map(|kind| self.resolve(task, kind).map(|r| (kind, r)))
            .collect()
    }

    /// Build one component of kind `T` for the task.
    pub fn build<T: Component + ?Sized>(&self, task: &str) -> Result<Box<T>, FactoryError> {
        let resolution = self.resolve(task, T::KIND)?;
        let catalog = T::catalog(&self.registry);
        let constructor = match resolution.source {
            ResolutionSource::TaskClass => catalog.task_classes.get(task),
            _ => catalog.named.get(&resolution.id),
        }
        .ok_or_else(|| FactoryError::Configuration {
            task: task.to_string(),
            kind: T::KIND,
            message: format!("no implementation registered as {:?}", resolution.id),
        })?;

        let ctx = BuildContext {
            task,
            config: &self.config,
            state: &self.state,
        };
        let component = constructor(&ctx)?;
        let kind = T::KIND;
        tracing::debug!(
            task = %task,
            kind = %kind,
            id = %resolution.id,
            "Created {} component using {}", kind, resolution.source
        );
        Ok(component)
    }

    /// Assemble the task's manager in the fixed order
    /// manager, trigger, queue, statistics, process, executor, status.
    pub fn get(&self, task: &str) -> Result<Box<dyn Manager>, FactoryError> {
        let mut manager = self.build::<dyn Manager>(task)?;
        if manager.name() != task {
            return Err(FactoryError::Assembly {
                task: task.to_string(),
                kind: ComponentKind::Manager,
                reason: format!("manager is named {:?}", manager.name()),
            });
        }
        manager.attach_trigger(self.build::<dyn Timer>(task)?)?;
        manager.attach_queue(self.build::<dyn Queue>(task)?)?;
        manager.attach_statistics(self.build::<dyn Statistics>(task)?)?;
        manager.attach_process(self.build::<dyn Process>(task)?)?;
        manager.attach_executor(self.build::<dyn Executor>(task)?)?;
        manager.attach_status(self.build::<dyn Status>(task)?)?;
        Ok(manager)
    }
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
