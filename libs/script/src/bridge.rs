//! Script invocation bridge.
//!
//! Each invocation gets a brand new store and instance that are dropped when
//! the call returns, so nothing a script does survives into the next call.
//! Only the compiled module is cached, keyed on the file's modification time.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};
use wasmtime::{Engine, ExternType, Instance, Module, Store, Val};

use crate::error::ScriptError;

/// Status returned for success.
pub const STATUS_SUCCESS: i32 = 0;

/// Generic failure status.
pub const STATUS_ERROR: i32 = -1;

/// Entry point that validates a job's burst buffer request.
pub const JOB_PROCESS_ENTRY_POINT: &str = "slurm_bb_job_process";

/// Script bridge configuration.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Location of the script module (binary or text format).
    pub path: PathBuf,
    /// Exports that must exist before anything is run.
    pub required_entry_points: Vec<String>,
    /// Execution budget per invocation; unlimited when `None`.
    pub fuel: Option<u64>,
}

impl ScriptConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required_entry_points: vec![JOB_PROCESS_ENTRY_POINT.to_string()],
            fuel: None,
        }
    }

    pub fn with_required_entry_points<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_entry_points = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fuel(mut self, fuel: Option<u64>) -> Self {
        self.fuel = fuel;
        self
    }
}

/// A compiled script and the modification time it was loaded at.
struct LoadedScript {
    modified: SystemTime,
    module: Module,
}

/// Runs named entry points of the configured script.
pub struct ScriptBridge {
    config: ScriptConfig,
    engine: Engine,
    loaded: Mutex<Option<LoadedScript>>,
}

impl ScriptBridge {
    pub fn new(config: ScriptConfig) -> Result<Self, ScriptError> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(config.fuel.is_some());

        let engine = Engine::new(&engine_config).map_err(|e| ScriptError::Load {
            path: config.path.clone(),
            cause: format!("engine: {e:#}"),
        })?;

        Ok(Self {
            config,
            engine,
            loaded: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Drop the cached module so the next call reloads from disk.
    pub fn invalidate(&self) {
        *self.loaded.lock() = None;
    }

    /// Run `entry_point` with no arguments.
    ///
    /// An integral numeric return value within `i32` range is the status
    /// code. Any other numeric value is an execution error. A non-numeric
    /// or missing return value is success.
    pub fn invoke(&self, entry_point: &str) -> Result<i32, ScriptError> {
        let module = self.module()?;

        let mut store = Store::new(&self.engine, ());
        if let Some(fuel) = self.config.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| self.execution(format!("failed to set fuel: {e:#}")))?;
        }

        let instance = Instance::new(&mut store, &module, &[])
            .map_err(|e| self.execution(format!("{e:#}")))?;

        let func = instance.get_func(&mut store, entry_point).ok_or_else(|| {
            ScriptError::EntryPointNotFound {
                path: self.config.path.clone(),
                name: entry_point.to_string(),
            }
        })?;

        let ty = func.ty(&store);
        if ty.params().len() != 0 {
            return Err(self.execution(format!(
                "{entry_point} expects {} arguments, none are passed",
                ty.params().len()
            )));
        }

        let mut results = vec![Val::I32(0); ty.results().len()];
        func.call(&mut store, &[], &mut results)
            .map_err(|e| self.execution(format!("{e:#}")))?;

        match results.first().map_or(ReturnCode::NonNumeric, ReturnCode::from_val) {
            ReturnCode::Status(rc) => {
                debug!(entry_point, rc, "Script returned");
                Ok(rc)
            }
            ReturnCode::Unrepresentable(value) => Err(self.execution(format!(
                "{entry_point} returned {value}, which is not a status code"
            ))),
            ReturnCode::NonNumeric => {
                info!(
                    path = %self.config.path.display(),
                    entry_point,
                    "Non-numeric return code, returning success"
                );
                Ok(STATUS_SUCCESS)
            }
        }
    }

    /// Current module, reloading it when the file changed on disk.
    fn module(&self) -> Result<Module, ScriptError> {
        let path = &self.config.path;
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| ScriptError::Load {
                path: path.clone(),
                cause: e.to_string(),
            })?;

        let mut loaded = self.loaded.lock();
        if let Some(script) = loaded.as_ref() {
            if script.modified == modified {
                return Ok(script.module.clone());
            }
        }

        // Fail closed: a broken reload never falls back to the old module.
        *loaded = None;
        let module = Module::from_file(&self.engine, path).map_err(|e| ScriptError::Load {
            path: path.clone(),
            cause: format!("{e:#}"),
        })?;
        self.verify_entry_points(&module)?;

        info!(path = %path.display(), "Loaded script");
        *loaded = Some(LoadedScript {
            modified,
            module: module.clone(),
        });
        Ok(module)
    }

    fn verify_entry_points(&self, module: &Module) -> Result<(), ScriptError> {
        for name in &self.config.required_entry_points {
            let is_func = matches!(module.get_export(name), Some(ExternType::Func(_)));
            if !is_func {
                return Err(ScriptError::MissingEntryPoint {
                    path: self.config.path.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn execution(&self, cause: String) -> ScriptError {
        ScriptError::Execution {
            path: self.config.path.clone(),
            cause,
        }
    }
}

/// How a script's return value maps onto a status code.
#[derive(Debug, Clone, PartialEq)]
enum ReturnCode {
    Status(i32),
    /// Numeric, but fractional, non-finite or outside `i32`.
    Unrepresentable(String),
    NonNumeric,
}

impl ReturnCode {
    fn from_val(val: &Val) -> Self {
        match *val {
            Val::I32(v) => Self::Status(v),
            Val::I64(v) => i32::try_from(v)
                .map(Self::Status)
                .unwrap_or_else(|_| Self::Unrepresentable(v.to_string())),
            Val::F32(bits) => Self::from_float(f64::from(f32::from_bits(bits))),
            Val::F64(bits) => Self::from_float(f64::from_bits(bits)),
            _ => Self::NonNumeric,
        }
    }

    fn from_float(v: f64) -> Self {
        let in_range = v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX);
        if v.is_finite() && v.fract() == 0.0 && in_range {
            Self::Status(v as i32)
        } else {
            Self::Unrepresentable(v.to_string())
        }
    }
}
