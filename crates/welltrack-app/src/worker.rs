use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempPath;
use welltrack_config::WorkerRuntimeConfig;
use welltrack_core::{params_to_value, CoreError, ParamMap, ParameterOverrideManager};
use welltrack_protocol::ItemId;
use welltrack_supervisor::{InvocationRequest, InvocationScope, WorkerCommand};

use crate::error::CoordinatorResult;

pub const ENV_TEMPLATE_DESCRIPTION_COUNT: &str = "WELLTRACK_TEMPLATE_DESCRIPTION_COUNT";
pub const ENV_TEMPLATE_PATH: &str = "WELLTRACK_TEMPLATE_PATH";
pub const ENV_DEBUG: &str = "WELLTRACK_DEBUG";

const DEFAULT_REGENERATION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TEMPLATE_DESCRIPTION_COUNT: u32 = 4;

/// How to start the worker and what to hand it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub command: WorkerCommand,
    pub regeneration_timeout: Duration,
    pub template_description_count: u32,
    pub template_path: Option<PathBuf>,
    pub debug: bool,
}

impl WorkerSettings {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            regeneration_timeout: DEFAULT_REGENERATION_TIMEOUT,
            template_description_count: DEFAULT_TEMPLATE_DESCRIPTION_COUNT,
            template_path: None,
            debug: false,
        }
    }

    pub fn from_runtime(runtime: &WorkerRuntimeConfig) -> Self {
        Self {
            command: WorkerCommand::new(&runtime.binary).with_base_args(runtime.base_args.clone()),
            regeneration_timeout: runtime.regeneration_timeout,
            template_description_count: runtime.template_description_count,
            template_path: runtime.template_path.clone(),
            debug: runtime.debug,
        }
    }

    fn environment(&self) -> Vec<(String, String)> {
        let mut environment = vec![(
            ENV_TEMPLATE_DESCRIPTION_COUNT.to_owned(),
            self.template_description_count.to_string(),
        )];
        if let Some(template_path) = &self.template_path {
            environment.push((
                ENV_TEMPLATE_PATH.to_owned(),
                template_path.display().to_string(),
            ));
        }
        if self.debug {
            environment.push((ENV_DEBUG.to_owned(), "1".to_owned()));
        }
        environment
    }

    /// `<input_dir> --parameters <global> [--overrides <per-item>]`
    pub(crate) fn batch_invocation(
        &self,
        input_dir: &Path,
        parameters: &ParameterOverrideManager,
    ) -> CoordinatorResult<PreparedInvocation> {
        let mut request = InvocationRequest::new(InvocationScope::Batch, input_dir);
        request.environment = self.environment();
        request.args.push(input_dir.display().to_string());

        let mut scratch = Vec::new();
        let global = write_scratch_file(&params_to_value(&parameters.parameters().global))?;
        request.args.push("--parameters".to_owned());
        request.args.push(global.display().to_string());
        scratch.push(global);

        if !parameters.parameters().overrides.is_empty() {
            let overrides = write_scratch_file(&parameters.overrides_document())?;
            request.args.push("--overrides".to_owned());
            request.args.push(overrides.display().to_string());
            scratch.push(overrides);
        }

        Ok(PreparedInvocation { request, scratch })
    }

    /// `<input_dir> --well <id> --parameters <effective>`, bounded by the
    /// regeneration timeout.
    pub(crate) fn item_invocation(
        &self,
        input_dir: &Path,
        id: &ItemId,
        effective: &ParamMap,
    ) -> CoordinatorResult<PreparedInvocation> {
        let mut request = InvocationRequest::new(InvocationScope::Item(id.clone()), input_dir);
        request.environment = self.environment();
        request.timeout = Some(self.regeneration_timeout);

        let parameters = write_scratch_file(&params_to_value(effective))?;
        request.args.extend([
            input_dir.display().to_string(),
            "--well".to_owned(),
            id.to_string(),
            "--parameters".to_owned(),
            parameters.display().to_string(),
        ]);

        Ok(PreparedInvocation {
            request,
            scratch: vec![parameters],
        })
    }
}

/// A request plus the temp files it references; the files are removed when
/// this is dropped, so it must outlive the invocation.
#[derive(Debug)]
pub(crate) struct PreparedInvocation {
    pub request: InvocationRequest,
    pub scratch: Vec<TempPath>,
}

fn write_scratch_file(document: &Value) -> CoordinatorResult<TempPath> {
    let persistence = |error: std::io::Error| CoreError::Persistence(error.to_string());
    let mut file = tempfile::Builder::new()
        .prefix("welltrack-params-")
        .suffix(".json")
        .tempfile()
        .map_err(persistence)?;
    serde_json::to_writer_pretty(&mut file, document).map_err(CoreError::from)?;
    file.flush().map_err(persistence)?;
    Ok(file.into_temp_path())
}
