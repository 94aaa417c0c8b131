use std::collections::HashMap;
use std::path::PathBuf;

use tempfile::TempPath;
use tokio::sync::{mpsc, oneshot, watch};
use welltrack_core::{
    AnalysisSession, BatchProgress, CacheManager, CoreError, ItemStateStore, ParamMap, ParameterFile,
    ParameterOverrideManager, ParameterSet, ProjectedView, RegenerationPlan, SessionKey,
    ViewFilters, ViewState,
};
use welltrack_protocol::{DiagnosticSource, ItemId, ProtocolEvent};
use welltrack_supervisor::{
    InvocationMessage, InvocationReport, InvocationScope, ProcessSupervisor, RunningInvocation,
};

use crate::cache_io::CacheIo;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::worker::{PreparedInvocation, WorkerSettings};

const COMMAND_BUFFER: usize = 64;
const WORKER_MESSAGE_BUFFER: usize = 1024;

pub struct CoordinatorSettings {
    pub worker: WorkerSettings,
    pub cache: CacheManager,
    /// Where `set_global` persists the global set; `None` keeps it in memory.
    pub parameter_file: Option<ParameterFile>,
    pub global_parameters: ParamMap,
}

/// What the presentation layer reads after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub session_key: Option<SessionKey>,
    pub generation: u64,
    pub view: ProjectedView,
    pub progress: BatchProgress,
}

#[derive(Debug)]
pub enum SessionStart {
    /// Restored from a usable cache; no worker was launched.
    Hydrated { items: usize },
    Launched(Completion),
}

/// Resolves when the invocation it was issued for exits.
#[derive(Debug)]
pub struct Completion {
    scope: InvocationScope,
    outcome: oneshot::Receiver<CoordinatorResult<()>>,
}

impl Completion {
    pub fn scope(&self) -> &InvocationScope {
        &self.scope
    }

    pub async fn wait(self) -> CoordinatorResult<()> {
        self.outcome.await.unwrap_or(Err(CoordinatorError::Shutdown))
    }
}

type Reply<T> = oneshot::Sender<CoordinatorResult<T>>;

enum Command {
    OpenSession {
        input_dir: PathBuf,
        refresh: bool,
        reply: Reply<SessionStart>,
    },
    SetGlobal {
        params: ParamMap,
        reply: Reply<Option<Completion>>,
    },
    SetOverride {
        id: ItemId,
        params: ParamMap,
        reply: Reply<Option<Completion>>,
    },
    ClearOverride {
        id: ItemId,
        reply: Reply<Option<Completion>>,
    },
    Regenerate {
        id: ItemId,
        reply: Reply<Completion>,
    },
    Cancel {
        reply: Reply<usize>,
    },
    SetFilters {
        filters: ViewFilters,
        reply: Reply<()>,
    },
    Select {
        id: Option<ItemId>,
        reply: Reply<Option<ItemId>>,
    },
    Snapshot {
        reply: Reply<Option<AnalysisSession>>,
    },
    Parameters {
        reply: Reply<ParameterSet>,
    },
    FlushCache {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct WorkerMessage {
    invocation_id: u64,
    generation: u64,
    scope: InvocationScope,
    message: InvocationMessage,
}

/// Handle to the coordinator task, the single point that mutates item
/// state. Cloning shares the same task.
#[derive(Debug, Clone)]
pub struct Coordinator {
    commands: mpsc::Sender<Command>,
    updates: watch::Receiver<SessionView>,
}

impl Coordinator {
    /// Starts the coordinator task. Must be called inside a tokio runtime.
    pub fn spawn(settings: CoordinatorSettings) -> Self {
        let (commands, command_receiver) = mpsc::channel(COMMAND_BUFFER);
        let (worker_sender, worker_receiver) = mpsc::channel(WORKER_MESSAGE_BUFFER);
        let (update_sender, updates) = watch::channel(SessionView::default());

        let actor = CoordinatorActor {
            supervisor: ProcessSupervisor::new(settings.worker.command.clone()),
            worker: settings.worker,
            cache: CacheIo::spawn(settings.cache),
            parameter_file: settings.parameter_file,
            parameters: ParameterOverrideManager::new(settings.global_parameters),
            store: None,
            view: ViewState::default(),
            generation: 0,
            pending: HashMap::new(),
            worker_sender,
            updates: update_sender,
        };
        tokio::spawn(actor.run(command_receiver, worker_receiver));

        Self { commands, updates }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.updates.clone()
    }

    pub fn current_view(&self) -> SessionView {
        self.updates.borrow().clone()
    }

    /// Starts a session for `input_dir`, discarding the previous one.
    ///
    /// A usable cache is loaded without launching the worker unless
    /// `refresh` is set, which invalidates the cache and relaunches.
    pub async fn open_session(
        &self,
        input_dir: impl Into<PathBuf>,
        refresh: bool,
    ) -> CoordinatorResult<SessionStart> {
        let input_dir = input_dir.into();
        self.request(|reply| Command::OpenSession {
            input_dir,
            refresh,
            reply,
        })
        .await
    }

    /// Replaces the global parameters. With a live session every item is
    /// recomputed from scratch.
    pub async fn set_global(&self, params: ParamMap) -> CoordinatorResult<Option<Completion>> {
        self.request(|reply| Command::SetGlobal { params, reply }).await
    }

    /// Sets the item's override and regenerates it when it is part of the
    /// live session.
    pub async fn set_override(
        &self,
        id: ItemId,
        params: ParamMap,
    ) -> CoordinatorResult<Option<Completion>> {
        self.request(|reply| Command::SetOverride { id, params, reply })
            .await
    }

    pub async fn clear_override(&self, id: ItemId) -> CoordinatorResult<Option<Completion>> {
        self.request(|reply| Command::ClearOverride { id, reply }).await
    }

    pub async fn regenerate(&self, id: ItemId) -> CoordinatorResult<Completion> {
        self.request(|reply| Command::Regenerate { id, reply }).await
    }

    /// Stops every in-flight invocation. Already merged items stay.
    pub async fn cancel(&self) -> CoordinatorResult<usize> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    pub async fn set_filters(&self, filters: ViewFilters) -> CoordinatorResult<()> {
        self.request(|reply| Command::SetFilters { filters, reply })
            .await
    }

    /// Returns the selection that survived projection.
    pub async fn select(&self, id: Option<ItemId>) -> CoordinatorResult<Option<ItemId>> {
        self.request(|reply| Command::Select { id, reply }).await
    }

    pub async fn snapshot(&self) -> CoordinatorResult<Option<AnalysisSession>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn parameters(&self) -> CoordinatorResult<ParameterSet> {
        self.request(|reply| Command::Parameters { reply }).await
    }

    /// Waits for every cache write issued so far to land.
    pub async fn flush_cache(&self) -> CoordinatorResult<()> {
        self.request(|reply| Command::FlushCache { reply }).await
    }

    pub async fn shutdown(&self) -> CoordinatorResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> CoordinatorResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CoordinatorError::Shutdown)?;
        response.await.map_err(|_| CoordinatorError::Shutdown)?
    }
}

struct PendingInvocation {
    outcome: oneshot::Sender<CoordinatorResult<()>>,
    _scratch: Vec<TempPath>,
}

struct CoordinatorActor {
    supervisor: ProcessSupervisor,
    worker: WorkerSettings,
    cache: CacheIo,
    parameter_file: Option<ParameterFile>,
    parameters: ParameterOverrideManager,
    store: Option<ItemStateStore>,
    view: ViewState,
    /// Bumped on every session reset; messages stamped with an older
    /// generation are dropped.
    generation: u64,
    pending: HashMap<u64, PendingInvocation>,
    worker_sender: mpsc::Sender<WorkerMessage>,
    updates: watch::Sender<SessionView>,
}

impl CoordinatorActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut worker_messages: mpsc::Receiver<WorkerMessage>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop_all();
                        self.cache.flush().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop_all();
                        break;
                    }
                },
                Some(message) = worker_messages.recv() => self.handle_worker_message(message),
            }
        }
        tracing::debug!("coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenSession {
                input_dir,
                refresh,
                reply,
            } => {
                let _ = reply.send(self.open_session(input_dir, refresh).await);
            }
            Command::SetGlobal { params, reply } => {
                let _ = reply.send(self.set_global(params).await);
            }
            Command::SetOverride { id, params, reply } => {
                let _ = reply.send(self.change_override(id, Some(params)));
            }
            Command::ClearOverride { id, reply } => {
                let _ = reply.send(self.change_override(id, None));
            }
            Command::Regenerate { id, reply } => {
                let _ = reply.send(self.regenerate(&id));
            }
            Command::Cancel { reply } => {
                let _ = reply.send(Ok(self.supervisor.cancel_all()));
            }
            Command::SetFilters { filters, reply } => {
                self.view.set_filters(filters);
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::Select { id, reply } => {
                self.view.select(id);
                let selected = self.publish();
                let _ = reply.send(Ok(selected));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.store.as_ref().map(ItemStateStore::snapshot)));
            }
            Command::Parameters { reply } => {
                let _ = reply.send(Ok(self.parameters.parameters().clone()));
            }
            Command::FlushCache { reply } => {
                self.cache.flush().await;
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn open_session(
        &mut self,
        input_dir: PathBuf,
        refresh: bool,
    ) -> CoordinatorResult<SessionStart> {
        self.stop_all();
        self.generation += 1;
        let mut store = ItemStateStore::for_input(&input_dir);
        store.sync_overrides(self.parameters.overridden_ids());
        let session_key = store.session().session_key.clone();
        self.store = Some(store);
        tracing::info!(
            input_dir = %input_dir.display(),
            session_key = %session_key,
            generation = self.generation,
            refresh,
            "opening session"
        );

        if refresh {
            self.cache.invalidate(session_key);
        } else {
            let lookup = self.cache.lookup(session_key.clone()).await;
            if let Some(reason) = lookup.miss_reason() {
                tracing::info!(session_key = %session_key, reason = reason.as_str(), "no usable cache");
            }
            if let Some(envelope) = lookup.into_envelope() {
                let store = self.store_mut()?;
                store.hydrate(&envelope.results);
                let items = store.len();
                tracing::info!(session_key = %session_key, items, "hydrated session from cache");
                self.publish();
                return Ok(SessionStart::Hydrated { items });
            }
        }

        self.publish();
        self.launch_batch().map(SessionStart::Launched)
    }

    async fn set_global(&mut self, params: ParamMap) -> CoordinatorResult<Option<Completion>> {
        let plan = self.parameters.set_global(params);
        if let Some(parameter_file) = self.parameter_file.clone() {
            let global = self.parameters.parameters().global.clone();
            let saved = tokio::task::spawn_blocking(move || parameter_file.save_merged(&global))
                .await
                .map_err(|error| CoreError::Persistence(error.to_string()))?;
            match saved {
                // The file keeps keys the caller did not mention; the batch
                // must see the same set a later restart would load.
                Ok(merged) => {
                    self.parameters.set_global(merged);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "failed to persist global parameters");
                }
            }
        }
        self.apply_plan(plan)
    }

    /// Sets (`Some`) or clears (`None`) one override and regenerates the
    /// item. If the regeneration cannot start, the previous override is
    /// restored so parameters keep matching the item's stored result.
    fn change_override(
        &mut self,
        id: ItemId,
        params: Option<ParamMap>,
    ) -> CoordinatorResult<Option<Completion>> {
        let previous = self.parameters.parameters().overrides.get(&id).cloned();
        let plan = match params {
            Some(params) => self.parameters.set_override(id.clone(), params),
            None => self.parameters.clear_override(&id),
        };
        let applied = self.apply_plan(plan);
        if let Err(error) = &applied {
            tracing::warn!(
                item_id = %id,
                error = %error,
                "override rejected, restoring previous parameters"
            );
            match previous {
                Some(previous) => self.parameters.set_override(id, previous),
                None => self.parameters.clear_override(&id),
            };
            let overridden = self.parameters.overridden_ids();
            if let Some(store) = self.store.as_mut() {
                store.sync_overrides(overridden);
            }
            self.publish();
        }
        applied
    }

    fn apply_plan(&mut self, plan: RegenerationPlan) -> CoordinatorResult<Option<Completion>> {
        match plan {
            RegenerationPlan::FullRestart => self.restart_session(),
            RegenerationPlan::Item(id) => self.refresh_item(id),
        }
    }

    /// Drops every item, fences off in-flight work, and relaunches the batch.
    fn restart_session(&mut self) -> CoordinatorResult<Option<Completion>> {
        let Some(store) = self.store.as_mut() else {
            return Ok(None);
        };
        let cancelled = self.supervisor.cancel_all();
        self.generation += 1;
        let session_key = store.session().session_key.clone();
        let input_dir = store.session().input_dir.clone();
        store.reset(session_key.clone(), input_dir);
        store.sync_overrides(self.parameters.overridden_ids());
        self.cache.invalidate(session_key.clone());
        tracing::info!(
            session_key = %session_key,
            cancelled,
            generation = self.generation,
            "global parameters changed, restarting batch"
        );

        self.publish();
        self.launch_batch().map(Some)
    }

    fn refresh_item(&mut self, id: ItemId) -> CoordinatorResult<Option<Completion>> {
        let overridden = self.parameters.overridden_ids();
        let Some(store) = self.store.as_mut() else {
            return Ok(None);
        };
        store.sync_overrides(overridden);
        let known = store.session().item(&id).is_some();
        self.publish();
        if !known {
            tracing::debug!(item_id = %id, "override recorded for an item not yet in the session");
            return Ok(None);
        }
        self.regenerate(&id).map(Some)
    }

    fn regenerate(&mut self, id: &ItemId) -> CoordinatorResult<Completion> {
        let store = self.store.as_ref().ok_or(CoordinatorError::NoActiveSession)?;
        if store.session().item(id).is_none() {
            return Err(CoordinatorError::UnknownItem(id.clone()));
        }
        let effective = self.parameters.effective_params(id);
        let prepared = self
            .worker
            .item_invocation(&store.session().input_dir, id, &effective)?;
        tracing::info!(item_id = %id, "regenerating item");
        self.launch(prepared)
    }

    fn launch_batch(&mut self) -> CoordinatorResult<Completion> {
        let input_dir = self.input_dir()?;
        let prepared = self.worker.batch_invocation(&input_dir, &self.parameters)?;
        self.launch(prepared)
    }

    fn launch(&mut self, prepared: PreparedInvocation) -> CoordinatorResult<Completion> {
        let PreparedInvocation { request, scratch } = prepared;
        let scope = request.scope.clone();
        let running = self.supervisor.launch(request)?;
        let (outcome_sender, outcome) = oneshot::channel();
        self.pending.insert(
            running.invocation_id(),
            PendingInvocation {
                outcome: outcome_sender,
                _scratch: scratch,
            },
        );
        forward_messages(running, self.generation, self.worker_sender.clone());
        Ok(Completion { scope, outcome })
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        let WorkerMessage {
            invocation_id,
            generation,
            scope,
            message,
        } = message;
        match message {
            InvocationMessage::Event(event) => {
                if generation != self.generation {
                    tracing::debug!(
                        invocation_id,
                        generation,
                        current = self.generation,
                        "dropping event from a superseded session"
                    );
                    return;
                }
                self.apply_event(&scope, &event);
            }
            InvocationMessage::Exited(report) => self.finish_invocation(invocation_id, generation, report),
        }
    }

    fn apply_event(&mut self, scope: &InvocationScope, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::ItemStarted { file } => {
                tracing::debug!(scope = %scope, file = file.as_str(), "worker started file");
                return;
            }
            ProtocolEvent::Diagnostic(diagnostic) => {
                match diagnostic.source {
                    DiagnosticSource::Debug => {
                        tracing::debug!(scope = %scope, message = diagnostic.message.as_str(), "worker debug");
                    }
                    DiagnosticSource::Unrecognized => {
                        tracing::debug!(scope = %scope, line = diagnostic.message.as_str(), "unrecognized worker line");
                    }
                }
                return;
            }
            ProtocolEvent::Malformed(_) => return,
            _ => {}
        }

        let target = match scope {
            InvocationScope::Batch => None,
            InvocationScope::Item(id) => Some(id),
        };
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let applied = store.apply_event(event, target);
        if applied.needs_save() {
            self.cache.save(store.snapshot());
        }
        if !applied.is_empty() {
            self.publish();
        }
    }

    fn finish_invocation(&mut self, invocation_id: u64, generation: u64, report: InvocationReport) {
        let outcome = report.outcome.clone().map_err(CoordinatorError::from);
        match &outcome {
            Ok(()) => tracing::info!(
                invocation_id,
                scope = %report.scope,
                lines = report.parser_stats.lines,
                malformed_lines = report.parser_stats.malformed_lines,
                "invocation finished"
            ),
            Err(error) => tracing::warn!(
                invocation_id,
                scope = %report.scope,
                exit_code = ?report.exit_code,
                stale = generation != self.generation,
                error = %error,
                "invocation failed"
            ),
        }

        if let Some(pending) = self.pending.remove(&invocation_id) {
            let _ = pending.outcome.send(outcome);
        }
    }

    /// Recomputes the projection and publishes it; returns the selection
    /// that survived.
    fn publish(&mut self) -> Option<ItemId> {
        let (session_key, view, progress) = match &self.store {
            Some(store) => (
                Some(store.session().session_key.clone()),
                self.view.project(store.session()),
                store.session().progress,
            ),
            None => (None, ProjectedView::default(), BatchProgress::default()),
        };
        let selected = view.selected.clone();
        self.updates.send_replace(SessionView {
            session_key,
            generation: self.generation,
            view,
            progress,
        });
        selected
    }

    fn stop_all(&mut self) {
        let cancelled = self.supervisor.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled in-flight invocations");
        }
    }

    fn store_mut(&mut self) -> CoordinatorResult<&mut ItemStateStore> {
        self.store.as_mut().ok_or(CoordinatorError::NoActiveSession)
    }

    fn input_dir(&self) -> CoordinatorResult<PathBuf> {
        self.store
            .as_ref()
            .map(|store| store.session().input_dir.clone())
            .ok_or(CoordinatorError::NoActiveSession)
    }
}

fn forward_messages(
    mut running: RunningInvocation,
    generation: u64,
    sender: mpsc::Sender<WorkerMessage>,
) {
    tokio::spawn(async move {
        let invocation_id = running.invocation_id();
        let scope = running.scope().clone();
        while let Some(message) = running.next_message().await {
            let exited = matches!(message, InvocationMessage::Exited(_));
            let forwarded = WorkerMessage {
                invocation_id,
                generation,
                scope: scope.clone(),
                message,
            };
            if sender.send(forwarded).await.is_err() || exited {
                break;
            }
        }
    });
}
