use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use reverie_core::{
    decode_history, parse_profile, parse_scene, tally_facets, validate_archetype,
    validate_chosen_action, validate_player_name, GameError, GameId, GameSummary,
    PersonalityProfile, Scene, SceneStage, TurnData, TurnRecord, HISTORY_WINDOW,
    OPTIONS_PER_SCENE,
};
use reverie_provider::{GenerationProvider, GenerationRequest, ProviderError};
use reverie_store_sqlite::{
    is_busy_error, AppendConflict, IntegrityReport, SchemaStatus, SqliteStore,
    DEFAULT_BUSY_TIMEOUT,
};
use serde::{Deserialize, Serialize};

mod roles;

pub use roles::{Operation, PipelineStep, RoleProfile, RoleRoster, Transition};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    Generation,
    Storage,
    Request,
}

impl Display for TimeoutStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Generation => "generation",
            Self::Storage => "storage",
            Self::Request => "request",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientHistory,
    GenerationParse,
    Generation,
    Storage,
    Timeout,
    Conflict,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::InsufficientHistory => "insufficient_history",
            Self::GenerationParse => "generation_parse",
            Self::Generation => "generation",
            Self::Storage => "storage",
            Self::Timeout => "timeout",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SessionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no history for game {game_id}")]
    NotFound { game_id: GameId },
    #[error("game {game_id} has {found} turns; finalize requires at least {required}")]
    InsufficientHistory { game_id: GameId, found: u64, required: u64 },
    #[error("generation output could not be parsed: {message}")]
    GenerationParse { message: String, raw_output: String },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{stage} timed out")]
    Timeout { stage: TimeoutStage },
    #[error(
        "game {game_id} advanced concurrently: expected last sequence {expected:?}, found {actual:?}"
    )]
    Conflict { game_id: GameId, expected: Option<u64>, actual: Option<u64> },
}

impl SessionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
            Self::GenerationParse { .. } => ErrorKind::GenerationParse,
            Self::Generation(_) => ErrorKind::Generation,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Conflict { .. } => ErrorKind::Conflict,
        }
    }

    /// Model text that failed to parse, when that is what went wrong.
    #[must_use]
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::GenerationParse { raw_output, .. } => Some(raw_output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Stored turns required before a game can be finalized.
    pub min_finalize_turns: u64,
    pub store_busy_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { min_finalize_turns: 1, store_busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartGameRequest {
    pub name: String,
    pub initial_archetype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayTurnRequest {
    pub game_id: String,
    pub chosen_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizeRequest {
    pub game_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SceneResponse {
    pub game_id: GameId,
    #[serde(flatten)]
    pub scene: Scene,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileResponse {
    pub game_id: GameId,
    #[serde(flatten)]
    pub profile: PersonalityProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryResponse {
    pub game_id: GameId,
    pub turns: Vec<TurnRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Provider-free access to the history database, for operators and read-only routes.
#[derive(Debug, Clone)]
pub struct HistoryApi {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl HistoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_busy_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    #[must_use]
    pub fn with_busy_timeout(db_path: PathBuf, busy_timeout: Duration) -> Self {
        Self { db_path, busy_timeout }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_busy_timeout(&self.db_path, self.busy_timeout)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the store cannot be opened, migrated, or read.
    pub fn list_games(&self) -> Result<Vec<GameSummary>> {
        self.open_migrated_store()?.list_games()
    }

    /// Stored turns for `game_id`, oldest first; `limit` keeps only the most recent N.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened, migrated, or read.
    pub fn turns(&self, game_id: GameId, limit: Option<usize>) -> Result<Vec<TurnRecord>> {
        let store = self.open_migrated_store()?;
        match limit {
            Some(limit) => store.fetch_recent(game_id, limit),
            None => store.fetch_all(game_id),
        }
    }
}

/// Runs the start, continue, and finalize transitions against one history database.
#[derive(Clone)]
pub struct SessionApi {
    history: HistoryApi,
    provider: Arc<dyn GenerationProvider>,
    config: PipelineConfig,
    roles: RoleRoster,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for SessionApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionApi")
            .field("history", &self.history)
            .field("provider", &self.provider.provider_name())
            .field("config", &self.config)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl SessionApi {
    #[must_use]
    pub fn new(
        db_path: PathBuf,
        provider: Arc<dyn GenerationProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            history: HistoryApi::with_busy_timeout(db_path, config.store_busy_timeout),
            provider,
            config,
            roles: RoleRoster::default(),
            deadline: None,
        }
    }

    /// Bound every later call on this handle by `deadline`.
    ///
    /// A call that reaches `deadline` fails with `Timeout { stage: Request }`. The store is
    /// not written once the deadline has passed, so a timed-out call leaves no turn behind.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Replace the default role roster.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] when a role lacks an operation its steps need.
    pub fn with_roles(mut self, roles: RoleRoster) -> Result<Self, SessionError> {
        roles.validate().map_err(SessionError::Validation)?;
        self.roles = roles;
        Ok(self)
    }

    #[must_use]
    pub fn history_api(&self) -> &HistoryApi {
        &self.history
    }

    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Begin a game: generate the opening scene and store it as turn 1 of a new game.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] for a malformed name or archetype, and any
    /// generation, parse, storage, or timeout failure from the pipeline.
    pub fn start_game(&self, request: &StartGameRequest) -> Result<SceneResponse, SessionError> {
        validate_player_name(&request.name).map_err(validation_error)?;
        validate_archetype(&request.initial_archetype).map_err(validation_error)?;

        let mut context = TurnContext::new(
            GameId::new(),
            TurnInput::Start {
                player_name: request.name.clone(),
                archetype: request.initial_archetype.trim().to_string(),
            },
        );
        self.run(Transition::Start, &mut context)?;
        context.into_scene_response()
    }

    /// Advance a game by one turn using the player's chosen action.
    ///
    /// # Errors
    /// Returns [`SessionError::NotFound`] for an unknown game (before any generation call),
    /// [`SessionError::Conflict`] when another turn was stored first, and any generation,
    /// parse, storage, or timeout failure.
    pub fn play_turn(&self, request: &PlayTurnRequest) -> Result<SceneResponse, SessionError> {
        let game_id = parse_game_id(&request.game_id)?;
        validate_chosen_action(&request.chosen_action).map_err(validation_error)?;

        let mut context = TurnContext::new(
            game_id,
            TurnInput::Continue { chosen_action: request.chosen_action.trim().to_string() },
        );
        self.run(Transition::Continue, &mut context)?;
        context.into_scene_response()
    }

    /// Produce the personality profile for a finished game. Nothing is written back.
    ///
    /// # Errors
    /// Returns [`SessionError::NotFound`] for a game with no history and
    /// [`SessionError::InsufficientHistory`] below the configured minimum; neither calls
    /// the generation capability.
    pub fn finalize(&self, request: &FinalizeRequest) -> Result<ProfileResponse, SessionError> {
        let game_id = parse_game_id(&request.game_id)?;
        let mut context = TurnContext::new(game_id, TurnInput::Finalize);
        self.run(Transition::Finalize, &mut context)?;

        match context.outcome {
            Some(Outcome::Profile(profile)) => Ok(ProfileResponse { game_id, profile }),
            _ => Err(SessionError::Generation("finalize produced no profile".to_string())),
        }
    }

    /// Read-only view of a game's stored turns.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] for a zero `limit` and
    /// [`SessionError::NotFound`] when the game has no records.
    pub fn history(
        &self,
        game_id: &str,
        limit: Option<usize>,
    ) -> Result<HistoryResponse, SessionError> {
        let game_id = parse_game_id(game_id)?;
        if limit == Some(0) {
            return Err(SessionError::Validation("limit MUST be at least 1".to_string()));
        }
        let turns = self.history.turns(game_id, limit).map_err(store_error)?;
        if turns.is_empty() {
            return Err(SessionError::NotFound { game_id });
        }
        Ok(HistoryResponse { game_id, turns })
    }

    fn run(&self, transition: Transition, context: &mut TurnContext) -> Result<(), SessionError> {
        let span = tracing::info_span!(
            "pipeline",
            transition = transition.as_str(),
            game_id = %context.game_id
        );
        let _entered = span.enter();
        let started = Instant::now();

        for &step in transition.steps() {
            let role = self.roles.role_for(transition, step);
            let operation = step.operation(transition);
            if !role.permits(operation) {
                return Err(SessionError::Validation(format!(
                    "role {} is not permitted to {}",
                    role.name,
                    operation.as_str()
                )));
            }

            self.check_deadline()?;
            let step_started = Instant::now();
            let outcome = match step {
                PipelineStep::RetrieveHistory => self.retrieve_history(transition, context),
                PipelineStep::Generate => self.generate(transition, role, context),
                PipelineStep::Persist => self.persist(context),
            }
            .map_err(|err| if self.deadline_passed() { request_timeout() } else { err });
            if let Err(err) = &outcome {
                tracing::warn!(
                    step = step.as_str(),
                    role = %role.name,
                    kind = err.kind().as_str(),
                    error = %err,
                    "pipeline step failed"
                );
            }
            outcome?;
            tracing::debug!(
                step = step.as_str(),
                role = %role.name,
                elapsed_ms = step_started.elapsed().as_millis(),
                "pipeline step completed"
            );
        }

        tracing::info!(elapsed_ms = started.elapsed().as_millis(), "pipeline completed");
        Ok(())
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn check_deadline(&self) -> Result<(), SessionError> {
        if self.deadline_passed() {
            return Err(request_timeout());
        }
        Ok(())
    }

    fn store<'a>(
        &self,
        slot: &'a mut Option<SqliteStore>,
    ) -> Result<&'a mut SqliteStore, SessionError> {
        if slot.is_none() {
            *slot = Some(self.history.open_migrated_store().map_err(store_error)?);
        }
        slot.as_mut().ok_or_else(|| SessionError::Storage("store handle unavailable".to_string()))
    }

    fn retrieve_history(
        &self,
        transition: Transition,
        context: &mut TurnContext,
    ) -> Result<(), SessionError> {
        let game_id = context.game_id;
        let store = self.store(&mut context.store)?;
        let records = match transition {
            Transition::Finalize => store.fetch_all(game_id),
            Transition::Start | Transition::Continue => store.fetch_recent(game_id, HISTORY_WINDOW),
        }
        .map_err(store_error)?;

        if records.is_empty() {
            return Err(SessionError::NotFound { game_id });
        }

        if transition == Transition::Finalize {
            let found = u64::try_from(records.len()).unwrap_or(u64::MAX);
            if found < self.config.min_finalize_turns {
                return Err(SessionError::InsufficientHistory {
                    game_id,
                    found,
                    required: self.config.min_finalize_turns,
                });
            }
        }

        context.turns = decode_history(&records).map_err(|err| {
            SessionError::Storage(format!("stored history for game {game_id} is unreadable: {err}"))
        })?;
        context.records = records;
        Ok(())
    }

    fn generate(
        &self,
        transition: Transition,
        role: &RoleProfile,
        context: &mut TurnContext,
    ) -> Result<(), SessionError> {
        let request = generation_request(transition, role, context);
        let raw = self.provider.complete(&request).map_err(provider_error)?;
        tracing::info!(role = %role.name, output_len = raw.len(), "generation returned");

        let outcome = match transition {
            Transition::Start => Outcome::Scene(
                parse_scene(&raw, SceneStage::Opening).map_err(|err| parse_error(err, &raw))?,
            ),
            Transition::Continue => Outcome::Scene(
                parse_scene(&raw, SceneStage::Continuation)
                    .map_err(|err| parse_error(err, &raw))?,
            ),
            Transition::Finalize => {
                Outcome::Profile(parse_profile(&raw).map_err(|err| parse_error(err, &raw))?)
            }
        };
        context.outcome = Some(outcome);
        Ok(())
    }

    fn persist(&self, context: &mut TurnContext) -> Result<(), SessionError> {
        let turn = match (&context.input, &context.outcome) {
            (TurnInput::Start { player_name, archetype }, Some(Outcome::Scene(scene))) => {
                TurnData::Opening {
                    player_name: player_name.clone(),
                    archetype: archetype.clone(),
                    scene: scene.clone(),
                }
            }
            (TurnInput::Continue { chosen_action }, Some(Outcome::Scene(scene))) => {
                TurnData::Continuation { chosen_action: chosen_action.clone(), scene: scene.clone() }
            }
            _ => {
                return Err(SessionError::Storage(
                    "persist reached without a generated scene".to_string(),
                ))
            }
        };
        let payload = turn.to_value().map_err(|err| SessionError::Storage(err.to_string()))?;
        let expected_last = context.records.last().map(|record| record.sequence);
        let game_id = context.game_id;

        let store = self.store(&mut context.store)?;
        self.check_deadline()?;
        let record = store
            .append_turn_after(game_id, expected_last, &payload)
            .map_err(store_error)?;
        tracing::info!(sequence = record.sequence, "turn persisted");
        Ok(())
    }
}

enum TurnInput {
    Start { player_name: String, archetype: String },
    Continue { chosen_action: String },
    Finalize,
}

enum Outcome {
    Scene(Scene),
    Profile(PersonalityProfile),
}

/// State threaded through one transition's steps.
struct TurnContext {
    game_id: GameId,
    input: TurnInput,
    store: Option<SqliteStore>,
    records: Vec<TurnRecord>,
    turns: Vec<TurnData>,
    outcome: Option<Outcome>,
}

impl TurnContext {
    fn new(game_id: GameId, input: TurnInput) -> Self {
        Self { game_id, input, store: None, records: Vec::new(), turns: Vec::new(), outcome: None }
    }

    fn into_scene_response(self) -> Result<SceneResponse, SessionError> {
        match self.outcome {
            Some(Outcome::Scene(scene)) => Ok(SceneResponse { game_id: self.game_id, scene }),
            _ => Err(SessionError::Generation("pipeline produced no scene".to_string())),
        }
    }
}

fn generation_request(
    transition: Transition,
    role: &RoleProfile,
    context: &TurnContext,
) -> GenerationRequest {
    let (prompt, payload) = match &context.input {
        TurnInput::Start { player_name, archetype } => (
            opening_prompt(player_name, archetype),
            serde_json::json!({ "player_name": player_name, "archetype": archetype }),
        ),
        TurnInput::Continue { chosen_action } => (
            continuation_prompt(chosen_action),
            serde_json::json!({
                "history": history_context(&context.records),
                "chosen_action": chosen_action,
            }),
        ),
        TurnInput::Finalize => (
            profile_prompt(),
            serde_json::json!({
                "turns": history_context(&context.records),
                "facet_tally": tally_facets(&context.turns),
            }),
        ),
    };
    tracing::debug!(transition = transition.as_str(), role = %role.name, "built generation request");

    GenerationRequest {
        role: role.name.clone(),
        instructions: role.instructions.clone(),
        prompt,
        context: payload,
    }
}

fn history_context(records: &[TurnRecord]) -> Vec<serde_json::Value> {
    records
        .iter()
        .map(|record| serde_json::json!({ "sequence": record.sequence, "turn": record.turn_data }))
        .collect()
}

const SCENE_SCHEMA_HINT: &str = r#"Reply with exactly one JSON object of this shape:
{"scene_description": "...", "options": [{"action": "...", "facet": "..."}], "symbolic_word": "..."}"#;

fn opening_prompt(player_name: &str, archetype: &str) -> String {
    format!(
        "Write the first scene of an interactive story for the player '{player_name}', who \
         chose the initial archetype '{archetype}'. The scene is a short, calm, symbolic \
         situation inspired by the archetype. Offer exactly {OPTIONS_PER_SCENE} options, each \
         tagged with the psychological facet it reveals, and finish with an English \
         'symbolic_word' capturing the scene's essence.\n{SCENE_SCHEMA_HINT}"
    )
}

fn continuation_prompt(chosen_action: &str) -> String {
    format!(
        "Using the story so far and the player's latest choice ('{chosen_action}'), continue the \
         story briefly and coherently. Offer exactly {OPTIONS_PER_SCENE} new options, inferring \
         a psychological facet for each. The 'symbolic_word' MUST be a two-part English \
         compound joined by a hyphen, for example 'deepening-shadow'.\n{SCENE_SCHEMA_HINT}"
    )
}

fn profile_prompt() -> String {
    "Analyse the complete history of scenes and choices, including the facet behind each \
     choice and the facet tally. Determine the four-letter personality type (for example INFJ \
     or ESTP) and write the final report. Reply with exactly one JSON object with the keys \
     'personality_type', 'title', 'description', 'strengths' (list of {\"name\", \
     \"description\", \"narrative_example\"}), 'growth_areas' (list of {\"name\", \
     \"description\", \"recommendation\"}) and 'closing_message'."
        .to_string()
}

fn parse_game_id(raw: &str) -> Result<GameId, SessionError> {
    raw.parse::<GameId>().map_err(validation_error)
}

fn validation_error(err: GameError) -> SessionError {
    match err {
        GameError::Validation(message) => SessionError::Validation(message),
        other => SessionError::Validation(other.to_string()),
    }
}

fn parse_error(err: GameError, raw: &str) -> SessionError {
    SessionError::GenerationParse { message: err.to_string(), raw_output: raw.to_string() }
}

fn provider_error(err: ProviderError) -> SessionError {
    match err {
        ProviderError::Timeout { .. } => SessionError::Timeout { stage: TimeoutStage::Generation },
        other => SessionError::Generation(other.to_string()),
    }
}

fn request_timeout() -> SessionError {
    SessionError::Timeout { stage: TimeoutStage::Request }
}

fn store_error(err: anyhow::Error) -> SessionError {
    if let Some(conflict) = err.downcast_ref::<AppendConflict>() {
        return SessionError::Conflict {
            game_id: conflict.game_id,
            expected: conflict.expected,
            actual: conflict.actual,
        };
    }
    if is_busy_error(&err) {
        return SessionError::Timeout { stage: TimeoutStage::Storage };
    }
    SessionError::Storage(format!("{err:#}"))
}
