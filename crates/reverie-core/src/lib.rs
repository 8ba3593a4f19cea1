use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Number of (action, facet) options every generated scene must carry.
pub const OPTIONS_PER_SCENE: usize = 4;

/// Most recent turns handed to the narrator when continuing a game.
pub const HISTORY_WINDOW: usize = 10;

pub const PLAYER_NAME_MIN_CHARS: usize = 3;
pub const PLAYER_NAME_MAX_CHARS: usize = 10;
pub const ARCHETYPE_MAX_CHARS: usize = 64;
pub const CHOSEN_ACTION_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GameError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("generation output is not a valid JSON object: {0}")]
    MalformedOutput(String),
    #[error("generation output violates schema: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GameId(pub Ulid);

impl GameId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for GameId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for GameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GameId {
    type Err = GameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|_| GameError::Validation(format!("game_id is not a valid ULID: {value}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which point in a playthrough a scene was generated for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SceneStage {
    Opening,
    Continuation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChoiceOption {
    pub action: String,
    pub facet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Scene {
    pub scene_description: String,
    pub options: Vec<ChoiceOption>,
    pub symbolic_word: String,
}

impl Scene {
    /// Check a generated scene against the per-stage schema.
    ///
    /// # Errors
    /// Returns [`GameError::Schema`] when the description is empty, the option count is not
    /// [`OPTIONS_PER_SCENE`], an option has an empty action or facet, or the symbolic word
    /// does not fit the stage (any non-empty word for openings, `word-word` afterwards).
    pub fn validate(&self, stage: SceneStage) -> Result<(), GameError> {
        if self.scene_description.trim().is_empty() {
            return Err(GameError::Schema("scene_description MUST be non-empty".to_string()));
        }

        if self.options.len() != OPTIONS_PER_SCENE {
            return Err(GameError::Schema(format!(
                "scene MUST offer exactly {OPTIONS_PER_SCENE} options, got {}",
                self.options.len()
            )));
        }

        for (index, option) in self.options.iter().enumerate() {
            if option.action.trim().is_empty() {
                return Err(GameError::Schema(format!("options[{index}].action MUST be non-empty")));
            }
            if option.facet.trim().is_empty() {
                return Err(GameError::Schema(format!("options[{index}].facet MUST be non-empty")));
            }
        }

        match stage {
            SceneStage::Opening if self.symbolic_word.trim().is_empty() => {
                Err(GameError::Schema("symbolic_word MUST be non-empty".to_string()))
            }
            SceneStage::Continuation if !is_two_part_tag(&self.symbolic_word) => {
                Err(GameError::Schema(format!(
                    "symbolic_word MUST be two words joined by a hyphen, got {:?}",
                    self.symbolic_word
                )))
            }
            _ => Ok(()),
        }
    }

    /// Find the option whose action matches the player's chosen text.
    #[must_use]
    pub fn option_for_action(&self, chosen_action: &str) -> Option<&ChoiceOption> {
        let wanted = normalize_text(chosen_action);
        self.options.iter().find(|option| normalize_text(&option.action) == wanted)
    }
}

/// One persisted turn, as written to `turn_data`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnData {
    Opening { player_name: String, archetype: String, scene: Scene },
    Continuation { chosen_action: String, scene: Scene },
}

impl TurnData {
    #[must_use]
    pub fn scene(&self) -> &Scene {
        match self {
            Self::Opening { scene, .. } | Self::Continuation { scene, .. } => scene,
        }
    }

    #[must_use]
    pub fn stage(&self) -> SceneStage {
        match self {
            Self::Opening { .. } => SceneStage::Opening,
            Self::Continuation { .. } => SceneStage::Continuation,
        }
    }

    /// Serialize into the opaque JSON object the history store persists.
    ///
    /// # Errors
    /// Returns [`GameError::Validation`] if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value, GameError> {
        serde_json::to_value(self)
            .map_err(|err| GameError::Validation(format!("failed to serialize turn data: {err}")))
    }

    /// Decode a stored `turn_data` object.
    ///
    /// # Errors
    /// Returns [`GameError::Validation`] when the object is not a recognized turn shape.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, GameError> {
        Self::deserialize(value)
            .map_err(|err| GameError::Validation(format!("stored turn_data is not a turn: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRecord {
    pub record_id: RecordId,
    pub game_id: GameId,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub turn_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameSummary {
    pub game_id: GameId,
    pub turn_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_turn_at: OffsetDateTime,
}

/// Decode an ordered window of stored records into typed turns.
///
/// The window may start after sequence 1, but it must be strictly ascending, belong to a
/// single game, and hold an opening turn exactly at sequence 1.
///
/// # Errors
/// Returns [`GameError::Validation`] when ordering, ownership, or turn kinds are violated.
pub fn decode_history(records: &[TurnRecord]) -> Result<Vec<TurnData>, GameError> {
    let mut turns = Vec::with_capacity(records.len());
    let mut previous: Option<&TurnRecord> = None;

    for record in records {
        if let Some(previous) = previous {
            if record.game_id != previous.game_id {
                return Err(GameError::Validation(format!(
                    "history mixes games {} and {}",
                    previous.game_id, record.game_id
                )));
            }
            if record.sequence <= previous.sequence {
                return Err(GameError::Validation(format!(
                    "history is not ordered: sequence {} follows {}",
                    record.sequence, previous.sequence
                )));
            }
        }

        let turn = TurnData::from_value(&record.turn_data)?;
        let expected = if record.sequence == 1 {
            SceneStage::Opening
        } else {
            SceneStage::Continuation
        };
        if turn.stage() != expected {
            return Err(GameError::Validation(format!(
                "turn at sequence {} has kind {:?}, expected {expected:?}",
                record.sequence,
                turn.stage()
            )));
        }

        turns.push(turn);
        previous = Some(record);
    }

    Ok(turns)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Strength {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub narrative_example: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GrowthArea {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersonalityProfile {
    pub personality_type: String,
    pub title: String,
    pub description: String,
    pub strengths: Vec<Strength>,
    pub growth_areas: Vec<GrowthArea>,
    pub closing_message: String,
}

impl PersonalityProfile {
    /// Check the profile fields the client renders.
    ///
    /// # Errors
    /// Returns [`GameError::Schema`] when the type is not one letter from each of E/I, N/S,
    /// T/F, J/P, or a required text field is empty.
    pub fn validate(&self) -> Result<(), GameError> {
        if !is_personality_type(&self.personality_type) {
            return Err(GameError::Schema(format!(
                "personality_type MUST be a four-letter type such as INFJ, got {:?}",
                self.personality_type
            )));
        }

        for (field, value) in [
            ("title", &self.title),
            ("description", &self.description),
            ("closing_message", &self.closing_message),
        ] {
            if value.trim().is_empty() {
                return Err(GameError::Schema(format!("{field} MUST be non-empty")));
            }
        }

        if self.strengths.iter().any(|strength| strength.name.trim().is_empty()) {
            return Err(GameError::Schema("strengths[].name MUST be non-empty".to_string()));
        }
        if self.growth_areas.iter().any(|area| area.name.trim().is_empty()) {
            return Err(GameError::Schema("growth_areas[].name MUST be non-empty".to_string()));
        }

        Ok(())
    }
}

/// Facet counts observed across a playthrough.
///
/// `offered` counts every option shown to the player; `chosen` counts the facet of the
/// option whose action matches the next turn's chosen action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FacetTally {
    pub offered: BTreeMap<String, u32>,
    pub chosen: BTreeMap<String, u32>,
    pub unmatched_choices: u32,
}

#[must_use]
pub fn tally_facets(turns: &[TurnData]) -> FacetTally {
    let mut tally = FacetTally::default();
    let mut previous_scene: Option<&Scene> = None;

    for turn in turns {
        if let TurnData::Continuation { chosen_action, .. } = turn {
            match previous_scene.and_then(|scene| scene.option_for_action(chosen_action)) {
                Some(option) => {
                    *tally.chosen.entry(normalize_text(&option.facet)).or_insert(0) += 1;
                }
                None => tally.unmatched_choices += 1,
            }
        }

        for option in &turn.scene().options {
            *tally.offered.entry(normalize_text(&option.facet)).or_insert(0) += 1;
        }
        previous_scene = Some(turn.scene());
    }

    tally
}

/// Validate a player name: 3-10 ASCII letters or digits, words separated by single spaces.
///
/// # Errors
/// Returns [`GameError::Validation`] describing the first violated rule.
pub fn validate_player_name(name: &str) -> Result<(), GameError> {
    let length = name.chars().count();
    if !(PLAYER_NAME_MIN_CHARS..=PLAYER_NAME_MAX_CHARS).contains(&length) {
        return Err(GameError::Validation(format!(
            "name MUST be {PLAYER_NAME_MIN_CHARS}-{PLAYER_NAME_MAX_CHARS} characters, got {length}"
        )));
    }

    let well_formed = name
        .split(' ')
        .all(|word| !word.is_empty() && word.chars().all(|ch| ch.is_ascii_alphanumeric()));
    if !well_formed {
        return Err(GameError::Validation(
            "name MUST contain only letters and digits, with single spaces between words"
                .to_string(),
        ));
    }

    Ok(())
}

/// # Errors
/// Returns [`GameError::Validation`] when the archetype is blank or too long.
pub fn validate_archetype(archetype: &str) -> Result<(), GameError> {
    validate_free_text("initial_archetype", archetype, ARCHETYPE_MAX_CHARS)
}

/// # Errors
/// Returns [`GameError::Validation`] when the chosen action is blank or too long.
pub fn validate_chosen_action(chosen_action: &str) -> Result<(), GameError> {
    validate_free_text("chosen_action", chosen_action, CHOSEN_ACTION_MAX_CHARS)
}

fn validate_free_text(field: &str, value: &str, max_chars: usize) -> Result<(), GameError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GameError::Validation(format!("{field} MUST be non-empty")));
    }
    if trimmed.chars().count() > max_chars {
        return Err(GameError::Validation(format!(
            "{field} MUST be at most {max_chars} characters"
        )));
    }
    Ok(())
}

/// Parse model text into a scene and validate it for `stage`.
///
/// # Errors
/// Returns [`GameError::MalformedOutput`] or [`GameError::Schema`].
pub fn parse_scene(raw: &str, stage: SceneStage) -> Result<Scene, GameError> {
    let scene: Scene = parse_generation_output(raw)?;
    scene.validate(stage)?;
    Ok(scene)
}

/// Parse model text into a personality profile, normalizing the type to upper case.
///
/// # Errors
/// Returns [`GameError::MalformedOutput`] or [`GameError::Schema`].
pub fn parse_profile(raw: &str) -> Result<PersonalityProfile, GameError> {
    let mut profile: PersonalityProfile = parse_generation_output(raw)?;
    profile.personality_type = profile.personality_type.trim().to_ascii_uppercase();
    profile.validate()?;
    Ok(profile)
}

/// Parse free model text expected to hold a single JSON object.
///
/// Surrounding prose and Markdown code fences are tolerated; the object itself must be
/// strict JSON.
///
/// # Errors
/// Returns [`GameError::MalformedOutput`] when no JSON object can be read and
/// [`GameError::Schema`] when the object does not match `T`.
pub fn parse_generation_output<T: DeserializeOwned>(raw: &str) -> Result<T, GameError> {
    let candidate = extract_json_object(raw)
        .ok_or_else(|| GameError::MalformedOutput("no JSON object found".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|err| GameError::MalformedOutput(err.to_string()))?;
    if !value.is_object() {
        return Err(GameError::MalformedOutput("top-level value is not an object".to_string()));
    }
    serde_json::from_value(value).map_err(|err| GameError::Schema(err.to_string()))
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let body = strip_code_fence(trimmed).unwrap_or(trimmed);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&body[start..=end])
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("```")?.strip_suffix("```")?;
    // Drop the info string (`json`) on the opening fence line.
    let body = match inner.find('\n') {
        Some(index) => &inner[index + 1..],
        None => inner,
    };
    Some(body.trim())
}

fn is_two_part_tag(value: &str) -> bool {
    let mut parts = value.trim().split('-');
    let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    [first, second].iter().all(|part| !part.is_empty() && !part.chars().any(char::is_whitespace))
}

fn is_personality_type(value: &str) -> bool {
    const AXES: [[char; 2]; 4] = [['E', 'I'], ['N', 'S'], ['T', 'F'], ['J', 'P']];
    let letters = value.chars().collect::<Vec<_>>();
    letters.len() == AXES.len()
        && letters.iter().zip(AXES.iter()).all(|(letter, axis)| axis.contains(letter))
}

fn normalize_text(value: &str) -> String {
    value.trim().to_lowercase()
}
