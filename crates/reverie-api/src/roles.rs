use serde::{Deserialize, Serialize};

/// Capabilities a role may be granted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ReadHistory,
    GenerateScene,
    GenerateProfile,
    AppendTurn,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadHistory => "read_history",
            Self::GenerateScene => "generate_scene",
            Self::GenerateProfile => "generate_profile",
            Self::AppendTurn => "append_turn",
        }
    }
}

/// A named actor in the pipeline: its standing brief plus what it is allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoleProfile {
    pub name: String,
    pub instructions: String,
    pub permitted_operations: Vec<Operation>,
}

impl RoleProfile {
    #[must_use]
    pub fn permits(&self, operation: Operation) -> bool {
        self.permitted_operations.contains(&operation)
    }

    #[must_use]
    pub fn narrator() -> Self {
        Self {
            name: "narrator".to_string(),
            instructions: "You are a calm, kind storyteller guiding an interactive projective \
                story. Stories exist to reveal, not to frighten: every scene is 2-4 short \
                sentences and ends in a symbolic dilemma with clear, concise options. You \
                answer with a single JSON object and nothing else."
                .to_string(),
            permitted_operations: vec![Operation::GenerateScene],
        }
    }

    #[must_use]
    pub fn analyst() -> Self {
        Self {
            name: "analyst".to_string(),
            instructions: "You are a psychologist specialised in narrative analysis and \
                personality typologies. You read a full history of story choices, find \
                patterns of behaviour and thought, and infer the most likely four-letter type \
                across the E/I, N/S, T/F and J/P dichotomies. Use the framework as a guide, \
                not a label, and keep the report positive and constructive. You answer with a \
                single JSON object and nothing else."
                .to_string(),
            permitted_operations: vec![Operation::ReadHistory, Operation::GenerateProfile],
        }
    }

    #[must_use]
    pub fn archivist() -> Self {
        Self {
            name: "archivist".to_string(),
            instructions: "You keep the game's memory. Every turn is stored complete and under \
                the correct game_id, and history is read back in the order it was written."
                .to_string(),
            permitted_operations: vec![Operation::ReadHistory, Operation::AppendTurn],
        }
    }
}

/// The three roles a session pipeline dispatches to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoleRoster {
    pub narrator: RoleProfile,
    pub analyst: RoleProfile,
    pub archivist: RoleProfile,
}

impl Default for RoleRoster {
    fn default() -> Self {
        Self {
            narrator: RoleProfile::narrator(),
            analyst: RoleProfile::analyst(),
            archivist: RoleProfile::archivist(),
        }
    }
}

impl RoleRoster {
    /// Check that every role can perform the steps it will be assigned.
    ///
    /// # Errors
    /// Returns a message naming the first role missing a required operation.
    pub fn validate(&self) -> Result<(), String> {
        for transition in [Transition::Start, Transition::Continue, Transition::Finalize] {
            for step in transition.steps() {
                let role = self.role_for(transition, *step);
                let operation = step.operation(transition);
                if !role.permits(operation) {
                    return Err(format!(
                        "role {} MUST permit {} for {} step of {}",
                        role.name,
                        operation.as_str(),
                        step.as_str(),
                        transition.as_str()
                    ));
                }
                if role.instructions.trim().is_empty() {
                    return Err(format!("role {} MUST have non-empty instructions", role.name));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn role_for(&self, transition: Transition, step: PipelineStep) -> &RoleProfile {
        match (transition, step) {
            (_, PipelineStep::RetrieveHistory | PipelineStep::Persist) => &self.archivist,
            (Transition::Finalize, PipelineStep::Generate) => &self.analyst,
            (Transition::Start | Transition::Continue, PipelineStep::Generate) => &self.narrator,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    RetrieveHistory,
    Generate,
    Persist,
}

impl PipelineStep {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetrieveHistory => "retrieve_history",
            Self::Generate => "generate",
            Self::Persist => "persist",
        }
    }

    #[must_use]
    pub fn operation(self, transition: Transition) -> Operation {
        match (self, transition) {
            (Self::RetrieveHistory, _) => Operation::ReadHistory,
            (Self::Generate, Transition::Finalize) => Operation::GenerateProfile,
            (Self::Generate, Transition::Start | Transition::Continue) => Operation::GenerateScene,
            (Self::Persist, _) => Operation::AppendTurn,
        }
    }
}

/// The game's state transitions. Each runs its steps once, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Continue,
    Finalize,
}

impl Transition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Continue => "continue",
            Self::Finalize => "finalize",
        }
    }

    #[must_use]
    pub fn steps(self) -> &'static [PipelineStep] {
        match self {
            Self::Start => &[PipelineStep::Generate, PipelineStep::Persist],
            Self::Continue => {
                &[PipelineStep::RetrieveHistory, PipelineStep::Generate, PipelineStep::Persist]
            }
            Self::Finalize => &[PipelineStep::RetrieveHistory, PipelineStep::Generate],
        }
    }
}
