use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Built-in supervisor pools seeded at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorType {
    Intelligence,
    Multimodal,
    System,
}

impl SupervisorType {
    pub const ALL: [Self; 3] = [Self::Intelligence, Self::Multimodal, Self::System];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intelligence => "intelligence",
            Self::Multimodal => "multimodal",
            Self::System => "system",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Intelligence => "Intelligence Supervisor",
            Self::Multimodal => "Multimodal Supervisor",
            Self::System => "System Supervisor",
        }
    }

    /// Capacity of the seeded pool.
    pub fn default_capacity(self) -> u32 {
        match self {
            Self::Intelligence => 10,
            Self::Multimodal => 5,
            Self::System => 15,
        }
    }

    /// Task types served by the seeded pool.
    pub fn default_capabilities(self) -> Vec<String> {
        KnownTaskType::ALL
            .iter()
            .filter(|task| task.supervisor_type() == self)
            .map(|task| task.as_str().to_string())
            .collect()
    }
}

impl fmt::Display for SupervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupervisorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown supervisor type `{s}`"))
    }
}

/// Task types with a compiled-in supervisor assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownTaskType {
    ResearchWebSearch,
    ResearchAcademicSearch,
    WriterContentCreate,
    WriterContentEdit,
    AnalystDataAnalyze,
    CoderCodeGenerate,
    CoderCodeReview,
    ArtistImageGenerate,
    VisionImageAnalyze,
    AudioSpeechTranscribe,
    AudioSpeechSynthesize,
    VideoContentAnalyze,
    SystemHealthCheck,
    SecurityAuditRun,
    SchedulerTaskSchedule,
    MemoryKnowledgeQuery,
}

impl KnownTaskType {
    pub const ALL: [Self; 16] = [
        Self::ResearchWebSearch,
        Self::ResearchAcademicSearch,
        Self::WriterContentCreate,
        Self::WriterContentEdit,
        Self::AnalystDataAnalyze,
        Self::CoderCodeGenerate,
        Self::CoderCodeReview,
        Self::ArtistImageGenerate,
        Self::VisionImageAnalyze,
        Self::AudioSpeechTranscribe,
        Self::AudioSpeechSynthesize,
        Self::VideoContentAnalyze,
        Self::SystemHealthCheck,
        Self::SecurityAuditRun,
        Self::SchedulerTaskSchedule,
        Self::MemoryKnowledgeQuery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResearchWebSearch => "research.web.search",
            Self::ResearchAcademicSearch => "research.academic.search",
            Self::WriterContentCreate => "writer.content.create",
            Self::WriterContentEdit => "writer.content.edit",
            Self::AnalystDataAnalyze => "analyst.data.analyze",
            Self::CoderCodeGenerate => "coder.code.generate",
            Self::CoderCodeReview => "coder.code.review",
            Self::ArtistImageGenerate => "artist.image.generate",
            Self::VisionImageAnalyze => "vision.image.analyze",
            Self::AudioSpeechTranscribe => "audio.speech.transcribe",
            Self::AudioSpeechSynthesize => "audio.speech.synthesize",
            Self::VideoContentAnalyze => "video.content.analyze",
            Self::SystemHealthCheck => "system.health.check",
            Self::SecurityAuditRun => "security.audit.run",
            Self::SchedulerTaskSchedule => "scheduler.task.schedule",
            Self::MemoryKnowledgeQuery => "memory.knowledge.query",
        }
    }

    pub fn parse(task_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|known| known.as_str() == task_type)
    }

    pub fn supervisor_type(self) -> SupervisorType {
        match self {
            Self::ResearchWebSearch
            | Self::ResearchAcademicSearch
            | Self::WriterContentCreate
            | Self::WriterContentEdit
            | Self::AnalystDataAnalyze
            | Self::CoderCodeGenerate
            | Self::CoderCodeReview => SupervisorType::Intelligence,
            Self::ArtistImageGenerate
            | Self::VisionImageAnalyze
            | Self::AudioSpeechTranscribe
            | Self::AudioSpeechSynthesize
            | Self::VideoContentAnalyze => SupervisorType::Multimodal,
            Self::SystemHealthCheck
            | Self::SecurityAuditRun
            | Self::SchedulerTaskSchedule
            | Self::MemoryKnowledgeQuery => SupervisorType::System,
        }
    }
}

/// Task-type to supervisor-type mapping.
///
/// Runtime overrides win over the compiled-in table, so deployments can
/// move a known task type to a custom pool or map task types that the
/// binary has never heard of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    overrides: HashMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_overrides<I, K, V>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            overrides: overrides
                .into_iter()
                .map(|(task, target)| (task.into(), target.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, task_type: impl Into<String>, supervisor_type: impl Into<String>) {
        self.overrides.insert(task_type.into(), supervisor_type.into());
    }

    /// Supervisor type for `task_type`, or `None` when neither table knows it.
    pub fn resolve(&self, task_type: &str) -> Option<String> {
        if let Some(target) = self.overrides.get(task_type) {
            return Some(target.clone());
        }
        KnownTaskType::parse(task_type).map(|known| known.supervisor_type().as_str().to_string())
    }

    /// Every mapping the table knows, overrides applied, sorted by task type.
    pub fn effective(&self) -> BTreeMap<String, String> {
        let mut routes: BTreeMap<String, String> = KnownTaskType::ALL
            .into_iter()
            .map(|known| {
                (
                    known.as_str().to_string(),
                    known.supervisor_type().as_str().to_string(),
                )
            })
            .collect();
        for (task, target) in &self.overrides {
            routes.insert(task.clone(), target.clone());
        }
        routes
    }
}
