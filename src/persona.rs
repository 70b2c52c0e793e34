//! Agent personas and their settings.
//!
//! Each persona is a fixed behavioural profile: a system instruction plus a
//! settings payload of its own shape. Dispatch is by exhaustive `match` on
//! [`AgentPersona`]; there is no trait hierarchy.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AgentError, Result};

/// Subjects offered by the homework persona. The first entry is the default.
pub const HOMEWORK_SUBJECTS: &[&str] = &[
    "Math",
    "Science",
    "History",
    "English",
    "Geography",
    "Physics",
    "Chemistry",
    "Biology",
];

/// Grade levels offered by the homework persona. The first entry is the default.
pub const HOMEWORK_GRADES: &[&str] = &[
    "Grade 1", "Grade 2", "Grade 3", "Grade 4", "Grade 5", "Grade 6", "Grade 7", "Grade 8",
    "Grade 9", "Grade 10", "Grade 11", "Grade 12",
];

/// Languages offered by the coder persona. The first entry is the default.
pub const CODER_LANGUAGES: &[&str] = &[
    "HTML/CSS/JS",
    "Python",
    "TypeScript",
    "React",
    "Rust",
    "Go",
    "Java",
];

/// Monthly income brackets offered during money onboarding.
pub const MONEY_INCOME_BRACKETS: &[&str] = &[
    "<$1,000",
    "$1,000 - $2,500",
    "$2,500 - $5,000",
    "$5,000 - $10,000",
    "$10,000+",
];

/// Financial goals offered during money onboarding.
pub const MONEY_GOALS: &[&str] = &[
    "Build an emergency fund",
    "Aggressive wealth growth",
    "Generate passive income",
    "Pay off debt fast",
];

/// Homework persona settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeworkSettings {
    pub subject: String,
    pub grade: String,
}

impl Default for HomeworkSettings {
    fn default() -> Self {
        Self {
            subject: HOMEWORK_SUBJECTS[0].to_owned(),
            grade: HOMEWORK_GRADES[0].to_owned(),
        }
    }
}

/// Coder persona settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderSettings {
    pub language: String,
}

impl Default for CoderSettings {
    fn default() -> Self {
        Self {
            language: CODER_LANGUAGES[0].to_owned(),
        }
    }
}

/// Risk tolerance collected during money onboarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("Low"),
            Self::Medium => f.write_str("Medium"),
            Self::High => f.write_str("High"),
        }
    }
}

/// Money persona settings, filled in by onboarding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneySettings {
    pub income: Option<String>,
    pub risk: Option<RiskLevel>,
    pub goal: Option<String>,
}

/// Answers from the money persona's onboarding form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyOnboarding {
    pub income: String,
    pub risk: RiskLevel,
    pub goal: String,
}

impl Default for MoneyOnboarding {
    fn default() -> Self {
        Self {
            income: MONEY_INCOME_BRACKETS[3].to_owned(),
            risk: RiskLevel::Medium,
            goal: MONEY_GOALS[1].to_owned(),
        }
    }
}

impl MoneyOnboarding {
    /// The request prompt asking for the initial assessment.
    pub fn assessment_prompt(&self) -> String {
        format!(
            "My financial situation is as follows: monthly income of {}, a {} risk tolerance, \
             and my primary goal is {}. Based on this, provide your initial assessment and \
             suggest the first strategic step I should consider.",
            self.income, self.risk, self.goal
        )
    }
}

/// Text shown on an empty conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeInfo {
    pub icon: &'static str,
    pub title: &'static str,
    pub description: String,
}

/// A persona together with its settings payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "persona", rename_all = "snake_case")]
pub enum AgentPersona {
    Homework(HomeworkSettings),
    Coder(CoderSettings),
    DocumentAnalyst,
    Money(MoneySettings),
    SearchAssistant,
    TaskAgent,
    ImageGeneration,
    ImageEditor,
}

impl AgentPersona {
    /// Every persona identifier, in sidebar order.
    pub const IDS: &'static [&'static str] = &[
        "homework",
        "coder",
        "document_analyst",
        "money",
        "search_assistant",
        "task_agent",
        "image_generation",
        "image_editor",
    ];

    /// Build a persona with default settings from its identifier.
    pub fn from_id(id: &str) -> Option<Self> {
        let persona = match id.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "homework" => Self::Homework(HomeworkSettings::default()),
            "coder" => Self::Coder(CoderSettings::default()),
            "document_analyst" => Self::DocumentAnalyst,
            "money" => Self::Money(MoneySettings::default()),
            "search_assistant" => Self::SearchAssistant,
            "task_agent" => Self::TaskAgent,
            "image_generation" => Self::ImageGeneration,
            "image_editor" => Self::ImageEditor,
            _ => return None,
        };
        Some(persona)
    }

    /// Stable persona identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Homework(_) => "homework",
            Self::Coder(_) => "coder",
            Self::DocumentAnalyst => "document_analyst",
            Self::Money(_) => "money",
            Self::SearchAssistant => "search_assistant",
            Self::TaskAgent => "task_agent",
            Self::ImageGeneration => "image_generation",
            Self::ImageEditor => "image_editor",
        }
    }

    /// Header title for a conversation using this persona.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Homework(_) => "Homework AI",
            Self::Coder(_) => "Coder Agent",
            Self::DocumentAnalyst => "Document Analyst",
            Self::Money(_) => "Alpha Investor",
            Self::SearchAssistant => "Search Assistant",
            Self::TaskAgent => "Task Agent",
            Self::ImageGeneration | Self::ImageEditor => "IntelliAgent",
        }
    }

    /// Title given to a brand-new conversation before one is derived.
    pub fn new_chat_title(&self) -> &'static str {
        match self {
            Self::Homework(_) => "New Homework Chat",
            Self::Coder(_) => "New Coder Chat",
            Self::Money(_) => "New Alpha Investor Chat",
            Self::ImageGeneration => "New Image Generation",
            Self::ImageEditor => "New Image Edit",
            Self::TaskAgent => "New Task",
            Self::DocumentAnalyst | Self::SearchAssistant => "New Chat",
        }
    }

    pub fn welcome(&self) -> WelcomeInfo {
        let (icon, title, description) = match self {
            Self::Homework(s) => (
                "🎓",
                "Homework AI",
                format!("Ready to help with {} for {}.", s.subject, s.grade),
            ),
            Self::Coder(s) => (
                "💻",
                "Coder Agent",
                format!("Ready to assist with your {} questions.", s.language),
            ),
            Self::DocumentAnalyst => (
                "📄",
                "Document Analyst",
                "Upload a text file to get started.".to_owned(),
            ),
            Self::SearchAssistant => (
                "🌐",
                "Search Assistant",
                "Ask me anything about current events or topics.".to_owned(),
            ),
            Self::TaskAgent => (
                "📋",
                "Task Agent",
                "Ready to help you break down goals and manage tasks.".to_owned(),
            ),
            Self::Money(_) | Self::ImageGeneration | Self::ImageEditor => (
                "✨",
                "IntelliAgent",
                "How can I help you today?".to_owned(),
            ),
        };
        WelcomeInfo {
            icon,
            title,
            description,
        }
    }

    /// System instruction sent with every completion request.
    pub fn system_instruction(&self) -> String {
        match self {
            Self::Homework(HomeworkSettings { subject, grade }) => format!(
                "You are an expert tutor AI. The user is a {grade} student asking about {subject}. \
                 Provide clear, helpful, and age-appropriate explanations. Format your response \
                 using markdown for readability. Feel free to use relevant emojis to make your \
                 responses more engaging.\n**IMPORTANT**: You must strictly refuse to answer any \
                 questions not related to {subject} for a {grade} student. If a question is \
                 off-topic, politely explain that your role is to help with the selected subject \
                 and grade level."
            ),
            Self::Coder(CoderSettings { language }) => format!(
                "You are a full-stack web development expert specializing in {language}. Your task \
                 is to generate complete, self-contained, and runnable code for websites, \
                 applications, and components. For web-based requests (HTML/CSS/JS), provide a \
                 single HTML file that includes all necessary CSS within <style> tags and \
                 JavaScript within <script> tags. The code must be ready to be rendered in a \
                 browser without any external dependencies unless specified. **IMPORTANT**: You \
                 must strictly refuse to answer any questions not related to coding or web \
                 development."
            ),
            Self::DocumentAnalyst => "You are an expert Document Analyst AI. Your role is to \
                 carefully analyze the provided document content and answer the user's questions \
                 based on it. Be thorough, precise, and cite information from the document where \
                 possible. If the user's question cannot be answered from the document, state that \
                 clearly. Use emojis to structure your responses where it makes sense (e.g., 📌 for \
                 key points)."
                .to_owned(),
            Self::Money(_) => "You are 'Alpha Investor', an elite financial strategist AI. Your \
                 persona is strict, professional, and direct. You do not engage in pleasantries or \
                 off-topic conversations. Your sole focus is to provide high-leverage strategies for \
                 making money, tailored to the user's specific situation. You are not a financial \
                 advisor and you must state this clearly in your first message. Begin every \
                 interaction with a sharp, analytical tone. No games."
                .to_owned(),
            Self::SearchAssistant => "You are a helpful Search Assistant. Your role is to answer \
                 the user's questions based on real-time information from the web. Provide \
                 concise, accurate answers and always cite your sources."
                .to_owned(),
            Self::TaskAgent => "You are a 'Task Master' AI. Your purpose is to help users break \
                 down complex goals into actionable steps and manage tasks. If the user has \
                 connected other services, you can propose tasks that leverage those services \
                 (e.g., 'Draft an email in Outlook', 'Create a new Trello card'). Structure your \
                 responses clearly, often using checklists and numbered lists. Be proactive in \
                 suggesting next steps."
                .to_owned(),
            Self::ImageGeneration | Self::ImageEditor => {
                "You are a helpful AI assistant.".to_owned()
            }
        }
    }

    /// Answers come from a single grounded search call instead of a stream.
    pub fn is_grounded(&self) -> bool {
        matches!(self, Self::SearchAssistant)
    }

    /// Image personas have their own request forms and never chat.
    pub fn is_image_only(&self) -> bool {
        matches!(self, Self::ImageGeneration | Self::ImageEditor)
    }

    /// Code blocks in replies can be explained and previewed.
    pub fn supports_code_actions(&self) -> bool {
        matches!(self, Self::Coder(_))
    }

    /// New conversations start with a pending onboarding step.
    pub fn requires_onboarding(&self) -> bool {
        matches!(self, Self::Money(_))
    }

    /// Apply one settings-form update.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::SettingMismatch`] and leaves the settings
    /// untouched when `key` does not belong to this persona.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let persona = self.id();
        match (self, key) {
            (Self::Homework(s), "subject") => s.subject = value.to_owned(),
            (Self::Homework(s), "grade") => s.grade = value.to_owned(),
            (Self::Coder(s), "language") => s.language = value.to_owned(),
            _ => {
                return Err(AgentError::SettingMismatch {
                    key: key.to_owned(),
                    persona: persona.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Record completed onboarding answers in the money settings.
    pub fn record_onboarding(&mut self, answers: &MoneyOnboarding) {
        if let Self::Money(settings) = self {
            settings.income = Some(answers.income.clone());
            settings.risk = Some(answers.risk);
            settings.goal = Some(answers.goal.clone());
        }
    }
}

impl fmt::Display for AgentPersona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
