//! Durable user profile: the long-term memory tier.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fitness goal. Exactly four categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    LoseWeight,
    GainMuscle,
    Conditioning,
    Maintain,
}

impl Goal {
    pub const ALL: [Goal; 4] = [Goal::LoseWeight, Goal::GainMuscle, Goal::Conditioning, Goal::Maintain];

    /// Stable storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoseWeight => "lose_weight",
            Self::GainMuscle => "gain_muscle",
            Self::Conditioning => "conditioning",
            Self::Maintain => "maintain",
        }
    }

    /// User-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::LoseWeight => "perder peso",
            Self::GainMuscle => "ganhar massa",
            Self::Conditioning => "condicionamento",
            Self::Maintain => "manter peso",
        }
    }
}

impl FromStr for Goal {
    type Err = String;

    /// Accepts storage keys and user-facing labels.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Goal::ALL
            .into_iter()
            .find(|g| g.as_str() == s || g.label() == s)
            .ok_or_else(|| format!("unknown goal: {s}"))
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Training experience. Exactly three categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl TrainingLevel {
    pub const ALL: [TrainingLevel; 3] = [
        TrainingLevel::Beginner,
        TrainingLevel::Intermediate,
        TrainingLevel::Advanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Beginner => "iniciante",
            Self::Intermediate => "intermediário",
            Self::Advanced => "avançado",
        }
    }
}

impl FromStr for TrainingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "beginner" | "iniciante" => Ok(Self::Beginner),
            "intermediate" | "intermediário" | "intermediario" => Ok(Self::Intermediate),
            "advanced" | "avançado" | "avancado" => Ok(Self::Advanced),
            _ => Err(format!("unknown training level: {s}")),
        }
    }
}

impl fmt::Display for TrainingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single collectable profile field, in onboarding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Age,
    Weight,
    Height,
    Goal,
    TrainingLevel,
    Restrictions,
}

impl ProfileField {
    /// Collection order.
    pub const ORDER: [ProfileField; 6] = [
        ProfileField::Age,
        ProfileField::Weight,
        ProfileField::Height,
        ProfileField::Goal,
        ProfileField::TrainingLevel,
        ProfileField::Restrictions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Weight => "weight",
            Self::Height => "height",
            Self::Goal => "goal",
            Self::TrainingLevel => "training_level",
            Self::Restrictions => "restrictions",
        }
    }

    /// Portuguese name used in confirmations.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Age => "idade",
            Self::Weight => "peso",
            Self::Height => "altura",
            Self::Goal => "objetivo",
            Self::TrainingLevel => "nível de treino",
            Self::Restrictions => "restrições",
        }
    }
}

impl fmt::Display for ProfileField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable profile. Every field is optional until collected.
///
/// `restrictions == Some("")` means the user has no restrictions; `None`
/// means the question has not been answered yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub age: Option<u32>,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<u32>,
    pub goal: Option<Goal>,
    pub training_level: Option<TrainingLevel>,
    pub restrictions: Option<String>,
    pub name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn has(&self, field: ProfileField) -> bool {
        match field {
            ProfileField::Age => self.age.is_some(),
            ProfileField::Weight => self.weight_kg.is_some(),
            ProfileField::Height => self.height_cm.is_some(),
            ProfileField::Goal => self.goal.is_some(),
            ProfileField::TrainingLevel => self.training_level.is_some(),
            ProfileField::Restrictions => self.restrictions.is_some(),
        }
    }

    /// No collectable field has been captured yet.
    pub fn is_empty(&self) -> bool {
        ProfileField::ORDER.iter().all(|f| !self.has(*f))
    }

    pub fn is_complete(&self) -> bool {
        ProfileField::ORDER.iter().all(|f| self.has(*f))
    }

    /// First field still missing, in collection order.
    pub fn first_missing(&self) -> Option<ProfileField> {
        ProfileField::ORDER.into_iter().find(|f| !self.has(*f))
    }

    /// Apply a delta. Only fields present in the delta change.
    pub fn apply(&mut self, delta: &ProfileDelta) {
        if let Some(age) = delta.age {
            self.age = Some(age);
        }
        if let Some(weight) = delta.weight_kg {
            self.weight_kg = Some(weight);
        }
        if let Some(height) = delta.height_cm {
            self.height_cm = Some(height);
        }
        if let Some(goal) = delta.goal {
            self.goal = Some(goal);
        }
        if let Some(level) = delta.training_level {
            self.training_level = Some(level);
        }
        if let Some(restrictions) = &delta.restrictions {
            self.restrictions = Some(restrictions.clone());
        }
        if let Some(name) = &delta.name {
            self.name = Some(name.clone());
        }
    }

    /// Display value for one field, if set.
    pub fn display_value(&self, field: ProfileField) -> Option<String> {
        match field {
            ProfileField::Age => self.age.map(|a| format!("{a} anos")),
            ProfileField::Weight => self.weight_kg.map(|w| format!("{} kg", format_weight(w))),
            ProfileField::Height => self.height_cm.map(|h| format!("{h} cm")),
            ProfileField::Goal => self.goal.map(|g| g.label().to_string()),
            ProfileField::TrainingLevel => self.training_level.map(|l| l.label().to_string()),
            ProfileField::Restrictions => self.restrictions.as_ref().map(|r| {
                if r.is_empty() {
                    "nenhuma".to_string()
                } else {
                    r.clone()
                }
            }),
        }
    }

    /// Bullet list of collected fields.
    pub fn summary_lines(&self) -> String {
        let lines: Vec<String> = ProfileField::ORDER
            .into_iter()
            .filter_map(|f| {
                self.display_value(f)
                    .map(|v| format!("• **{}:** {v}", capitalize(f.label())))
            })
            .collect();
        if lines.is_empty() {
            "Nenhum dado coletado ainda.".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// A partial profile write. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<Goal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_level: Option<TrainingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ProfileDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fields this delta touches.
    pub fn fields(&self) -> Vec<ProfileField> {
        let probe = {
            let mut p = Profile::default();
            p.apply(self);
            p
        };
        ProfileField::ORDER.into_iter().filter(|f| probe.has(*f)).collect()
    }
}

/// A single extracted field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Age(u32),
    Weight(f64),
    Height(u32),
    Goal(Goal),
    TrainingLevel(TrainingLevel),
    Restrictions(String),
}

impl FieldValue {
    pub fn field(&self) -> ProfileField {
        match self {
            Self::Age(_) => ProfileField::Age,
            Self::Weight(_) => ProfileField::Weight,
            Self::Height(_) => ProfileField::Height,
            Self::Goal(_) => ProfileField::Goal,
            Self::TrainingLevel(_) => ProfileField::TrainingLevel,
            Self::Restrictions(_) => ProfileField::Restrictions,
        }
    }

    /// A delta writing exactly this one field.
    pub fn into_delta(self) -> ProfileDelta {
        let mut delta = ProfileDelta::default();
        match self {
            Self::Age(v) => delta.age = Some(v),
            Self::Weight(v) => delta.weight_kg = Some(v),
            Self::Height(v) => delta.height_cm = Some(v),
            Self::Goal(v) => delta.goal = Some(v),
            Self::TrainingLevel(v) => delta.training_level = Some(v),
            Self::Restrictions(v) => delta.restrictions = Some(v),
        }
        delta
    }

    /// Display text used in confirmations.
    pub fn display(&self) -> String {
        match self {
            Self::Age(v) => format!("{v} anos"),
            Self::Weight(v) => format!("{} kg", format_weight(*v)),
            Self::Height(v) => format!("{v} cm"),
            Self::Goal(g) => g.label().to_string(),
            Self::TrainingLevel(l) => l.label().to_string(),
            Self::Restrictions(r) if r.is_empty() => "nenhuma".to_string(),
            Self::Restrictions(r) => r.clone(),
        }
    }
}

/// `80` for whole kilos, `72.5` otherwise.
pub fn format_weight(w: f64) -> String {
    if w.fract() == 0.0 {
        format!("{w:.0}")
    } else {
        format!("{w:.1}")
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
