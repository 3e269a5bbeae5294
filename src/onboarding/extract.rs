//! Per-field parsers for onboarding answers.
//!
//! Numeric fields are parsed deterministically with range checks. Goal and
//! training level ask the model for a closed label first and fall back to a
//! synonym table. Every parser returns `None` rather than guessing.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::profile::{FieldValue, Goal, ProfileField, TrainingLevel};

pub const AGE_RANGE: std::ops::RangeInclusive<u32> = 13..=100;
pub const WEIGHT_RANGE: std::ops::RangeInclusive<f64> = 30.0..=300.0;
pub const HEIGHT_RANGE: std::ops::RangeInclusive<u32> = 100..=250;

static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("valid regex"));

static WEIGHT_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(?:kg|kgs|quilos?|kilos?)\b").expect("valid regex")
});

static WEIGHT_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bpes[oa]\w*\D{0,15}?(\d+(?:[.,]\d+)?)").expect("valid regex")
});

static AGE_WITH_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d+)\s*anos?\b").expect("valid regex"));

static AGE_LABELLED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bidade\D{0,15}?(\d+)").expect("valid regex"));

/// A unit right after a number that makes it some other measurement.
static UNIT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:anos?|kg|kgs|quilos?|kilos?|cm|m|metros?)\b").expect("valid regex")
});

static HEIGHT_METERS_AND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d)\s*metros?\s*e\s*(\d{1,2})\b").expect("valid regex")
});

static HEIGHT_DECIMAL_M: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d[.,]\d{1,2})\s*m\b").expect("valid regex"));

static HEIGHT_M_CM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d)\s*m\s*(\d{1,2})\b").expect("valid regex"));

static HEIGHT_CM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{2,3}(?:[.,]\d+)?)\s*cm\b").expect("valid regex"));

static HEIGHT_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d[.,]\d{1,2})\b").expect("valid regex"));

fn to_f64(s: &str) -> Option<f64> {
    s.replace(',', ".").parse().ok()
}

fn first_capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// First number not followed by a unit.
fn bare_number<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.find_iter(text)
        .find(|m| !UNIT_SUFFIX.is_match(&text[m.end()..]))
        .map(|m| m.as_str())
}

/// Age from `N anos`, `idade N`, or the first unitless integer.
pub fn parse_age(text: &str) -> Option<u32> {
    let raw = first_capture(&AGE_WITH_UNIT, text)
        .or_else(|| first_capture(&AGE_LABELLED, text))
        .or_else(|| bare_number(&INTEGER, text))?;
    let age: u32 = raw.parse().ok()?;
    AGE_RANGE.contains(&age).then_some(age)
}

/// Weight in kg: `N kg`, then `peso N`, then the first unitless number.
/// Comma decimals ok.
pub fn parse_weight(text: &str) -> Option<f64> {
    let raw = first_capture(&WEIGHT_WITH_UNIT, text)
        .or_else(|| first_capture(&WEIGHT_LABELLED, text))
        .or_else(|| bare_number(&NUMBER, text))?;
    let kg = to_f64(raw)?;
    let kg = (kg * 10.0).round() / 10.0;
    WEIGHT_RANGE.contains(&kg).then_some(kg)
}

/// Values under 100 are meters.
fn to_cm(value: f64) -> u32 {
    let cm = if value >= 100.0 { value } else { value * 100.0 };
    cm.round() as u32
}

/// Height in cm from `1 metro e 80`, `1,80m`, `1m80`, `180cm`, `1,80` or `180`.
pub fn parse_height(text: &str) -> Option<u32> {
    let cm = if let Some(c) = HEIGHT_METERS_AND.captures(text) {
        let meters: u32 = c[1].parse().ok()?;
        let rest: u32 = c[2].parse().ok()?;
        meters * 100 + rest
    } else if let Some(c) = HEIGHT_DECIMAL_M.captures(text) {
        to_cm(to_f64(&c[1])?)
    } else if let Some(c) = HEIGHT_M_CM.captures(text) {
        let meters: u32 = c[1].parse().ok()?;
        // "1m8" reads as 1.80, "1m08" as 1.08
        let rest: u32 = if c[2].len() == 1 {
            c[2].parse::<u32>().ok()? * 10
        } else {
            c[2].parse().ok()?
        };
        meters * 100 + rest
    } else if let Some(c) = HEIGHT_CM.captures(text) {
        to_cm(to_f64(&c[1])?)
    } else if let Some(c) = HEIGHT_DECIMAL.captures(text) {
        to_cm(to_f64(&c[1])?)
    } else {
        to_cm(to_f64(NUMBER.find(text)?.as_str())?)
    };
    HEIGHT_RANGE.contains(&cm).then_some(cm)
}

const GOAL_SYNONYMS: &[(Goal, &[&str])] = &[
    (
        Goal::LoseWeight,
        &[
            "perder peso", "emagrecer", "emagrecimento", "perder gordura", "queimar gordura",
            "reduzir gordura", "reduzir percentual", "secar", "definir", "definição", "perder quilos",
            "ficar magro", "ficar mais magro",
        ],
    ),
    (
        Goal::GainMuscle,
        &[
            "ganhar massa", "hipertrofia", "ganhar músculo", "ganhar musculo", "massa muscular",
            "ficar forte", "mais forte", "ficar grande", "crescer", "ganhar peso", "bulking",
        ],
    ),
    (
        Goal::Conditioning,
        &[
            "condicionamento", "resistência", "resistencia", "cardio", "fôlego", "folego",
            "endurance", "correr", "corrida", "disposição", "disposicao",
        ],
    ),
    (
        Goal::Maintain,
        &["manter", "manutenção", "manutencao", "estabilizar", "continuar como estou"],
    ),
];

const LEVEL_SYNONYMS: &[(TrainingLevel, &[&str])] = &[
    (
        TrainingLevel::Beginner,
        &[
            "iniciante", "começando", "comecando", "comecei agora", "nunca treinei", "nunca fiz",
            "sedentário", "sedentario", "sedentária", "sedentaria", "pouca experiência",
            "pouca experiencia", "básico", "basico",
        ],
    ),
    (
        TrainingLevel::Advanced,
        &[
            "avançado", "avancado", "avançada", "avancada", "experiente", "atleta",
            "treino pesado", "treino intenso", "competidor",
        ],
    ),
    (
        TrainingLevel::Intermediate,
        &[
            "intermediário", "intermediario", "intermediária", "intermediaria", "médio", "medio",
            "moderado", "regular", "alguns meses",
        ],
    ),
];

/// Answers meaning "no restrictions".
const NO_RESTRICTIONS: &[&str] = &[
    "nenhuma", "nenhum", "nenhuma restrição", "nenhuma restricao", "não", "nao", "n", "no",
    "none", "nada", "não tenho", "nao tenho", "sem restrições", "sem restricoes", "sem restrição",
    "sem restricao", "não possuo", "nao possuo",
];

fn lowercase_words(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Option number typed from a numbered menu, e.g. "2".
fn menu_choice(text: &str, options: usize) -> Option<usize> {
    let n: usize = text.trim().trim_end_matches(['.', ')']).parse().ok()?;
    (1..=options).contains(&n).then(|| n - 1)
}

fn synonym_lookup<T: Copy>(text: &str, table: &[(T, &[&str])]) -> Option<T> {
    let padded = format!(" {} ", lowercase_words(text));
    table
        .iter()
        .find(|(_, words)| words.iter().any(|w| padded.contains(&format!(" {w} "))))
        .map(|(value, _)| *value)
}

/// Synonym-table goal match, or a menu number 1–4.
pub fn goal_from_synonyms(text: &str) -> Option<Goal> {
    if let Some(i) = menu_choice(text, Goal::ALL.len()) {
        return Some(Goal::ALL[i]);
    }
    synonym_lookup(text, GOAL_SYNONYMS)
}

/// Synonym-table level match, or a menu number 1–3.
pub fn level_from_synonyms(text: &str) -> Option<TrainingLevel> {
    if let Some(i) = menu_choice(text, TrainingLevel::ALL.len()) {
        return Some(TrainingLevel::ALL[i]);
    }
    synonym_lookup(text, LEVEL_SYNONYMS)
}

/// Free text, with "none" variants normalized to the empty sentinel.
pub fn parse_restrictions(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let words = lowercase_words(trimmed);
    if words.is_empty() {
        return None;
    }
    if NO_RESTRICTIONS.contains(&words.as_str()) || words.starts_with("nenhum") {
        return Some(String::new());
    }
    Some(trimmed.to_string())
}

/// Parse one field's value from free text. The deterministic path only.
pub fn parse_field(field: ProfileField, text: &str) -> Option<FieldValue> {
    match field {
        ProfileField::Age => parse_age(text).map(FieldValue::Age),
        ProfileField::Weight => parse_weight(text).map(FieldValue::Weight),
        ProfileField::Height => parse_height(text).map(FieldValue::Height),
        ProfileField::Goal => goal_from_synonyms(text).map(FieldValue::Goal),
        ProfileField::TrainingLevel => level_from_synonyms(text).map(FieldValue::TrainingLevel),
        ProfileField::Restrictions => parse_restrictions(text).map(FieldValue::Restrictions),
    }
}

fn goal_prompt(text: &str) -> String {
    format!(
        "Classifique o objetivo de fitness do usuário.\n\n\
         MENSAGEM: \"{text}\"\n\n\
         OBJETIVOS:\n\
         - \"lose_weight\": emagrecer, queimar gordura, secar, reduzir percentual de gordura\n\
         - \"gain_muscle\": hipertrofia, ganhar massa, ficar mais forte\n\
         - \"conditioning\": resistência, cardio, condicionamento físico\n\
         - \"maintain\": manter o peso atual\n\n\
         Responda apenas com o rótulo ou \"null\"."
    )
}

fn level_prompt(text: &str) -> String {
    format!(
        "Classifique o nível de treino do usuário.\n\n\
         MENSAGEM: \"{text}\"\n\n\
         NÍVEIS:\n\
         - \"beginner\": nunca treinou ou treina há menos de 6 meses\n\
         - \"intermediate\": treina de 6 meses a 2 anos\n\
         - \"advanced\": treina há mais de 2 anos\n\n\
         Responda apenas com o rótulo ou \"null\"."
    )
}

/// First line of a label reply, unquoted and lowercased.
fn clean_label(reply: &str) -> String {
    reply
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .to_lowercase()
}

/// Field extraction, with the model consulted for closed-vocabulary fields.
pub struct FieldExtractor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl FieldExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn extract(&self, field: ProfileField, text: &str) -> Option<FieldValue> {
        match field {
            ProfileField::Goal => {
                let from_model = self.ask_label(goal_prompt(text)).await;
                from_model
                    .and_then(|label| label.parse::<Goal>().ok())
                    .or_else(|| goal_from_synonyms(text))
                    .map(FieldValue::Goal)
            }
            ProfileField::TrainingLevel => {
                let from_model = self.ask_label(level_prompt(text)).await;
                from_model
                    .and_then(|label| label.parse::<TrainingLevel>().ok())
                    .or_else(|| level_from_synonyms(text))
                    .map(FieldValue::TrainingLevel)
            }
            _ => parse_field(field, text),
        }
    }

    async fn ask_label(&self, prompt: String) -> Option<String> {
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_max_tokens(20)
            .with_temperature(0.1)
            .with_timeout(self.timeout);
        match self.llm.complete(request).await {
            Ok(response) => {
                let label = clean_label(&response.content);
                (label != "null" && !label.is_empty()).then_some(label)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Label extraction unavailable, using synonyms");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::CompletionResponse;

    #[test]
    fn age_in_range() {
        assert_eq!(parse_age("tenho 25 anos"), Some(25));
        assert_eq!(parse_age("13"), Some(13));
        assert_eq!(parse_age("100 anos"), Some(100));
    }

    #[test]
    fn age_out_of_range_or_missing() {
        assert_eq!(parse_age("5"), None);
        assert_eq!(parse_age("tenho 150 anos"), None);
        assert_eq!(parse_age("vinte e cinco"), None);
    }

    #[test]
    fn age_prefers_the_number_next_to_anos() {
        assert_eq!(parse_age("tenho 2 filhos e 35 anos"), Some(35));
        assert_eq!(parse_age("peso 80kg e tenho 35"), Some(35));
        assert_eq!(parse_age("minha idade é 42, moro há 3"), Some(42));
    }

    #[test]
    fn weight_forms() {
        assert_eq!(parse_weight("80kg"), Some(80.0));
        assert_eq!(parse_weight("peso 72,5 kg"), Some(72.5));
        assert_eq!(parse_weight("uns 90 quilos"), Some(90.0));
        assert_eq!(parse_weight("75"), Some(75.0));
        assert_eq!(parse_weight("atualizar peso para 82 kg"), Some(82.0));
    }

    #[test]
    fn weight_rejects_out_of_range() {
        assert_eq!(parse_weight("20 kg"), None);
        assert_eq!(parse_weight("350"), None);
        assert_eq!(parse_weight("não sei"), None);
    }

    #[test]
    fn weight_prefers_the_number_next_to_kg() {
        assert_eq!(parse_weight("tenho 35 anos e peso 80"), Some(80.0));
        assert_eq!(parse_weight("treino 3 vezes e estou com 78,5 kg"), Some(78.5));
        assert_eq!(parse_weight("35 anos, 1,80 m e 90"), Some(90.0));
        assert_eq!(parse_weight("tenho 25 anos"), None);
    }

    #[test]
    fn height_forms() {
        assert_eq!(parse_height("1 metro e 80"), Some(180));
        assert_eq!(parse_height("1,80m"), Some(180));
        assert_eq!(parse_height("1.75 m"), Some(175));
        assert_eq!(parse_height("1m80"), Some(180));
        assert_eq!(parse_height("1m8"), Some(180));
        assert_eq!(parse_height("180cm"), Some(180));
        assert_eq!(parse_height("tenho 1,65"), Some(165));
        assert_eq!(parse_height("180"), Some(180));
    }

    #[test]
    fn height_rejects_out_of_range() {
        assert_eq!(parse_height("90cm"), None);
        assert_eq!(parse_height("300"), None);
        assert_eq!(parse_height("alto"), None);
    }

    #[test]
    fn goal_synonyms() {
        assert_eq!(goal_from_synonyms("quero emagrecer"), Some(Goal::LoseWeight));
        assert_eq!(goal_from_synonyms("Hipertrofia!"), Some(Goal::GainMuscle));
        assert_eq!(goal_from_synonyms("melhorar meu fôlego"), Some(Goal::Conditioning));
        assert_eq!(goal_from_synonyms("só manter"), Some(Goal::Maintain));
        assert_eq!(goal_from_synonyms("2"), Some(Goal::GainMuscle));
        assert_eq!(goal_from_synonyms("sei lá"), None);
    }

    #[test]
    fn level_synonyms() {
        assert_eq!(level_from_synonyms("sou iniciante"), Some(TrainingLevel::Beginner));
        assert_eq!(level_from_synonyms("nível intermediário"), Some(TrainingLevel::Intermediate));
        assert_eq!(level_from_synonyms("bem experiente"), Some(TrainingLevel::Advanced));
        assert_eq!(level_from_synonyms("3"), Some(TrainingLevel::Advanced));
        assert_eq!(level_from_synonyms("4"), None);
    }

    #[test]
    fn restrictions_none_variants() {
        for text in ["nenhuma", "Não", "no", "none", "Nenhuma restrição!", "não tenho"] {
            assert_eq!(parse_restrictions(text), Some(String::new()), "{text}");
        }
        assert_eq!(parse_restrictions("intolerância a lactose"), Some("intolerância a lactose".into()));
        assert_eq!(parse_restrictions("   "), None);
    }

    struct LabelProvider(Option<&'static str>);

    #[async_trait]
    impl LlmProvider for LabelProvider {
        fn model_name(&self) -> &str {
            "label"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            match self.0 {
                Some(label) => Ok(CompletionResponse::text(label)),
                None => Err(LlmError::RequestFailed {
                    provider: "label".into(),
                    reason: "offline".into(),
                }),
            }
        }
    }

    fn extractor(reply: Option<&'static str>) -> FieldExtractor {
        FieldExtractor::new(Arc::new(LabelProvider(reply)), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn model_label_wins() {
        let value = extractor(Some("\"conditioning\"")).extract(ProfileField::Goal, "quero emagrecer").await;
        assert_eq!(value, Some(FieldValue::Goal(Goal::Conditioning)));
    }

    #[tokio::test]
    async fn null_label_falls_back_to_synonyms() {
        let value = extractor(Some("null")).extract(ProfileField::Goal, "quero emagrecer").await;
        assert_eq!(value, Some(FieldValue::Goal(Goal::LoseWeight)));
    }

    #[tokio::test]
    async fn provider_down_falls_back_to_synonyms() {
        let value = extractor(None)
            .extract(ProfileField::TrainingLevel, "treino há alguns meses")
            .await;
        assert_eq!(value, Some(FieldValue::TrainingLevel(TrainingLevel::Intermediate)));
    }

    #[tokio::test]
    async fn numeric_fields_skip_the_model() {
        let value = extractor(Some("gain_muscle")).extract(ProfileField::Age, "tenho 25 anos").await;
        assert_eq!(value, Some(FieldValue::Age(25)));
    }
}
