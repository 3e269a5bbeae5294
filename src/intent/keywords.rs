//! Deterministic keyword matching.
//!
//! Runs when the model path fails or returns something unusable, and backs the
//! field detector used for profile updates. Matching is on whole words over a
//! lowercased, punctuation-free copy of the message.

use crate::intent::Intent;
use crate::profile::ProfileField;

const UPDATE_VERBS: &[&str] = &[
    "atualizar", "atualiza", "atualize", "mudar", "muda", "alterar", "altera", "trocar", "troca",
    "corrigir", "update", "change",
];

/// Field vocabulary, in detection priority order.
const FIELD_WORDS: &[(ProfileField, &[&str])] = &[
    (ProfileField::Weight, &["kg", "quilos", "kilos", "peso"]),
    (ProfileField::Height, &["cm", "metros", "metro", "altura"]),
    (ProfileField::Age, &["anos", "idade"]),
    (
        ProfileField::Goal,
        &["perder peso", "emagrecer", "ganhar massa", "hipertrofia", "condicionamento", "objetivo", "meta", "goal"],
    ),
    (
        ProfileField::TrainingLevel,
        &["iniciante", "intermediário", "intermediario", "avançado", "avancado", "nível", "nivel", "level", "experiência"],
    ),
    (
        ProfileField::Restrictions,
        &["vegetariano", "vegano", "lactose", "glúten", "gluten", "alergia", "restrição", "restricao", "restrições", "restricoes"],
    ),
];

/// Words that mean "the whole profile" in an update request.
const PROFILE_WORDS: &[&str] = &["perfil", "dados", "informações", "informacoes"];

const CONSULTATION_PHRASES: &[&str] = &[
    "quero treinar",
    "preciso treinar",
    "fazer treino",
    "criar treino",
    "montar treino",
    "montar meu treino",
    "criar meu treino",
    "plano de treino",
    "treino",
    "exercícios",
    "exercicios",
    "academia",
    "musculação",
    "musculacao",
    "quero dieta",
    "preciso dieta",
    "dieta",
    "plano alimentar",
    "alimentação",
    "alimentacao",
    "comer",
    "refeições",
    "refeicoes",
    "bioimpedância",
    "bioimpedancia",
    "composição corporal",
    "percentual de gordura",
    "massa muscular",
    "análise corporal",
    "receita",
    "receitas",
    "ingredientes",
    "cozinhar",
    "nutricionista",
    "consulta nutricional",
    "analisar comida",
    "avaliar alimentação",
    "orientação nutricional",
    "nutrição",
    "nutricao",
];

const EXIT_PHRASES: &[&str] = &[
    "obrigado",
    "obrigada",
    "valeu",
    "tchau",
    "até logo",
    "ate logo",
    "até mais",
    "ate mais",
    "finalizar",
    "terminar",
    "encerrar",
    "sair",
    "thanks",
    "thank you",
    "bye",
    "done",
];

/// Lowercase, replace punctuation with spaces and pad with a space on each
/// side so phrases can be matched as ` phrase `.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(" {joined} ")
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&format!(" {phrase} "))
}

fn contains_any(normalized: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| contains_phrase(normalized, p))
}

/// Which profile field a message is talking about, if any.
pub fn detect_field(text: &str) -> Option<ProfileField> {
    let normalized = normalize(text);
    FIELD_WORDS
        .iter()
        .find(|(_, words)| contains_any(&normalized, words))
        .map(|(field, _)| *field)
}

/// Whether the message asks to change stored data.
pub fn has_update_verb(text: &str) -> bool {
    contains_any(&normalize(text), UPDATE_VERBS)
}

/// Recover an intent without the model.
///
/// An update verb next to field or profile vocabulary is a profile update;
/// training, diet, recipe or analysis vocabulary is a consultation.
pub fn keyword_intent(text: &str) -> Option<Intent> {
    let normalized = normalize(text);

    if contains_any(&normalized, UPDATE_VERBS)
        && (FIELD_WORDS.iter().any(|(_, words)| contains_any(&normalized, words))
            || contains_any(&normalized, PROFILE_WORDS))
    {
        return Some(Intent::ProfileUpdate);
    }

    if contains_any(&normalized, CONSULTATION_PHRASES) {
        return Some(Intent::Consultation);
    }

    None
}

/// Thanks, goodbye or "done" vocabulary.
pub fn is_exit_phrase(text: &str) -> bool {
    contains_any(&normalize(text), EXIT_PHRASES)
}
