//! Consultation handler: the long-running trainer/nutrition conversation.
//!
//! Owns the sticky session. Every answered turn marks the user as locked into
//! consultation; an exit phrase releases the lock.

use std::sync::Arc;
use std::time::Duration;

use crate::affinity::SessionAffinity;
use crate::error::CoreError;
use crate::handler::{AnalysisContext, HandlerInput, HandlerName, HandlerOutput, Handoff};
use crate::intent::keywords::is_exit_phrase;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::memory::{HandlerType, HandlerView, ShortTermEntry};
use crate::observe::{self, SessionEvent};
use crate::profile::{Profile, ProfileField};
use crate::store::Direction;

/// Turns of transcript included in the consultation prompt.
const PROMPT_TURNS: usize = 5;

pub const PROFILE_NEEDED: &str = "\
👩‍⚕️ **Consulta Nutricional Individual**\n\n\
Olá! Sou seu assistente pessoal de fitness e nutrição e estou aqui para te ajudar com \
orientações personalizadas sobre treino, alimentação e estilo de vida.\n\n\
Para realizar uma consulta completa e eficaz, preciso conhecer melhor você primeiro. \
Que tal completarmos seu perfil básico?";

pub const CLOSING: &str = "\
💪 **Consulta Finalizada**\n\n\
Obrigado pela consulta! Foi um prazer te ajudar com suas questões de saúde, nutrição e treino.\n\n\
Se precisar de mais orientações no futuro, estarei aqui!\n\n\
Como posso te ajudar agora?";

const SYSTEM_PROMPT: &str = "\
Você é um personal trainer e nutricionista digital. Conduza uma conversa natural, acolhedora \
e prática, como em uma consulta real. Use frases curtas, listas de até 3 a 5 itens e exemplos \
aplicáveis ao dia a dia. Use emojis com moderação.\n\n\
Áreas: nutrição, suplementação (orientação geral, nunca prescreva medicamentos), treinos e a \
integração entre alimentação e treino.\n\n\
Limites: você não é médico. Não faça diagnósticos. Se o tema sair do escopo de saúde, nutrição \
ou treino, encerre educadamente. Em questões emocionais profundas, oriente a procurar apoio \
psicológico.\n\n\
Quando houver uma seção IMAGEM ENVIADA, use os dados da análise para responder de forma \
específica. Não diga que não consegue ver a imagem.";

/// Handles consultation turns, text or image.
pub struct ConsultationHandler {
    llm: Arc<dyn LlmProvider>,
    affinity: Arc<SessionAffinity>,
    timeout: Duration,
}

impl ConsultationHandler {
    pub fn new(llm: Arc<dyn LlmProvider>, affinity: Arc<SessionAffinity>, timeout: Duration) -> Self {
        Self {
            llm,
            affinity,
            timeout,
        }
    }

    pub async fn handle(&self, input: HandlerInput) -> Result<HandlerOutput, CoreError> {
        let user_id = input.user_id.as_str();
        let HandlerView::Consultation {
            profile,
            onboarding_completed,
            recent_messages,
            ..
        } = input.context.for_handler(HandlerType::Consultation)
        else {
            return Err(CoreError::Handler {
                handler: HandlerName::Consultation.to_string(),
                reason: "unexpected memory view".into(),
            });
        };

        if !onboarding_completed {
            tracing::info!(user_id, "Consultation requested before onboarding");
            return Ok(HandlerOutput::text(PROFILE_NEEDED)
                .with_handoff(Handoff::new(HandlerName::Onboarding, "Perfil básico incompleto")));
        }

        let sticky = self
            .affinity
            .get_active(user_id)
            .await
            .is_some_and(|e| e.handler == HandlerName::Consultation);

        if sticky && input.image.is_none() && self.wants_exit(&input.content).await {
            self.affinity.clear(user_id).await;
            observe::session_event(user_id, SessionEvent::ConsultationClosed, "exit phrase");
            return Ok(HandlerOutput::text(CLOSING));
        }

        let prompt = build_prompt(
            &input.content,
            profile,
            recent_messages,
            input.analysis.as_ref(),
            sticky,
        );
        tracing::debug!(user_id, prompt_len = prompt.len(), continuation = sticky, "Consultation prompt built");

        let mut user_message = ChatMessage::user(prompt);
        if let Some(image) = &input.image {
            user_message = user_message.with_image(image.clone());
        }
        let request = CompletionRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), user_message])
            .with_max_tokens(2000)
            .with_temperature(0.4)
            .with_timeout(self.timeout);

        let generated = match self.llm.complete(request).await {
            Ok(response) if !response.content.trim().is_empty() => response.content.trim().to_string(),
            Ok(_) => {
                tracing::warn!(user_id, "Empty consultation reply, using canned orientation");
                canned_orientation(profile)
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Consultation generation failed, using canned orientation");
                canned_orientation(profile)
            }
        };

        let response_text = match input.analysis.as_ref().map(extraction_summary) {
            Some(summary) if !summary.is_empty() => format!("{summary}\n\n{generated}"),
            _ => generated,
        };

        self.affinity.set_active(user_id, HandlerName::Consultation).await;
        if !sticky {
            observe::session_event(user_id, SessionEvent::AffinitySet, "consultation started");
        }
        Ok(HandlerOutput::text(response_text))
    }

    /// Yes/no model check, falling back to the exit vocabulary.
    async fn wants_exit(&self, content: &str) -> bool {
        let prompt = format!(
            "Analise se o usuário quer SAIR da consulta.\n\n\
             Mensagem do usuário: \"{content}\"\n\n\
             Responda APENAS:\n\
             - \"SAIR\" se o usuário quer encerrar/finalizar a consulta\n\
             - \"CONTINUAR\" se quer manter a consulta\n\n\
             Exemplos de SAIR: despedidas, agradecimentos finais, \"tchau\", \"obrigado\", \"até logo\".\n\
             Exemplos de CONTINUAR: perguntas sobre nutrição ou treino, pedidos de ajuda, dúvidas."
        );
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_max_tokens(10)
            .with_temperature(0.1)
            .with_timeout(self.timeout);

        match self.llm.complete(request).await {
            Ok(response) => match response.content.trim().trim_matches('"').to_uppercase().as_str() {
                "SAIR" => true,
                "CONTINUAR" => false,
                other => {
                    tracing::debug!(reply = other, "Unclear exit reply, using keywords");
                    is_exit_phrase(content)
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "Exit check unavailable, using keywords");
                is_exit_phrase(content)
            }
        }
    }
}

fn profile_value(profile: &Profile, field: ProfileField) -> String {
    profile.display_value(field).unwrap_or_else(|| "N/A".to_string())
}

fn build_prompt(
    content: &str,
    profile: &Profile,
    recent: &[ShortTermEntry],
    analysis: Option<&AnalysisContext>,
    continuation: bool,
) -> String {
    let mut prompt = format!(
        "DADOS DO PACIENTE:\n\
         - Idade: {}\n\
         - Peso: {}\n\
         - Altura: {}\n\
         - Objetivo: {}\n\
         - Nível de treino: {}\n\
         - Restrições: {}\n\n\
         SOLICITAÇÃO DO PACIENTE: \"{content}\"\n",
        profile_value(profile, ProfileField::Age),
        profile_value(profile, ProfileField::Weight),
        profile_value(profile, ProfileField::Height),
        profile_value(profile, ProfileField::Goal),
        profile_value(profile, ProfileField::TrainingLevel),
        profile_value(profile, ProfileField::Restrictions),
    );

    // Short-term memory is newest first; the prompt reads oldest first.
    let turns: Vec<String> = recent
        .iter()
        .take(PROMPT_TURNS)
        .rev()
        .map(|m| {
            let who = match m.direction {
                Direction::Inbound => "paciente",
                Direction::Outbound => "assistente",
            };
            format!("{who}: {}", m.content)
        })
        .collect();
    if !turns.is_empty() {
        prompt.push_str(&format!("\nCONTEXTO RECENTE:\n{}\n", turns.join("\n")));
    }

    if let Some(a) = analysis {
        let focus = if a.focus_areas.is_empty() {
            "análise geral".to_string()
        } else {
            a.focus_areas.join(", ")
        };
        prompt.push_str(&format!(
            "\nIMAGEM ENVIADA: tipo \"{}\".\n\
             ANÁLISE SOLICITADA: {}\n\
             ESTILO DE RESPOSTA: {}\n\
             ÁREAS DE FOCO: {focus}\n\
             DADOS DA ANÁLISE DA IMAGEM:\n{}\n",
            a.category, a.analysis_type, a.response_style, a.extraction,
        ));
    }

    prompt.push_str(if continuation {
        "\nCONTEXTO: continuação da consulta. Responda de forma curta e direta."
    } else {
        "\nCONTEXTO: nova consulta. Inicie com um acolhimento breve e simpático."
    });
    prompt
}

fn canned_orientation(profile: &Profile) -> String {
    format!(
        "👩‍⚕️ **Consulta Nutricional**\n\n\
         Baseado no seu perfil, aqui estão minhas orientações:\n\n\
         **Seus dados:**\n{}\n\n\
         **Orientações Gerais:**\n\
         - Mantenha hidratação adequada (2-3L/dia)\n\
         - Consuma proteínas em todas as refeições\n\
         - Inclua fibras e micronutrientes\n\
         - Evite alimentos ultraprocessados",
        profile.summary_lines()
    )
}

fn json_number(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Deterministic header built from the secondary extraction.
///
/// Food images always show identified items and the calorie estimate, so
/// the reply carries them even when generation fails.
pub fn extraction_summary(analysis: &AnalysisContext) -> String {
    let data = &analysis.extraction;
    let mut lines = Vec::new();
    match analysis.category.as_str() {
        "food" => {
            let items: Vec<&str> = data["food_items"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            let items = if items.is_empty() {
                "não identificados".to_string()
            } else {
                items.join(", ")
            };
            lines.push(format!("🍽️ **Alimentos identificados:** {items}"));
            let calories = json_number(&data["estimated_calories"]).unwrap_or_else(|| "0".to_string());
            lines.push(format!("🔥 **Calorias estimadas:** {calories} kcal"));
            let macros = &data["macronutrients"];
            if let (Some(p), Some(c), Some(f)) = (
                json_number(&macros["protein"]),
                json_number(&macros["carbs"]),
                json_number(&macros["fat"]),
            ) {
                lines.push(format!("🥩 **Macros:** {p}g proteína, {c}g carboidratos, {f}g gordura"));
            }
        }
        "body_composition" => {
            let rows = [
                ("weight", "⚖️ **Peso:**", " kg"),
                ("body_fat_percentage", "📉 **Gordura corporal:**", "%"),
                ("muscle_mass", "💪 **Massa muscular:**", " kg"),
                ("water_percentage", "💧 **Água corporal:**", "%"),
            ];
            for (key, label, unit) in rows {
                if let Some(v) = json_number(&data[key]) {
                    lines.push(format!("{label} {v}{unit}"));
                }
            }
        }
        _ => {}
    }
    lines.join("\n")
}
