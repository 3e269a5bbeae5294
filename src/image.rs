//! Image turns: vision classification, category-specific extraction and
//! hand-off to the consultation handler.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::consultation::ConsultationHandler;
use crate::dispatch::Envelope;
use crate::error::CoreError;
use crate::handler::{AnalysisContext, HandlerInput, HandlerName};
use crate::llm::{ChatMessage, CompletionRequest, ImageInput, LlmProvider, extract_json_object};
use crate::memory::{HandlerType, LayeredMemory};
use crate::replies;

/// Recognized image kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCategory {
    Food,
    BodyComposition,
    Exercise,
    BodyPhoto,
    NutritionLabel,
    WorkoutSheet,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Food => "food",
            Self::BodyComposition => "body_composition",
            Self::Exercise => "exercise",
            Self::BodyPhoto => "body_photo",
            Self::NutritionLabel => "nutrition_label",
            Self::WorkoutSheet => "workout_sheet",
        }
    }

    fn analysis_type(&self) -> &'static str {
        match self {
            Self::Food => "análise nutricional",
            Self::BodyComposition => "análise de composição corporal",
            Self::Exercise => "análise de exercício",
            Self::BodyPhoto => "análise corporal",
            Self::NutritionLabel => "análise de rótulo nutricional",
            Self::WorkoutSheet => "análise de planilha de treino",
        }
    }

    fn response_style(&self) -> &'static str {
        match self {
            Self::Food => "identificar alimentos, estimar calorias/macros e sugerir melhorias simples",
            Self::BodyComposition => "comentários sobre composição corporal e ajustes na dieta + treino",
            Self::Exercise => "feedback sobre execução, músculos trabalhados e ajustes",
            Self::BodyPhoto => "comentários gerais de composição corporal e sugestões de melhoria",
            Self::NutritionLabel => "destacar pontos relevantes como açúcar, proteína, sódio, calorias",
            Self::WorkoutSheet => "analisar estrutura do treino, exercícios e sugerir melhorias",
        }
    }

    fn focus_areas(&self) -> &'static [&'static str] {
        match self {
            Self::Food => &["calorias", "macronutrientes", "sugestões de melhoria"],
            Self::BodyComposition => &["composição corporal", "evolução", "ajustes na dieta e treino"],
            Self::Exercise => &["execução", "músculos trabalhados", "ajuste de carga/postura"],
            Self::BodyPhoto => &["composição corporal", "ajustes na dieta e treino", "progressão"],
            Self::NutritionLabel => &["açúcar", "proteína", "sódio", "calorias", "ingredientes"],
            Self::WorkoutSheet => &["estrutura do treino", "exercícios", "progressão", "sugestões"],
        }
    }

    /// JSON shape requested from the secondary extraction.
    fn extraction_schema(&self) -> &'static str {
        match self {
            Self::Food => {
                r#"{"food_items": ["alimento"], "estimated_calories": 0, "macronutrients": {"protein": 0, "carbs": 0, "fat": 0}}"#
            }
            Self::BodyComposition => {
                r#"{"weight": 0, "body_fat_percentage": 0, "muscle_mass": 0, "water_percentage": 0}"#
            }
            Self::Exercise => r#"{"exercise": "nome", "muscles_worked": ["músculo"], "posture_notes": "observações"}"#,
            Self::BodyPhoto => r#"{"observations": ["observação"]}"#,
            Self::NutritionLabel => {
                r#"{"calories": 0, "protein": 0, "sugar": 0, "sodium": 0, "ingredients": ["ingrediente"]}"#
            }
            Self::WorkoutSheet => r#"{"exercises": ["exercício"], "structure": "divisão do treino"}"#,
        }
    }
}

impl FromStr for ImageCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "food" | "comida" | "refeicao" | "refeição" => Ok(Self::Food),
            "body_composition" | "bioimpedancia" | "bioimpedância" | "bioimpedance" => Ok(Self::BodyComposition),
            "exercise" | "exercicio" | "exercício" => Ok(Self::Exercise),
            "body_photo" | "body" | "corpo" => Ok(Self::BodyPhoto),
            "nutrition_label" | "label" | "rotulo" | "rótulo" => Ok(Self::NutritionLabel),
            "workout_sheet" | "treino_planilha" | "planilha" => Ok(Self::WorkoutSheet),
            other => Err(format!("unknown image category: {other}")),
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const UNSUPPORTED_IMAGE: &str = "\
❌ Não consegui identificar o tipo da imagem.\n\n\
Mas posso te ajudar com várias análises! Envie imagens de:\n\n\
🍽️ **Refeições/Alimentos** → Identifico ingredientes, estimo calorias e sugiro melhorias\n\
📊 **Relatórios de Bioimpedância** → Analiso composição corporal e evolução\n\
🏃‍♂️ **Exercícios** → Dou feedback sobre execução e ajustes\n\
👤 **Fotos Corporais** → Comentários sobre progressão e ajustes na dieta + treino\n\
🏷️ **Rótulos de Produtos** → Destaco pontos importantes (açúcar, proteína, calorias)\n\n\
Certifique-se de que a imagem está nítida e bem iluminada para melhor análise! 💪";

const CLASSIFY_PROMPT: &str = "\
Classifique esta imagem em UMA categoria:\n\
- \"food\": refeição, prato ou alimentos\n\
- \"body_composition\": relatório de bioimpedância\n\
- \"exercise\": pessoa executando um exercício\n\
- \"body_photo\": foto do corpo para acompanhamento\n\
- \"nutrition_label\": rótulo ou tabela nutricional\n\
- \"workout_sheet\": planilha ou ficha de treino\n\
- \"unknown\": nenhuma das anteriores\n\n\
Responda APENAS com JSON: {\"category\": \"...\", \"confidence\": 0.0}";

#[derive(Debug, Deserialize)]
struct VisionLabel {
    category: String,
    #[serde(default)]
    confidence: f64,
}

/// Vision classification result, already thresholded.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageClass {
    Recognized { category: ImageCategory, confidence: f64 },
    Unsupported { reason: String, confidence: f64 },
}

/// Parse a classifier reply and apply the confidence threshold.
pub fn parse_classification(raw: &str, threshold: f64) -> ImageClass {
    let label: VisionLabel = match serde_json::from_str(&extract_json_object(raw)) {
        Ok(label) => label,
        Err(e) => {
            return ImageClass::Unsupported {
                reason: format!("unparsable classification: {e}"),
                confidence: 0.0,
            };
        }
    };
    let confidence = label.confidence.clamp(0.0, 1.0);
    match label.category.parse::<ImageCategory>() {
        Ok(category) if confidence >= threshold => ImageClass::Recognized { category, confidence },
        Ok(category) => ImageClass::Unsupported {
            reason: format!("{category} below threshold"),
            confidence,
        },
        Err(e) => ImageClass::Unsupported { reason: e, confidence },
    }
}

/// Routes image turns to consultation with a prepared analysis context.
pub struct ImageRouter {
    llm: Arc<dyn LlmProvider>,
    memory: LayeredMemory,
    consultation: Arc<ConsultationHandler>,
    threshold: f64,
    timeout: Duration,
}

impl ImageRouter {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        memory: LayeredMemory,
        consultation: Arc<ConsultationHandler>,
        threshold: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            memory,
            consultation,
            threshold,
            timeout,
        }
    }

    pub async fn route(&self, user_id: &str, image: ImageInput) -> Result<Envelope, CoreError> {
        if image.is_empty() {
            return Ok(unsupported("empty image", 0.0));
        }

        // Gate before any vision call: strangers and half-onboarded users
        // never get an analysis.
        let context = self.memory.get_context(user_id, HandlerType::Consultation).await;
        if !context.long_term.user_exists {
            tracing::info!(user_id, "Image from unregistered user");
            return Ok(Envelope {
                success: true,
                response_text: replies::REGISTRATION.to_string(),
                handler: HandlerName::Registration,
                handoff: None,
                metadata: json!({"intent": "registration", "reason": "unregistered"}),
            });
        }
        if !context.long_term.onboarding_completed {
            let output = self
                .consultation
                .handle(HandlerInput::new(user_id, "", context))
                .await?;
            return Ok(Envelope {
                success: true,
                response_text: output.response_text,
                handler: HandlerName::Consultation,
                handoff: output.handoff,
                metadata: json!({"intent": "image_analysis", "reason": "onboarding incomplete"}),
            });
        }

        let (category, confidence) = match self.classify(&image).await {
            ImageClass::Recognized { category, confidence } => (category, confidence),
            ImageClass::Unsupported { reason, confidence } => {
                tracing::info!(user_id, %reason, confidence, "Image not supported");
                return Ok(unsupported(&reason, confidence));
            }
        };
        tracing::info!(user_id, %category, confidence, "Image classified");

        let analysis = AnalysisContext {
            category: category.as_str().to_string(),
            analysis_type: category.analysis_type().to_string(),
            response_style: category.response_style().to_string(),
            focus_areas: category.focus_areas().iter().map(|s| s.to_string()).collect(),
            extraction: self.extract(category, &image).await,
        };

        let input = HandlerInput::new(user_id, format!("Análise de imagem: {category}"), context)
            .with_image(image, analysis.clone());
        let output = self.consultation.handle(input).await?;

        let head: String = output.response_text.chars().take(100).collect();
        self.memory
            .update_session_summary(
                user_id,
                &format!("Imagem processada: {category}. Resposta: {head}..."),
                Some(category.as_str()),
            )
            .await;

        Ok(Envelope {
            success: true,
            response_text: output.response_text,
            handler: HandlerName::Consultation,
            handoff: output.handoff,
            metadata: json!({
                "intent": "image_analysis",
                "image_category": category.as_str(),
                "confidence": confidence,
                "analysis_type": analysis.analysis_type,
            }),
        })
    }

    async fn classify(&self, image: &ImageInput) -> ImageClass {
        let request = CompletionRequest::new(vec![ChatMessage::user(CLASSIFY_PROMPT).with_image(image.clone())])
            .with_max_tokens(100)
            .with_temperature(0.1)
            .with_timeout(self.timeout);
        match self.llm.complete(request).await {
            Ok(response) => parse_classification(&response.content, self.threshold),
            Err(e) => {
                tracing::warn!(error = %e, "Vision classification failed");
                ImageClass::Unsupported {
                    reason: "classification unavailable".into(),
                    confidence: 0.0,
                }
            }
        }
    }

    /// Category-specific structured extraction. `{}` when unavailable.
    async fn extract(&self, category: ImageCategory, image: &ImageInput) -> serde_json::Value {
        let prompt = format!(
            "Faça uma {} desta imagem.\n\n\
             Retorne APENAS um JSON válido com a estrutura:\n{}\n\n\
             Seja específico. Use estimativas conservadoras quando não tiver certeza.",
            category.analysis_type(),
            category.extraction_schema(),
        );
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt).with_image(image.clone())])
            .with_max_tokens(500)
            .with_temperature(0.2)
            .with_timeout(self.timeout);

        let raw = match self.llm.complete(request).await {
            Ok(response) => response.content,
            Err(e) => {
                tracing::warn!(%category, error = %e, "Image extraction failed");
                return json!({});
            }
        };
        match serde_json::from_str::<serde_json::Value>(&extract_json_object(&raw)) {
            Ok(value) if value.is_object() => value,
            _ => {
                tracing::debug!(%category, raw = %raw, "Unparsable image extraction");
                json!({})
            }
        }
    }
}

fn unsupported(reason: &str, confidence: f64) -> Envelope {
    Envelope {
        success: true,
        response_text: UNSUPPORTED_IMAGE.to_string(),
        handler: HandlerName::ImageRouter,
        handoff: None,
        metadata: json!({
            "intent": "invalid_image",
            "reason": reason,
            "confidence": confidence,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::affinity::SessionAffinity;
    use crate::error::LlmError;
    use crate::llm::CompletionResponse;
    use crate::memory::MemoryConfig;
    use crate::profile::{Goal, ProfileDelta, TrainingLevel};
    use crate::store::{Database, LibSqlBackend};

    #[test]
    fn category_aliases() {
        assert_eq!("bioimpedancia".parse::<ImageCategory>(), Ok(ImageCategory::BodyComposition));
        assert_eq!("label".parse::<ImageCategory>(), Ok(ImageCategory::NutritionLabel));
        assert_eq!("body".parse::<ImageCategory>(), Ok(ImageCategory::BodyPhoto));
        assert_eq!("treino_planilha".parse::<ImageCategory>(), Ok(ImageCategory::WorkoutSheet));
        assert!("selfie".parse::<ImageCategory>().is_err());
    }

    #[test]
    fn threshold_is_inclusive() {
        let at = parse_classification(r#"{"category": "food", "confidence": 0.5}"#, 0.5);
        assert!(matches!(at, ImageClass::Recognized { category: ImageCategory::Food, .. }));
        let below = parse_classification(r#"{"category": "food", "confidence": 0.49}"#, 0.5);
        assert!(matches!(below, ImageClass::Unsupported { .. }));
    }

    #[test]
    fn threshold_edges() {
        let classify = |confidence: f64| {
            parse_classification(
                &format!(r#"{{"category": "food", "confidence": {confidence}}}"#),
                0.5,
            )
        };
        assert!(matches!(classify(0.5), ImageClass::Recognized { .. }));
        assert!(matches!(classify(0.5 + 1e-9), ImageClass::Recognized { .. }));
        assert!(matches!(classify(0.5 - 1e-9), ImageClass::Unsupported { .. }));
        assert!(matches!(classify(0.5 - f64::EPSILON), ImageClass::Unsupported { .. }));
    }

    #[test]
    fn unknown_and_garbage_are_unsupported() {
        let unknown = parse_classification(r#"{"category": "unknown", "confidence": 0.9}"#, 0.5);
        assert!(matches!(unknown, ImageClass::Unsupported { .. }));
        let garbage = parse_classification("não sei", 0.5);
        assert!(matches!(garbage, ImageClass::Unsupported { confidence, .. } if confidence == 0.0));
    }

    /// Vision mock: classification reply, extraction reply, consultation reply.
    #[derive(Default)]
    struct Vision {
        classify: Option<&'static str>,
        extract: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for Vision {
        fn model_name(&self) -> &str {
            "vision"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = request.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
            let reply = if text.contains("Classifique esta imagem") {
                self.classify
            } else if text.contains("Retorne APENAS um JSON") {
                self.extract
            } else {
                Some("Ótima refeição! Capriche nas verduras 🥗")
            };
            reply.map(CompletionResponse::text).ok_or_else(|| LlmError::RequestFailed {
                provider: "vision".into(),
                reason: "scripted failure".into(),
            })
        }
    }

    async fn router(vision: Vision) -> (ImageRouter, Arc<SessionAffinity>, LayeredMemory) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.create_user("u1", "+5511999990000").await.unwrap();
        db.upsert_profile(
            "u1",
            &ProfileDelta {
                age: Some(30),
                weight_kg: Some(80.0),
                height_cm: Some(180),
                goal: Some(Goal::LoseWeight),
                training_level: Some(TrainingLevel::Beginner),
                restrictions: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.mark_onboarding_completed("u1").await.unwrap();

        let llm: Arc<dyn LlmProvider> = Arc::new(vision);
        let memory = LayeredMemory::new(Arc::new(db), MemoryConfig::default());
        let affinity = Arc::new(SessionAffinity::new());
        let consultation = Arc::new(ConsultationHandler::new(
            llm.clone(),
            affinity.clone(),
            Duration::from_secs(1),
        ));
        let router = ImageRouter::new(llm, memory.clone(), consultation, 0.5, Duration::from_secs(1));
        (router, affinity, memory)
    }

    fn jpeg() -> ImageInput {
        ImageInput::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00])
    }

    #[tokio::test]
    async fn food_image_reaches_consultation() {
        let (router, affinity, memory) = router(Vision {
            classify: Some(r#"{"category": "food", "confidence": 0.8}"#),
            extract: Some(
                r#"{"food_items": ["arroz", "frango"], "estimated_calories": 520, "macronutrients": {"protein": 35, "carbs": 60, "fat": 12}}"#,
            ),
            ..Default::default()
        })
        .await;

        let envelope = router.route("u1", jpeg()).await.unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.handler, HandlerName::Consultation);
        assert!(envelope.response_text.contains("arroz, frango"));
        assert!(envelope.response_text.contains("520 kcal"));
        assert!(envelope.response_text.contains("Capriche nas verduras"));
        assert_eq!(envelope.metadata["image_category"], "food");
        assert_eq!(affinity.get_active("u1").await.unwrap().handler, HandlerName::Consultation);

        let ctx = memory.get_context("u1", HandlerType::Router).await;
        assert!(ctx.medium_term.summary.unwrap().starts_with("Imagem processada: food."));
        assert_eq!(ctx.medium_term.topic.as_deref(), Some("food"));
    }

    #[tokio::test]
    async fn low_confidence_gets_menu() {
        let (router, affinity, _) = router(Vision {
            classify: Some(r#"{"category": "food", "confidence": 0.3}"#),
            extract: None,
            ..Default::default()
        })
        .await;
        let envelope = router.route("u1", jpeg()).await.unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.handler, HandlerName::ImageRouter);
        assert_eq!(envelope.response_text, UNSUPPORTED_IMAGE);
        assert!(affinity.get_active("u1").await.is_none());
    }

    #[tokio::test]
    async fn vision_outage_gets_menu() {
        let (router, _, _) = router(Vision {
            classify: None,
            extract: None,
            ..Default::default()
        })
        .await;
        let envelope = router.route("u1", jpeg()).await.unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.response_text, UNSUPPORTED_IMAGE);
    }

    #[tokio::test]
    async fn failed_extraction_still_answers() {
        let (router, _, _) = router(Vision {
            classify: Some(r#"{"category": "exercise", "confidence": 0.9}"#),
            extract: None,
            ..Default::default()
        })
        .await;
        let envelope = router.route("u1", jpeg()).await.unwrap();
        assert_eq!(envelope.handler, HandlerName::Consultation);
        assert!(envelope.response_text.contains("Capriche"));
    }

    #[tokio::test]
    async fn empty_image_gets_menu() {
        let (router, _, _) = router(Vision {
            classify: Some(r#"{"category": "food", "confidence": 0.9}"#),
            extract: None,
            ..Default::default()
        })
        .await;
        let envelope = router.route("u1", ImageInput::from_bytes(Vec::new())).await.unwrap();
        assert_eq!(envelope.response_text, UNSUPPORTED_IMAGE);
    }

    #[tokio::test]
    async fn unregistered_user_gets_registration_without_vision_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, _, _) = router(Vision {
            classify: Some(r#"{"category": "food", "confidence": 0.9}"#),
            calls: calls.clone(),
            ..Default::default()
        })
        .await;

        let envelope = router.route("ghost", jpeg()).await.unwrap();
        assert_eq!(envelope.handler, HandlerName::Registration);
        assert_eq!(envelope.response_text, replies::REGISTRATION);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_onboarding_is_gated_before_vision() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, affinity, memory) = router(Vision {
            classify: Some(r#"{"category": "food", "confidence": 0.9}"#),
            calls: calls.clone(),
            ..Default::default()
        })
        .await;
        memory.database().create_user("u2", "+5511888880000").await.unwrap();

        let envelope = router.route("u2", jpeg()).await.unwrap();
        assert_eq!(envelope.response_text, crate::consultation::PROFILE_NEEDED);
        assert_eq!(envelope.handoff.unwrap().handler, HandlerName::Onboarding);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(affinity.get_active("u2").await.is_none());
    }
}
