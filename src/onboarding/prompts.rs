//! Onboarding copy: questions, confirmations, re-prompts and profile views.

use crate::profile::{FieldValue, Profile, ProfileField};
use crate::replies::CAPABILITY_MENU;

use super::state::OnboardingStep;

pub const FIRST_WELCOME: &str = "\
👋 **Bem-vindo ao BodyFlow!**\n\n\
Vou te ajudar a criar seu perfil personalizado para treinos e dietas.\n\n\
Vamos começar com algumas informações básicas:\n\n\
**Qual sua idade?**";

pub const ALREADY_COMPLETE: &str = "Seu perfil já está completo! Como posso ajudar você hoje?";

/// Question asked to collect `field`.
pub fn question(field: ProfileField) -> &'static str {
    match field {
        ProfileField::Age => "**Qual sua idade?**",
        ProfileField::Weight => "Agora preciso do seu **peso**:\n\n**Qual seu peso atual?**",
        ProfileField::Height => "Agora preciso da sua **altura**:\n\n**Qual sua altura?**",
        ProfileField::Goal => {
            "Agora me conte: **Qual seu principal objetivo?**\n\n\
             🔥 Perder peso\n\
             💪 Ganhar massa\n\
             🏃 Condicionamento\n\
             ⚖️ Manter peso"
        }
        ProfileField::TrainingLevel => {
            "Agora preciso saber seu **nível de treino atual**:\n\n\
             🟢 **Iniciante** → Nunca treinei ou treino há menos de 6 meses\n\
             🟡 **Intermediário** → Treino de 6 meses a 2 anos\n\
             🔴 **Avançado** → Treino há mais de 2 anos\n\n\
             Qual melhor descreve você?"
        }
        ProfileField::Restrictions => {
            "Por último, tem alguma **restrição ou limitação**?\n\n\
             🚫 Lesões ou dores\n\
             🚫 Restrições alimentares (vegetariano, intolerâncias, alergias)\n\
             🚫 Limitações de horário ou equipamento\n\n\
             Descreva suas limitações ou digite \"nenhuma\"."
        }
    }
}

/// Question for a step, empty for non-collection steps.
pub fn step_question(step: OnboardingStep) -> &'static str {
    step.field().map(question).unwrap_or_default()
}

/// Confirmation line after a field is stored.
pub fn confirmation(value: &FieldValue) -> String {
    match value {
        FieldValue::Age(age) => format!("✅ Idade registrada: {age} anos"),
        FieldValue::Weight(_) => format!("✅ Peso registrado: {}", value.display()),
        FieldValue::Height(_) => format!("✅ Altura registrada: {}", value.display()),
        FieldValue::Goal(goal) => format!("✅ Objetivo registrado: {}", goal.label()),
        FieldValue::TrainingLevel(level) => format!("✅ Nível de treino registrado: {}", level.label()),
        FieldValue::Restrictions(_) => format!("✅ Restrições registradas: {}", value.display()),
    }
}

/// Re-ask after an answer could not be understood.
pub fn reprompt(field: ProfileField) -> &'static str {
    match field {
        ProfileField::Age => "Não consegui entender sua idade. Pode me dizer quantos anos você tem?",
        ProfileField::Weight => "Não consegui entender seu peso. Pode me dizer quanto você pesa?",
        ProfileField::Height => "Não consegui entender sua altura. Pode me dizer qual sua altura?",
        ProfileField::Goal => "Por favor, escolha um dos objetivos listados ou descreva seu objetivo.",
        ProfileField::TrainingLevel => "Por favor, escolha seu nível de treino atual.",
        ProfileField::Restrictions => {
            "Não consegui entender. Descreva suas restrições ou digite \"nenhuma\"."
        }
    }
}

pub fn welcome_back(profile: &Profile, next: OnboardingStep) -> String {
    format!(
        "👋 **Bem-vindo de volta ao BodyFlow!**\n\n\
         Vejo que você já começou a criar seu perfil personalizado. Vamos continuar de onde paramos!\n\n\
         📊 **Dados já coletados:**\n{}\n\n\
         Vamos continuar com as próximas informações:\n\n{}",
        profile.summary_lines(),
        step_question(next),
    )
}

pub fn completion(profile: &Profile) -> String {
    format!(
        "🎉 **Perfil criado com sucesso!**\n\n\
         📋 **Seus dados:**\n{}\n\n\
         Agora posso te ajudar com:\n\n{CAPABILITY_MENU}",
        profile.summary_lines(),
    )
}

pub fn profile_view(profile: &Profile) -> String {
    format!(
        "📋 **Seu Perfil Atual**\n\n{}\n\n\
         🔄 **Para atualizar alguma informação, me diga qual campo você quer alterar:**\n\n\
         • \"Meu peso agora é 75kg\"\n\
         • \"Quero mudar meu objetivo para ganhar massa\"\n\
         • \"Agora sou intermediário\"\n\n\
         Ou você pode dizer \"atualizar [campo específico]\" como \"atualizar peso\".",
        profile.summary_lines(),
    )
}

/// Reply after an out-of-flow field update succeeded.
pub fn updated(value: &FieldValue) -> String {
    format!(
        "✅ **{} atualizado para: {}**\n\nComo posso ajudar você hoje?",
        capitalize(value.field().label()),
        value.display(),
    )
}

/// Ask for the new value when an update request did not carry one.
pub fn update_ask(field: ProfileField) -> &'static str {
    match field {
        ProfileField::Age => "🎂 **Atualizar Idade**\n\nPara atualizar sua idade, me diga quantos anos você tem.",
        ProfileField::Weight => {
            "📏 **Atualizar Peso**\n\nPara atualizar seu peso, me diga qual é seu peso atual."
        }
        ProfileField::Height => {
            "📐 **Atualizar Altura**\n\nPara atualizar sua altura, me diga qual é sua altura atual."
        }
        ProfileField::Goal => {
            "🎯 **Atualizar Objetivo**\n\nPara atualizar seu objetivo, me diga qual é seu novo objetivo: \
             perder peso, ganhar massa, condicionamento ou manter peso."
        }
        ProfileField::TrainingLevel => {
            "🏋️ **Atualizar Nível de Treino**\n\nPara atualizar seu nível, me diga se você é \
             iniciante, intermediário ou avançado."
        }
        ProfileField::Restrictions => {
            "🚫 **Atualizar Restrições**\n\nPara atualizar suas restrições alimentares, me diga quais são."
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Goal;

    #[test]
    fn every_collection_step_has_a_question() {
        for field in ProfileField::ORDER {
            assert!(!question(field).is_empty());
            assert!(!reprompt(field).is_empty());
            assert!(!update_ask(field).is_empty());
        }
        assert_eq!(step_question(OnboardingStep::Completion), "");
    }

    #[test]
    fn confirmations() {
        assert_eq!(confirmation(&FieldValue::Age(25)), "✅ Idade registrada: 25 anos");
        assert_eq!(confirmation(&FieldValue::Weight(72.5)), "✅ Peso registrado: 72.5 kg");
        assert_eq!(confirmation(&FieldValue::Height(180)), "✅ Altura registrada: 180 cm");
        assert_eq!(
            confirmation(&FieldValue::Goal(Goal::LoseWeight)),
            "✅ Objetivo registrado: perder peso"
        );
    }

    #[test]
    fn update_reply_capitalizes_label() {
        assert_eq!(
            updated(&FieldValue::Weight(82.0)),
            "✅ **Peso atualizado para: 82 kg**\n\nComo posso ajudar você hoje?"
        );
    }

    #[test]
    fn welcome_back_recaps_and_asks_next() {
        let profile = Profile {
            age: Some(25),
            ..Default::default()
        };
        let text = welcome_back(&profile, OnboardingStep::Weight);
        assert!(text.contains("• **Idade:** 25 anos"));
        assert!(text.ends_with("**Qual seu peso atual?**"));
    }
}
