//! Canned user-facing replies shared across handlers.
//!
//! All copy is Brazilian Portuguese with Markdown emphasis, which both the
//! HTTP clients and the Telegram transport render.

/// Capability menu appended to greetings, clarifications and completion.
pub const CAPABILITY_MENU: &str = "\
🏃‍♂️ **Treino sob medida** → Monto um plano de treino para o seu objetivo\n\
🥗 **Alimentação ajustada** → Monto uma dieta de acordo com sua rotina\n\
📊 **Análise corporal** → Analiso sua bioimpedância e composição corporal\n\
🍽️ **Receitas fitness** → Sugiro receitas saudáveis e práticas\n\n\
💪 **Escolha uma opção ou me diga direto seu objetivo que eu preparo algo pra você!**";

/// Generic failure reply. Never carries error detail.
pub const APOLOGY: &str = "Desculpe, ocorreu um erro ao processar sua mensagem.";

pub const REGISTRATION: &str = "\
🎉 **Bem-vindo ao BodyFlow.ai!**\n\n\
Para usar todos os recursos do seu personal trainer e nutricionista digital, \
você precisa criar sua conta.\n\n\
🔗 **Cadastre-se em:** bodyflow.ai\n\n\
Depois do cadastro, volte aqui e compartilhe seu contato para começarmos!";

/// Reply to a returning, fully onboarded user who shares their contact.
pub const CONTACT_WELCOME_BACK: &str = "\
🎉 **Bem-vindo de volta ao BodyFlow!**\n\n\
Agora posso te ajudar com:\n\
🏃‍♂️ **Treinos personalizados**\n\
🥗 **Dietas específicas** \n\
📊 **Análise de bioimpedância**\n\
🍽️ **Receitas fitness**\n\n\
O que você gostaria de fazer hoje?";

pub fn support() -> String {
    format!("🤝 **Como posso te ajudar?**\n\nPosso te auxiliar com:\n\n{CAPABILITY_MENU}")
}

pub fn greeting(name: Option<&str>) -> String {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| format!(", {n}"))
        .unwrap_or_default();
    format!(
        "👋 **Olá{name}!**\n\nQue bom te ver de volta! 😊\n\nComo posso te ajudar hoje?\n\n{CAPABILITY_MENU}"
    )
}

pub fn clarification() -> String {
    format!(
        "🤔 **Não consegui entender exatamente o que você precisa.**\n\n\
         Mas posso te ajudar com várias coisas! Escolha uma opção ou me diga direto seu objetivo:\n\n\
         {CAPABILITY_MENU}"
    )
}

/// Rolling session summary written after every turn.
pub fn session_summary(label: &str, response: &str) -> String {
    let head: String = response.chars().take(100).collect();
    format!("Última intenção: {label}. Resposta: {head}...")
}
