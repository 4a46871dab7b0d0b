//! Scenario configuration for a conversation session.
//!
//! Covers everything the host passes into a session: which realtime
//! provider to use, the target language, the learner's proficiency level,
//! the assistant voice, and optional persona/topic color. Loaded from a
//! TOML file with env-var API keys, so a session is fully described by
//! one small config plus the environment.

use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};

// ── Target languages ─────────────────────────────────────────────

/// Languages the conversation partner can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    Es,
    En,
    Fr,
    De,
    It,
    Pt,
}

impl TargetLanguage {
    /// ISO 639-1 code string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Es => "es",
            Self::En => "en",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
        }
    }

    /// Human-readable language name, as used in model instructions.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Es => "Spanish",
            Self::En => "English",
            Self::Fr => "French",
            Self::De => "German",
            Self::It => "Italian",
            Self::Pt => "Portuguese",
        }
    }

    /// Parse from a code string (case-insensitive).
    pub fn from_str_code(code: &str) -> Option<Self> {
        match code.to_lowercase().as_str() {
            "es" => Some(Self::Es),
            "en" => Some(Self::En),
            "fr" => Some(Self::Fr),
            "de" => Some(Self::De),
            "it" => Some(Self::It),
            "pt" => Some(Self::Pt),
            _ => None,
        }
    }
}

// ── Proficiency levels ───────────────────────────────────────────

/// Learner proficiency level. Controls vocabulary, pacing, and which
/// ice-breaker pool opens the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proficiency {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

impl Proficiency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    pub fn from_str_code(code: &str) -> Option<Self> {
        match code.to_lowercase().as_str() {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }
}

// ── Ice-breaker pools ────────────────────────────────────────────

/// Opening prompts injected as a synthetic user turn when the transport
/// comes up, so the assistant speaks first. One pool per level; the
/// beginner pool stays in the present tense with simple vocabulary.
const BEGINNER_ICE_BREAKERS: &[&str] = &[
    "¡Hola! ¿Cómo te llamas?",
    "¿De dónde eres?",
    "¿Qué te gusta hacer?",
    "¿Tienes mascotas?",
    "¿Cuál es tu color favorito?",
    "¿Qué comida te gusta?",
];

const INTERMEDIATE_ICE_BREAKERS: &[&str] = &[
    "¡Hola! ¿Cómo estás hoy?",
    "¿Qué tal tu día hasta ahora?",
    "¿Qué te gustaría hacer hoy?",
    "¿Has practicado español antes?",
    "¿Qué tiempo hace donde estás?",
    "¿Qué planes tienes para el fin de semana?",
    "¿Qué libro estás leyendo?",
];

const ADVANCED_ICE_BREAKERS: &[&str] = &[
    "¡Hola! ¿Has leído algo interesante últimamente?",
    "¿Qué te motivó a aprender este idioma?",
    "¿Cómo ha influido la tecnología en tu vida diaria?",
    "¿Qué opinas sobre el impacto de las redes sociales?",
    "¿Qué rol juega el arte en tiempos de crisis?",
    "¿Cómo ha cambiado tu forma de consumir noticias?",
];

/// Fallback opener used when the target language has no dedicated pool.
const GENERIC_ICE_BREAKER: &str = "Hello! Please greet me and ask me an easy opening question.";

// ── Provider selection ───────────────────────────────────────────

/// Which realtime speech backend carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI Realtime: negotiated call plus a side channel for events.
    OpenAiRealtime,
    /// Gemini Live: one bidirectional streamed socket.
    GeminiLive,
}

impl ProviderKind {
    /// Model identifier string for API calls.
    pub fn model_id(self) -> &'static str {
        match self {
            Self::OpenAiRealtime => "gpt-realtime-mini-2025-12-15",
            Self::GeminiLive => "gemini-2.5-flash-native-audio-preview-12-2025",
        }
    }

    /// Environment variable holding the API key for this provider.
    pub fn api_key_var(self) -> &'static str {
        match self {
            Self::OpenAiRealtime => "OPENAI_API_KEY",
            Self::GeminiLive => "GEMINI_API_KEY",
        }
    }

    /// Microphone sample rate the provider expects (Hz, mono PCM16).
    pub fn input_sample_rate(self) -> u32 {
        match self {
            Self::OpenAiRealtime => 24000,
            Self::GeminiLive => 16000,
        }
    }

    /// Sample rate of synthesized audio coming back (Hz, mono PCM16).
    pub fn output_sample_rate(self) -> u32 {
        24000
    }
}

// ── Scenario configuration ───────────────────────────────────────

/// Full configuration for one conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Realtime backend.
    pub provider: ProviderKind,
    /// Language the assistant speaks.
    pub target_language: TargetLanguage,
    /// Learner level.
    pub proficiency: Proficiency,
    /// Assistant voice id (provider-specific name).
    pub voice: String,
    /// Optional persona for the assistant ("a friendly barista in Madrid").
    pub persona: Option<String>,
    /// Optional conversation topic.
    pub topic: Option<String>,
    /// Whether the assistant gently corrects learner mistakes.
    pub corrections: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAiRealtime,
            target_language: TargetLanguage::Es,
            proficiency: Proficiency::Intermediate,
            voice: "marin".to_string(),
            persona: None,
            topic: None,
            corrections: false,
        }
    }
}

impl ScenarioConfig {
    /// Load a scenario from a TOML file. Missing fields take defaults.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Resolve the provider API key from the environment.
    pub fn api_key(&self) -> anyhow::Result<String> {
        let var = self.provider.api_key_var();
        std::env::var(var).map_err(|_| anyhow::anyhow!("{var} is not set"))
    }

    /// Pick a random ice-breaker prompt for this scenario.
    ///
    /// Spanish sessions draw from a per-level pool; other languages get a
    /// generic opener, since the pools are curated per language. The
    /// ice-breaker always auto-sends once the transport is ready —
    /// persona/topic are optional color, never a start precondition.
    pub fn ice_breaker(&self) -> String {
        if self.target_language != TargetLanguage::Es {
            return GENERIC_ICE_BREAKER.to_string();
        }
        let pool = match self.proficiency {
            Proficiency::Beginner => BEGINNER_ICE_BREAKERS,
            Proficiency::Intermediate => INTERMEDIATE_ICE_BREAKERS,
            Proficiency::Advanced => ADVANCED_ICE_BREAKERS,
        };
        let mut rng = rand::rng();
        pool.choose(&mut rng)
            .copied()
            .unwrap_or(GENERIC_ICE_BREAKER)
            .to_string()
    }

    /// Build the system prompt for the session.
    pub fn build_system_prompt(&self) -> String {
        let language = self.target_language.display_name();

        let level_instruction = match self.proficiency {
            Proficiency::Beginner => {
                "Use simple vocabulary and short sentences. Speak slowly, stay in the \
                 present tense, and repeat important words. Be very patient and encouraging."
            }
            Proficiency::Intermediate => {
                "Use moderate vocabulary and natural phrasing. Past and future tenses \
                 are fine. Keep responses short and conversational, and ask follow-up \
                 questions to keep the conversation flowing."
            }
            Proficiency::Advanced => {
                "Use rich vocabulary, idiomatic expressions, and complex structures. \
                 Discuss abstract topics and keep the conversation challenging."
            }
        };

        let corrections_instruction = if self.corrections {
            " Subtly correct grammatical mistakes when appropriate."
        } else {
            ""
        };

        let persona_instruction = self
            .persona
            .as_deref()
            .map(|p| format!(" Stay in character as {p}."))
            .unwrap_or_default();

        let topic_instruction = self
            .topic
            .as_deref()
            .map(|t| format!(" Steer the conversation toward {t}."))
            .unwrap_or_default();

        format!(
            "You are a friendly conversation partner for practicing {language}. \
             ALWAYS respond in neutral {language}. {level_instruction}\
             {corrections_instruction}{persona_instruction}{topic_instruction} \
             Do not greet repeatedly; greet only once at the start."
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn language_code_roundtrip() {
        for lang in [
            TargetLanguage::Es,
            TargetLanguage::En,
            TargetLanguage::Fr,
            TargetLanguage::De,
            TargetLanguage::It,
            TargetLanguage::Pt,
        ] {
            assert_eq!(TargetLanguage::from_str_code(lang.as_str()), Some(lang));
        }
        assert_eq!(TargetLanguage::from_str_code("xx"), None);
    }

    #[test]
    fn proficiency_parse_case_insensitive() {
        assert_eq!(
            Proficiency::from_str_code("Beginner"),
            Some(Proficiency::Beginner)
        );
        assert_eq!(Proficiency::from_str_code(""), None);
        assert_eq!(Proficiency::default(), Proficiency::Intermediate);
    }

    #[test]
    fn provider_sample_rates() {
        assert_eq!(ProviderKind::OpenAiRealtime.input_sample_rate(), 24000);
        assert_eq!(ProviderKind::GeminiLive.input_sample_rate(), 16000);
        assert_eq!(ProviderKind::GeminiLive.output_sample_rate(), 24000);
    }

    #[test]
    fn ice_breaker_comes_from_level_pool() {
        let config = ScenarioConfig {
            proficiency: Proficiency::Beginner,
            ..Default::default()
        };
        for _ in 0..20 {
            let prompt = config.ice_breaker();
            assert!(
                BEGINNER_ICE_BREAKERS.contains(&prompt.as_str()),
                "unexpected prompt: {prompt}"
            );
        }
    }

    #[test]
    fn ice_breaker_generic_for_other_languages() {
        let config = ScenarioConfig {
            target_language: TargetLanguage::Fr,
            ..Default::default()
        };
        assert_eq!(config.ice_breaker(), GENERIC_ICE_BREAKER);
    }

    #[test]
    fn system_prompt_reflects_scenario() {
        let config = ScenarioConfig {
            target_language: TargetLanguage::Es,
            proficiency: Proficiency::Beginner,
            corrections: true,
            persona: Some("a friendly barista in Madrid".to_string()),
            topic: Some("ordering coffee".to_string()),
            ..Default::default()
        };
        let prompt = config.build_system_prompt();
        assert!(prompt.contains("Spanish"));
        assert!(prompt.contains("present tense"));
        assert!(prompt.contains("correct grammatical mistakes"));
        assert!(prompt.contains("barista"));
        assert!(prompt.contains("ordering coffee"));
    }

    #[test]
    fn system_prompt_omits_optional_sections() {
        let prompt = ScenarioConfig::default().build_system_prompt();
        assert!(!prompt.contains("Stay in character"));
        assert!(!prompt.contains("correct grammatical mistakes"));
    }

    #[test]
    fn load_toml_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "provider = \"gemini_live\"\nproficiency = \"advanced\"\nvoice = \"Aoede\""
        )
        .unwrap();

        let config = ScenarioConfig::load(file.path()).unwrap();
        assert_eq!(config.provider, ProviderKind::GeminiLive);
        assert_eq!(config.proficiency, Proficiency::Advanced);
        assert_eq!(config.voice, "Aoede");
        // Defaults fill the rest
        assert_eq!(config.target_language, TargetLanguage::Es);
        assert!(!config.corrections);
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider = \"smoke_signals\"").unwrap();
        assert!(ScenarioConfig::load(file.path()).is_err());
    }
}
