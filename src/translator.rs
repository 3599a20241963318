//! # Translator Seam
//!
//! Speech-to-text, translation, and text-to-speech are external
//! collaborators; this module only fixes their interface: source PCM in,
//! per-language audio chunks out. The broadcast pipeline drives the trait and
//! never looks inside it.

use anyhow::Result;
use async_trait::async_trait;

/// One language's rendering of a piece of source audio.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedChunk {
    pub target_language: String,
    /// 16-bit LE PCM
    pub payload: Vec<u8>,
    pub duration_ms: u32,
}

/// Produces translated audio for every requested target language.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        session_id: &str,
        source_language: &str,
        target_languages: &[String],
        pcm: &[u8],
    ) -> Result<Vec<TranslatedChunk>>;
}

/// Development/test translator: relays the source audio unchanged to every
/// requested language. Codec conversion is out of scope by contract.
pub struct PassthroughTranslator {
    sample_rate: u32,
    channels: u8,
}

impl PassthroughTranslator {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    fn duration_ms(&self, pcm: &[u8]) -> u32 {
        let samples = pcm.len() / 2;
        let per_ms = (self.sample_rate as usize * self.channels as usize) / 1000;
        (samples / per_ms.max(1)) as u32
    }
}

#[async_trait]
impl Translator for PassthroughTranslator {
    async fn translate(
        &self,
        _session_id: &str,
        _source_language: &str,
        target_languages: &[String],
        pcm: &[u8],
    ) -> Result<Vec<TranslatedChunk>> {
        let duration_ms = self.duration_ms(pcm);
        Ok(target_languages
            .iter()
            .map(|language| TranslatedChunk {
                target_language: language.clone(),
                payload: pcm.to_vec(),
                duration_ms,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_fans_out_per_language() {
        let translator = PassthroughTranslator::new(1000, 1);
        // 100 samples at 1kHz mono = 100ms
        let pcm = vec![0u8; 200];
        let chunks = translator
            .translate(
                "golden-eagle-427",
                "en",
                &["es".to_string(), "fr".to_string()],
                &pcm,
            )
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].target_language, "es");
        assert_eq!(chunks[1].target_language, "fr");
        assert!(chunks.iter().all(|c| c.duration_ms == 100));
        assert!(chunks.iter().all(|c| c.payload == pcm));
    }
}
