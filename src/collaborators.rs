//! Collaborator seams consumed by the engine.
//!
//! The core treats these as narrow interfaces owned by the caller
//! (CLI/GUI layer): `SubtitleIO` opens/saves a cue sequence, `PromptSource`
//! composes the system+user message pair for one cue, and `Clock` supplies
//! wall time for stats and rate limiting. The engine never inspects a
//! `PromptSource`'s output and never assumes a concrete subtitle format;
//! the implementations below are the minimal ones needed to exercise the
//! engine end to end, not a production format stack (parsers/writers for
//! SRT/VTT/ASS/SSA are explicitly out of core scope).

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::Cue;
use crate::provider::ProviderKind;

/// Opens and saves a sequence of timed cues for one file. A real
/// deployment backs this with format-specific parsers (SRT/VTT/ASS/SSA);
/// the core only calls through this trait and never inspects file bytes
/// directly.
pub trait SubtitleIO: Send + Sync {
    fn open(&self, path: &Path) -> anyhow::Result<Vec<Cue>>;
    fn save(&self, path: &Path, cues: &[Cue]) -> anyhow::Result<()>;
}

/// The system+user message pair for one cue, handed to a `Provider`
/// without the engine ever inspecting its contents.
#[derive(Debug, Clone)]
pub struct PromptMessages {
    pub system: String,
    pub user: String,
}

/// Builds a `PromptMessages` pair for one cue. Implementations may vary
/// the wording by `ProviderKind`/`model_id` (e.g. a local model tuned for
/// a terser instruction style); the engine only ever calls `build` and
/// forwards the result to a `Provider`.
pub trait PromptSource: Send + Sync {
    fn build(
        &self,
        source: &str,
        context_texts: &[&str],
        provider_kind: ProviderKind,
        model_id: &str,
    ) -> PromptMessages;
}

/// Minimal template-based `PromptSource`: a fixed system instruction
/// naming the source/target languages, and a user message carrying the
/// context window plus the line to translate. Good enough to exercise
/// the engine and provider clients; a production prompt editor is an
/// out-of-scope collaborator concern.
pub struct TemplatePromptSource {
    source_lang: String,
    target_lang: String,
}

impl TemplatePromptSource {
    pub fn new(source_lang: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        }
    }
}

impl PromptSource for TemplatePromptSource {
    fn build(
        &self,
        source: &str,
        context_texts: &[&str],
        _provider_kind: ProviderKind,
        _model_id: &str,
    ) -> PromptMessages {
        let system = format!(
            "Translate subtitle lines from {} to {}. Preserve meaning and tone, \
             keep the line count the same, and reply with the translation only.",
            self.source_lang, self.target_lang
        );

        let user = if context_texts.is_empty() {
            source.to_string()
        } else {
            format!("Context:\n{}\n\nTranslate:\n{}", context_texts.join("\n"), source)
        };

        PromptMessages { system, user }
    }
}

/// Wall time for stats and rate-limit windows, threaded in so tests can
/// substitute a controllable clock instead of `Utc::now()`/`Instant::now()`.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What the caller decided when asked about an existing output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteDecision {
    Overwrite,
    Rename,
    Skip,
}

/// Blocking callback consulted when `overwrite_policy = Ask` and the
/// computed output path already exists.
pub trait OverwriteAsker: Send + Sync {
    fn ask(&self, path: &Path) -> OverwriteDecision;
}

/// A minimal SRT reader/writer, sufficient to round-trip cues for tests
/// and as a default `SubtitleIO`. Timestamps are `HH:MM:SS,mmm`; blocks
/// are separated by a blank line. Parsing SRT/VTT/ASS/SSA generally is
/// out of core scope; this exists only to give the engine something
/// concrete to drive.
pub struct SrtIo;

impl SrtIo {
    fn format_timestamp(d: Duration) -> String {
        let total_ms = d.as_millis();
        let ms = total_ms % 1000;
        let total_secs = total_ms / 1000;
        let secs = total_secs % 60;
        let total_mins = total_secs / 60;
        let mins = total_mins % 60;
        let hours = total_mins / 60;
        format!("{:02}:{:02}:{:02},{:03}", hours, mins, secs, ms)
    }

    fn parse_timestamp(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        let (hms, ms) = s
            .split_once(',')
            .or_else(|| s.split_once('.'))
            .ok_or_else(|| anyhow::anyhow!("malformed SRT timestamp: {s}"))?;
        let mut parts = hms.split(':');
        let hours: u64 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing hours in timestamp: {s}"))?
            .parse()?;
        let mins: u64 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing minutes in timestamp: {s}"))?
            .parse()?;
        let secs: u64 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing seconds in timestamp: {s}"))?
            .parse()?;
        let millis: u64 = ms.trim().parse()?;
        Ok(Duration::from_millis(
            ((hours * 3600 + mins * 60 + secs) * 1000) + millis,
        ))
    }
}

impl SubtitleIO for SrtIo {
    fn open(&self, path: &Path) -> anyhow::Result<Vec<Cue>> {
        let raw = std::fs::read_to_string(path)?;
        // Strip a leading UTF-8 BOM if present.
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);

        let mut cues = Vec::new();
        for block in raw.split("\r\n\r\n").flat_map(|b| b.split("\n\n")) {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            let mut lines = block.lines();
            let Some(index_line) = lines.next() else {
                continue;
            };
            let index: usize = match index_line.trim().parse() {
                Ok(i) => i,
                Err(_) => continue,
            };
            let Some(time_line) = lines.next() else {
                continue;
            };
            let Some((start_raw, end_raw)) = time_line.split_once("-->") else {
                continue;
            };
            let start = Self::parse_timestamp(start_raw)?;
            let end = Self::parse_timestamp(end_raw)?;
            let text = lines.collect::<Vec<_>>().join("\n");

            cues.push(Cue {
                index: index.saturating_sub(1),
                start,
                end,
                text,
            });
        }
        cues.sort_by_key(|c| c.index);
        Ok(cues)
    }

    fn save(&self, path: &Path, cues: &[Cue]) -> anyhow::Result<()> {
        let mut out = String::new();
        for cue in cues {
            out.push_str(&(cue.index + 1).to_string());
            out.push('\n');
            out.push_str(&Self::format_timestamp(cue.start));
            out.push_str(" --> ");
            out.push_str(&Self::format_timestamp(cue.end));
            out.push('\n');
            out.push_str(&cue.text);
            out.push_str("\n\n");
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srt_round_trips_basic_cues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.srt");
        let cues = vec![
            Cue {
                index: 0,
                start: Duration::from_millis(1000),
                end: Duration::from_millis(2500),
                text: "Hello.".to_string(),
            },
            Cue {
                index: 1,
                start: Duration::from_millis(3000),
                end: Duration::from_millis(4200),
                text: "Line one\nLine two".to_string(),
            },
        ];
        let io = SrtIo;
        io.save(&path, &cues).unwrap();
        let loaded = io.open(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text, "Hello.");
        assert_eq!(loaded[0].start, Duration::from_millis(1000));
        assert_eq!(loaded[1].text, "Line one\nLine two");
    }

    #[test]
    fn srt_open_strips_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bom.srt");
        std::fs::write(&path, "\u{feff}1\n00:00:01,000 --> 00:00:02,000\nHi.\n\n").unwrap();
        let cues = SrtIo.open(&path).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "Hi.");
    }

    #[test]
    fn template_prompt_source_embeds_languages_and_context() {
        let source = TemplatePromptSource::new("en", "fr");
        let messages = source.build("Hello.", &["Hi.", "Bye."], ProviderKind::LocalHttp, "model-a");
        assert!(messages.system.contains("en"));
        assert!(messages.system.contains("fr"));
        assert!(messages.user.contains("Hi."));
        assert!(messages.user.contains("Hello."));
    }
}
