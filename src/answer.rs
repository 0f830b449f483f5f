use anyhow::Result;

pub const NO_INFORMATION_ANSWER: &str = "No relevant information found in memory.";

/// Turns a question plus retrieved context into an answer. The answer stage is its only caller.
pub trait AnswerProvider {
    fn name(&self) -> &str;

    fn answer(&self, question: &str, context: &str) -> Result<String>;
}

/// Answers with the best-ranked context line, with any `[timestamp] speaker:` prefix removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveAnswerer;

impl AnswerProvider for ExtractiveAnswerer {
    fn name(&self) -> &str {
        "extractive"
    }

    fn answer(&self, _question: &str, context: &str) -> Result<String> {
        let Some(line) = context.lines().map(str::trim).find(|line| !line.is_empty()) else {
            return Ok(NO_INFORMATION_ANSWER.to_string());
        };

        Ok(strip_speaker_prefix(line).to_string())
    }
}

fn strip_speaker_prefix(line: &str) -> &str {
    let without_timestamp = match line.strip_prefix('[') {
        Some(rest) => rest.split_once("] ").map(|(_, tail)| tail).unwrap_or(line),
        None => line,
    };

    match without_timestamp.split_once(": ") {
        Some((speaker, content)) if !speaker.is_empty() && !speaker.contains(' ') => content,
        _ => without_timestamp,
    }
}
